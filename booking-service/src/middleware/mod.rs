pub mod principal;

pub use principal::{ROLE_HEADER, USER_ID_HEADER};
