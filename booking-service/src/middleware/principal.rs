//! Principal extraction.
//!
//! The upstream authorization gate authenticates the caller and forwards its
//! identity in `X-User-ID` / `X-User-Role`. This service trusts those headers
//! and does no authentication of its own.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{Principal, Role};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-user-role";

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing {} header", name)))
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = Uuid::parse_str(header(parts, USER_ID_HEADER)?).map_err(|_| {
            AppError::Unauthorized(anyhow::anyhow!("Malformed {} header", USER_ID_HEADER))
        })?;
        let role: Role = header(parts, ROLE_HEADER)?
            .parse()
            .map_err(|e: String| AppError::Unauthorized(anyhow::anyhow!(e)))?;

        tracing::Span::current().record("principal_id", tracing::field::display(id));

        Ok(Principal::new(id, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(headers: &[(&str, &str)]) -> Result<Principal, AppError> {
        let mut builder = Request::builder().uri("/bookings");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Principal::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_identity_headers() {
        let id = Uuid::new_v4();
        let raw = id.to_string();
        let principal = extract(&[(USER_ID_HEADER, raw.as_str()), (ROLE_HEADER, "Provider")])
            .await
            .unwrap();
        assert_eq!(principal, Principal::new(id, Role::Provider));
    }

    #[tokio::test]
    async fn missing_or_bad_headers_are_unauthenticated() {
        let err = extract(&[(ROLE_HEADER, "customer")]).await.unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");

        let id = Uuid::new_v4().to_string();
        let err = extract(&[(USER_ID_HEADER, id.as_str()), (ROLE_HEADER, "superuser")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");
    }
}
