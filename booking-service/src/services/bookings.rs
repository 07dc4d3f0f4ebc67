//! Booking state machine.

use chrono::{NaiveDate, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::catalog::ServiceCatalog;
use super::events::{DomainEvent, EventSink};
use super::metrics;
use super::rating::RatingAggregator;
use super::repository::{BookingScope, Repository};
use super::retry_on_conflict;
use crate::models::{
    is_permitted, is_reachable, ActorKind, Booking, BookingStatus, Feedback, Principal,
    ProviderRating, RatingEntry, Role, TimeWindow,
};

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub service_id: Uuid,
    pub date: NaiveDate,
    pub time_window: Option<TimeWindow>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub booking: Booking,
    /// `None` when the feedback is stored but the provider aggregate has not
    /// absorbed it yet; the reconciler finishes the job.
    pub provider_rating: Option<ProviderRating>,
}

/// Result of driving a booking from a captured payment.
#[derive(Debug, Clone)]
pub enum Settlement {
    Confirmed(Booking),
    AlreadyConfirmed(Booking),
    /// The booking was canceled before the money arrived.
    Inactive(Booking),
}

#[derive(Clone)]
pub struct BookingService {
    repo: Arc<dyn Repository>,
    catalog: Arc<dyn ServiceCatalog>,
    ratings: RatingAggregator,
    events: Arc<dyn EventSink>,
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Booking {} not found", id))
}

impl BookingService {
    pub fn new(
        repo: Arc<dyn Repository>,
        catalog: Arc<dyn ServiceCatalog>,
        ratings: RatingAggregator,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            repo,
            catalog,
            ratings,
            events,
        }
    }

    async fn load(&self, id: Uuid) -> Result<Booking, AppError> {
        self.repo.get_booking(id).await?.ok_or_else(|| not_found(id))
    }

    /// Load a booking the principal is allowed to see.
    pub async fn get(&self, principal: &Principal, id: Uuid) -> Result<Booking, AppError> {
        let booking = self.load(id).await?;
        if principal.is_admin() || booking.is_party(principal.id, principal.role) {
            Ok(booking)
        } else {
            Err(AppError::Forbidden(anyhow::anyhow!(
                "Not a party to booking {}",
                id
            )))
        }
    }

    pub async fn list_mine(&self, principal: &Principal) -> Result<Vec<Booking>, AppError> {
        let scope = match principal.role {
            Role::Customer => BookingScope::Customer(principal.id),
            Role::Provider => BookingScope::Provider(principal.id),
            Role::Admin => BookingScope::All,
        };
        self.repo.list_bookings(scope).await
    }

    #[instrument(skip(self, principal, request), fields(customer_id = %principal.id, service_id = %request.service_id))]
    pub async fn create(
        &self,
        principal: &Principal,
        request: NewBooking,
    ) -> Result<Booking, AppError> {
        if principal.role != Role::Customer {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Only customers can create bookings"
            )));
        }
        validate_schedule(request.date, request.time_window)?;

        let service = self.catalog.get_service(request.service_id).await?;
        if !service.is_available {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Service {} is not available for booking",
                service.id
            )));
        }

        // The provider is copied from the service once and never re-joined.
        let booking = Booking::new(
            principal.id,
            service.provider_id,
            service.id,
            request.date,
            request.time_window,
            request.notes,
        );
        self.repo.insert_booking(&booking).await?;

        tracing::info!(booking_id = %booking.id, provider_id = %booking.provider_id, "Booking created");
        metrics::record_transition(BookingStatus::Pending.as_str(), "customer");
        self.events.emit(DomainEvent::BookingCreated {
            booking_id: booking.id,
            customer_id: booking.customer_id,
            provider_id: booking.provider_id,
        });
        Ok(booking)
    }

    /// Move a booking to `target` on behalf of `principal`.
    #[instrument(skip(self, principal, reason), fields(actor_id = %principal.id, role = ?principal.role))]
    pub async fn transition(
        &self,
        principal: &Principal,
        id: Uuid,
        target: BookingStatus,
        reason: Option<String>,
    ) -> Result<Booking, AppError> {
        let mut booking = self.load(id).await?;
        let actor = ActorKind::from(principal.role);

        if !principal.is_admin() && !booking.is_party(principal.id, principal.role) {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Not a party to booking {}",
                id
            )));
        }
        if !is_reachable(booking.status, target) {
            return Err(AppError::InvalidTransition(anyhow::anyhow!(
                "Cannot move booking from {} to {}",
                booking.status,
                target
            )));
        }
        if !is_permitted(booking.status, target, actor) {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "A {:?} may not move a booking from {} to {}",
                principal.role,
                booking.status,
                target
            )));
        }

        let from = booking.status;
        booking.apply_status(target, actor, Some(principal.id), reason);
        self.repo.update_booking(&mut booking).await?;

        tracing::info!(booking_id = %id, from = %from, to = %target, "Booking status changed");
        metrics::record_transition(target.as_str(), actor_label(actor));
        self.events.emit(DomainEvent::BookingStatusChanged {
            booking_id: id,
            from,
            to: target,
        });
        Ok(booking)
    }

    /// Confirm a booking because its payment was captured. Idempotent.
    #[instrument(skip(self))]
    pub async fn confirm_from_settlement(&self, id: Uuid) -> Result<Settlement, AppError> {
        retry_on_conflict(|| async move {
            let mut booking = self.load(id).await?;
            match booking.status {
                BookingStatus::Pending => {}
                BookingStatus::Confirmed | BookingStatus::Completed => {
                    return Ok(Settlement::AlreadyConfirmed(booking));
                }
                BookingStatus::Canceled => return Ok(Settlement::Inactive(booking)),
            }

            booking.apply_status(
                BookingStatus::Confirmed,
                ActorKind::Settlement,
                None,
                None,
            );
            self.repo.update_booking(&mut booking).await?;

            tracing::info!(booking_id = %id, "Booking confirmed by payment");
            metrics::record_transition(BookingStatus::Confirmed.as_str(), "settlement");
            self.events.emit(DomainEvent::BookingStatusChanged {
                booking_id: id,
                from: BookingStatus::Pending,
                to: BookingStatus::Confirmed,
            });
            Ok(Settlement::Confirmed(booking))
        })
        .await
    }

    /// Store the customer's feedback, then fold it into the provider's
    /// rating. Feedback is written first with `rating_applied = false`, so a
    /// crash between the two steps is repaired by
    /// [`Self::complete_pending_rating`].
    #[instrument(skip(self, principal, review), fields(customer_id = %principal.id))]
    pub async fn attach_feedback(
        &self,
        principal: &Principal,
        id: Uuid,
        rating: u8,
        review: String,
    ) -> Result<FeedbackOutcome, AppError> {
        if !(1..=5).contains(&rating) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Rating must be between 1 and 5"
            )));
        }

        let mut booking = self.load(id).await?;
        if principal.role != Role::Customer || booking.customer_id != principal.id {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Only the booking's customer can leave feedback"
            )));
        }
        if booking.status != BookingStatus::Completed {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Feedback requires a completed booking, this one is {}",
                booking.status
            )));
        }
        if booking.customer_feedback.is_some() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Booking {} already has feedback",
                id
            )));
        }

        booking.customer_feedback = Some(Feedback {
            rating,
            review,
            submitted_at: Utc::now(),
            rating_applied: false,
        });
        booking.updated_at = Utc::now();
        // A concurrent duplicate submission loses here with `Conflict`.
        self.repo.update_booking(&mut booking).await?;

        self.events.emit(DomainEvent::FeedbackSubmitted {
            booking_id: booking.id,
            provider_id: booking.provider_id,
            rating,
        });

        match self.complete_pending_rating(booking.clone()).await {
            Ok((booking, rating)) => Ok(FeedbackOutcome {
                booking,
                provider_rating: Some(rating),
            }),
            Err(e) => {
                tracing::warn!(booking_id = %id, error = %e, "Rating aggregation deferred");
                Ok(FeedbackOutcome {
                    booking,
                    provider_rating: None,
                })
            }
        }
    }

    /// Apply a stored-but-unapplied feedback to the provider aggregate and
    /// mark it applied.
    #[instrument(skip(self, booking), fields(booking_id = %booking.id))]
    pub async fn complete_pending_rating(
        &self,
        booking: Booking,
    ) -> Result<(Booking, ProviderRating), AppError> {
        let Some(feedback) = booking.customer_feedback.clone() else {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Booking {} has no feedback",
                booking.id
            )));
        };

        let rating = self
            .ratings
            .apply_feedback(
                booking.provider_id,
                RatingEntry {
                    booking_id: booking.id,
                    customer_id: booking.customer_id,
                    rating: feedback.rating,
                    review: feedback.review,
                    submitted_at: feedback.submitted_at,
                },
            )
            .await?;

        let id = booking.id;
        let booking = retry_on_conflict(|| async move {
            let mut current = self.load(id).await?;
            if !current.has_pending_rating() {
                return Ok(current);
            }
            if let Some(feedback) = current.customer_feedback.as_mut() {
                feedback.rating_applied = true;
            }
            self.repo.update_booking(&mut current).await?;
            Ok(current)
        })
        .await?;

        Ok((booking, rating))
    }

    pub async fn provider_rating(&self, provider_id: Uuid) -> Result<ProviderRating, AppError> {
        self.ratings.get(provider_id).await
    }
}

fn actor_label(actor: ActorKind) -> &'static str {
    match actor {
        ActorKind::Customer => "customer",
        ActorKind::Provider => "provider",
        ActorKind::Admin => "admin",
        ActorKind::Settlement => "settlement",
    }
}

fn validate_schedule(date: NaiveDate, window: Option<TimeWindow>) -> Result<(), AppError> {
    let now = Utc::now().naive_utc();
    if date < now.date() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Booking date {} is in the past",
            date
        )));
    }
    if let Some(window) = window {
        if window.end_time <= window.start_time {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "End time must be after start time"
            )));
        }
        if date == now.date() && window.start_time < now.time() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Start time {} has already passed",
                window.start_time
            )));
        }
    }
    Ok(())
}
