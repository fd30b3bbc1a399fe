//! Business logic layer: the booking lifecycle state machine.
//!
//! This module defines the [`BookingService`] trait and its async
//! implementation [`BookingServiceImpl`]. The service owns every booking
//! transition — creation, payment confirmation, OTP handshake, start of
//! service, completion, cancellation and post-completion rating — and
//! coordinates the assignment service and the outbound gateways.
//!
//! # Design
//! - Every operation starts with an explicit authorization guard against
//!   the caller's role and ownership of the booking.
//! - Transitions are delegated to guarded conditional updates in the
//!   repository, so concurrent or late events can never move a booking
//!   out of a terminal state.
//! - Service starts only when payment is authorized AND the OTP handshake
//!   is verified; the promotion is re-attempted whenever either flag flips.

use std::sync::Arc;

use assignment::{Assignment, AssignmentError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gateway::{GatewayError, MessagingGateway, PaymentGateway};
use model::{
    Booking, BookingStatus, NewBookingRequest, NewPorterRequest, OtpCheckError, PaymentOutcome,
    PaymentStatus, Porter, Principal, Rating, Role, SubmitRatingRequest,
};
use rand::Rng;
use repository::{
    BookingsRepository, NewRating, PortersRepository, RatingsRepository, RepositoryError,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// The main error type for all [`BookingService`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The provided input is structurally or semantically invalid.
    #[error("Invalid request: {0}")]
    Validation(String),
    /// No porter could be reserved; the booking was not created.
    #[error("No porter available at station {station}")]
    NoPorterAvailable { station: String },
    /// The OTP expiry timestamp has passed.
    #[error("OTP has expired")]
    OtpExpired,
    /// The submitted OTP does not match.
    #[error("Invalid OTP")]
    OtpInvalid,
    /// The booking is not in a state that permits the operation.
    #[error("Illegal transition: {0}")]
    IllegalTransition(String),
    /// The booking already has a rating.
    #[error("Booking has already been rated")]
    AlreadyRated,
    /// The caller is not permitted to act on this booking.
    #[error("Access denied")]
    AccessDenied,
    /// The referenced entity does not exist.
    #[error("Not found")]
    NotFound,
    /// A repository (database) operation failed.
    #[error("Storage error: {0}")]
    Storage(RepositoryError),
    /// An outbound gateway call failed.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl From<RepositoryError> for ServiceError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound => ServiceError::NotFound,
            other => ServiceError::Storage(other),
        }
    }
}

impl From<AssignmentError> for ServiceError {
    fn from(e: AssignmentError) -> Self {
        match e {
            AssignmentError::NotAvailable { station } => ServiceError::NoPorterAvailable {
                station: station.unwrap_or_else(|| "any".to_string()),
            },
            AssignmentError::Storage(e) => e.into(),
        }
    }
}

/// Generates a uniformly random 6-digit numeric OTP.
///
/// Codes are not required to be unique across bookings; the handshake is
/// always checked against one specific booking.
fn generate_otp() -> String {
    let code: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{code:06}")
}

/// Trait describing the booking lifecycle operations exposed upward to
/// the transport layer and to the payment-events consumer.
#[async_trait]
pub trait BookingService: Send + Sync {
    /// Creates a booking: prices the request, opens a payment session,
    /// reserves a porter, stores the OTP and dispatches it best-effort.
    async fn create_booking(
        &self,
        principal: Principal,
        req: NewBookingRequest,
    ) -> Result<Booking, ServiceError>;

    /// Retrieves a booking for its customer, its assigned porter or an admin.
    async fn get_booking(
        &self,
        principal: Principal,
        booking_id: &str,
    ) -> Result<Booking, ServiceError>;

    /// Applies an asynchronous payment result from the gateway. Late or
    /// duplicate events against a settled booking are dropped.
    async fn confirm_payment(
        &self,
        session_id: &str,
        outcome: PaymentOutcome,
    ) -> Result<(), ServiceError>;

    /// Verifies the OTP handshake from either side of the meeting.
    async fn verify_otp(
        &self,
        principal: Principal,
        booking_id: &str,
        code: &str,
    ) -> Result<Booking, ServiceError>;

    /// Regenerates and re-dispatches the OTP while the booking is still
    /// pending and unverified.
    async fn resend_otp(&self, principal: Principal, booking_id: &str)
    -> Result<(), ServiceError>;

    /// Marks an in-progress booking completed; assigned porter only.
    async fn complete_booking(
        &self,
        principal: Principal,
        booking_id: &str,
    ) -> Result<Booking, ServiceError>;

    /// Cancels a pending booking; owning customer or admin.
    async fn cancel_booking(
        &self,
        principal: Principal,
        booking_id: &str,
    ) -> Result<Booking, ServiceError>;

    /// Submits the single post-completion rating for a booking.
    async fn submit_rating(
        &self,
        principal: Principal,
        booking_id: &str,
        req: SubmitRatingRequest,
    ) -> Result<Rating, ServiceError>;

    /// Registers a porter profile; admin only.
    async fn register_porter(
        &self,
        principal: Principal,
        req: NewPorterRequest,
    ) -> Result<Porter, ServiceError>;
}

/// Async implementation of [`BookingService`] over the repository traits
/// and gateway seams. Dependency injection keeps every collaborator
/// mockable in tests.
pub struct BookingServiceImpl<B, P, R, PG, MG> {
    bookings: Arc<B>,
    porters: Arc<P>,
    ratings: Arc<R>,
    assignment: Assignment<P>,
    payments: Arc<PG>,
    messaging: Arc<MG>,
    otp_ttl: Duration,
    currency: String,
}

impl<B, P, R, PG, MG> BookingServiceImpl<B, P, R, PG, MG>
where
    B: BookingsRepository,
    P: PortersRepository,
    R: RatingsRepository,
    PG: PaymentGateway,
    MG: MessagingGateway,
{
    pub fn new(
        bookings: Arc<B>,
        porters: Arc<P>,
        ratings: Arc<R>,
        payments: Arc<PG>,
        messaging: Arc<MG>,
        otp_ttl: Duration,
        currency: String,
    ) -> Self {
        let assignment = Assignment::new(porters.clone());
        Self {
            bookings,
            porters,
            ratings,
            assignment,
            payments,
            messaging,
            otp_ttl,
            currency,
        }
    }

    fn validate_booking(&self, req: &NewBookingRequest) -> Result<(), ServiceError> {
        if req.station.trim().is_empty() {
            return Err(ServiceError::Validation("station is empty".into()));
        }
        if !(1..=100).contains(&req.weight_kg) {
            return Err(ServiceError::Validation(
                "weight must be between 1 and 100 kg".into(),
            ));
        }
        if !(1..=10).contains(&req.bag_count) {
            return Err(ServiceError::Validation(
                "bag count must be between 1 and 10".into(),
            ));
        }
        if req.meeting_point.trim().is_empty() || req.meeting_point.len() > 200 {
            return Err(ServiceError::Validation("invalid meeting point".into()));
        }
        let phone = &req.contact_phone;
        if !(7..=15).contains(&phone.len()) || !phone.chars().all(|c| c.is_ascii_digit()) {
            return Err(ServiceError::Validation("invalid contact phone".into()));
        }
        Ok(())
    }

    /// Admins see everything; customers their own bookings; porters the
    /// bookings assigned to them.
    async fn authorize_booking_access(
        &self,
        principal: Principal,
        booking: &Booking,
    ) -> Result<(), ServiceError> {
        match principal.role {
            Role::Admin => Ok(()),
            Role::Customer if booking.customer_id == principal.id => Ok(()),
            Role::Porter => {
                let porter = self
                    .porters
                    .find_by_user(principal.id)
                    .await
                    .map_err(|_| ServiceError::AccessDenied)?;
                if porter.id == booking.porter_id {
                    Ok(())
                } else {
                    Err(ServiceError::AccessDenied)
                }
            }
            _ => Err(ServiceError::AccessDenied),
        }
    }

    fn require_owner(&self, principal: Principal, booking: &Booking) -> Result<(), ServiceError> {
        let owns = principal.role == Role::Customer && booking.customer_id == principal.id;
        if owns || principal.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::AccessDenied)
        }
    }

    /// Attempts the `pending -> in_progress` promotion. Called after
    /// either of the two prerequisite flags changes; a no-op when the
    /// conjunction does not hold yet.
    async fn try_begin_service(&self, booking_id: &str) -> Result<bool, ServiceError> {
        let promoted = self.bookings.begin_service(booking_id).await?;
        if promoted {
            info!(booking_id, "Booking moved to in_progress");
        }
        Ok(promoted)
    }

    async fn dispatch_otp(&self, booking: &Booking) {
        let body = format!(
            "Your PorterPro verification code is: {}. Share it with your porter at {}.",
            booking.otp_code, booking.meeting_point
        );
        if !self.messaging.send(&booking.contact_phone, &body).await {
            // Best-effort: the stored code stays valid and the customer
            // can request a resend.
            warn!(booking_id = %booking.id, "OTP delivery failed");
        }
    }

    async fn void_session_best_effort(&self, session_id: &str) {
        if let Err(e) = self.payments.void_session(session_id).await {
            warn!(session_id, "Failed to void payment session: {e}");
        }
    }

    fn otp_expiry(&self, meeting_time: DateTime<Utc>) -> DateTime<Utc> {
        // Anchored to the meeting time, also on resend.
        meeting_time + self.otp_ttl
    }
}

#[async_trait]
impl<B, P, R, PG, MG> BookingService for BookingServiceImpl<B, P, R, PG, MG>
where
    B: BookingsRepository,
    P: PortersRepository,
    R: RatingsRepository,
    PG: PaymentGateway,
    MG: MessagingGateway,
{
    #[instrument(skip(self, req), fields(customer_id = principal.id))]
    async fn create_booking(
        &self,
        principal: Principal,
        req: NewBookingRequest,
    ) -> Result<Booking, ServiceError> {
        if principal.role != Role::Customer {
            return Err(ServiceError::AccessDenied);
        }
        self.validate_booking(&req)?;

        let price = pricing::price(
            i64::from(req.weight_kg),
            i64::from(req.bag_count),
            req.trolley_required,
        );
        let session = self.payments.open_session(price, &self.currency).await?;

        let porter_id = match self.assignment.reserve(Some(&req.station)).await {
            Ok(porter_id) => porter_id,
            Err(e) => {
                // The session will never be charged; void it before failing.
                self.void_session_best_effort(&session.session_id).await;
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let booking = Booking {
            id: Uuid::new_v4().to_string(),
            customer_id: principal.id,
            porter_id,
            station: req.station,
            weight_kg: req.weight_kg,
            bag_count: req.bag_count,
            trolley_required: req.trolley_required,
            price,
            contact_phone: req.contact_phone,
            payment_session_id: session.session_id,
            payment_status: PaymentStatus::Pending,
            otp_code: generate_otp(),
            otp_expiry: self.otp_expiry(req.meeting_time),
            otp_verified: false,
            meeting_point: req.meeting_point,
            meeting_time: req.meeting_time,
            status: BookingStatus::Pending,
            created_at: now,
        };

        if let Err(e) = self.bookings.create(&booking).await {
            self.assignment.release(porter_id).await?;
            self.void_session_best_effort(&booking.payment_session_id).await;
            return Err(e.into());
        }

        info!(booking_id = %booking.id, porter_id, price, "Booking created");
        self.dispatch_otp(&booking).await;
        Ok(booking)
    }

    #[instrument(skip(self))]
    async fn get_booking(
        &self,
        principal: Principal,
        booking_id: &str,
    ) -> Result<Booking, ServiceError> {
        let booking = self.bookings.get(booking_id).await?;
        self.authorize_booking_access(principal, &booking).await?;
        Ok(booking)
    }

    #[instrument(skip(self))]
    async fn confirm_payment(
        &self,
        session_id: &str,
        outcome: PaymentOutcome,
    ) -> Result<(), ServiceError> {
        let booking = self.bookings.find_by_payment_session(session_id).await?;

        let status = PaymentStatus::from(outcome);
        let changed = self.bookings.set_payment_outcome(&booking.id, status).await?;
        if !changed {
            // Late webhook for a cancelled/settled booking. Drop it.
            info!(booking_id = %booking.id, ?outcome, "Dropped stale payment event");
            return Ok(());
        }

        match outcome {
            PaymentOutcome::Authorized => {
                info!(booking_id = %booking.id, "Payment authorized");
                self.try_begin_service(&booking.id).await?;
            }
            PaymentOutcome::Failed => {
                warn!(booking_id = %booking.id, "Payment failed, cancelling booking");
                self.bookings
                    .cancel_and_release(&booking.id, booking.porter_id)
                    .await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, code))]
    async fn verify_otp(
        &self,
        principal: Principal,
        booking_id: &str,
        code: &str,
    ) -> Result<Booking, ServiceError> {
        let booking = self.bookings.get(booking_id).await?;
        self.authorize_booking_access(principal, &booking).await?;

        if booking.otp_verified {
            // Re-verifying from the other side of the handshake is a no-op.
            return Ok(booking);
        }
        if booking.status.is_terminal() {
            return Err(ServiceError::IllegalTransition(
                "booking is already settled".into(),
            ));
        }

        booking.check_otp(code, Utc::now()).map_err(|e| match e {
            OtpCheckError::Expired => ServiceError::OtpExpired,
            OtpCheckError::Mismatch => ServiceError::OtpInvalid,
        })?;

        if !self.bookings.mark_otp_verified(booking_id, code).await? {
            // The guarded update lost a race: either the booking settled
            // or the code was rotated between the check and the mark.
            let current = self.bookings.get(booking_id).await?;
            if current.otp_verified {
                return Ok(current);
            }
            if current.status != BookingStatus::Pending {
                return Err(ServiceError::IllegalTransition(
                    "booking is no longer pending".into(),
                ));
            }
            return Err(ServiceError::OtpInvalid);
        }
        info!(booking_id, "OTP verified");
        self.try_begin_service(booking_id).await?;

        Ok(self.bookings.get(booking_id).await?)
    }

    #[instrument(skip(self))]
    async fn resend_otp(
        &self,
        principal: Principal,
        booking_id: &str,
    ) -> Result<(), ServiceError> {
        let booking = self.bookings.get(booking_id).await?;
        self.require_owner(principal, &booking)?;

        if booking.status != BookingStatus::Pending || booking.otp_verified {
            return Err(ServiceError::IllegalTransition(
                "OTP can only be resent for a pending, unverified booking".into(),
            ));
        }

        let code = generate_otp();
        let expiry = self.otp_expiry(booking.meeting_time);
        if !self.bookings.rotate_otp(booking_id, &code, expiry).await? {
            return Err(ServiceError::IllegalTransition(
                "booking is no longer pending".into(),
            ));
        }
        info!(booking_id, "OTP regenerated");

        let refreshed = self.bookings.get(booking_id).await?;
        self.dispatch_otp(&refreshed).await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_booking(
        &self,
        principal: Principal,
        booking_id: &str,
    ) -> Result<Booking, ServiceError> {
        if principal.role != Role::Porter {
            return Err(ServiceError::AccessDenied);
        }
        let porter = self
            .porters
            .find_by_user(principal.id)
            .await
            .map_err(|_| ServiceError::AccessDenied)?;

        let booking = self.bookings.get(booking_id).await?;
        if booking.porter_id != porter.id {
            return Err(ServiceError::AccessDenied);
        }

        // Status flip and porter release commit as one transaction.
        if !self
            .bookings
            .complete_and_release(booking_id, booking.porter_id)
            .await?
        {
            return Err(ServiceError::IllegalTransition(
                "only an in-progress booking can be completed".into(),
            ));
        }
        info!(booking_id, porter_id = porter.id, "Booking completed");

        Ok(self.bookings.get(booking_id).await?)
    }

    #[instrument(skip(self))]
    async fn cancel_booking(
        &self,
        principal: Principal,
        booking_id: &str,
    ) -> Result<Booking, ServiceError> {
        let booking = self.bookings.get(booking_id).await?;
        self.require_owner(principal, &booking)?;

        if !self
            .bookings
            .cancel_and_release(booking_id, booking.porter_id)
            .await?
        {
            return Err(ServiceError::IllegalTransition(
                "only a pending booking can be cancelled".into(),
            ));
        }
        self.void_session_best_effort(&booking.payment_session_id).await;
        info!(booking_id, "Booking cancelled");

        Ok(self.bookings.get(booking_id).await?)
    }

    #[instrument(skip(self, req))]
    async fn submit_rating(
        &self,
        principal: Principal,
        booking_id: &str,
        req: SubmitRatingRequest,
    ) -> Result<Rating, ServiceError> {
        let booking = self.bookings.get(booking_id).await?;
        if principal.role != Role::Customer || booking.customer_id != principal.id {
            return Err(ServiceError::AccessDenied);
        }

        if booking.status != BookingStatus::Completed {
            return Err(ServiceError::IllegalTransition(
                "only a completed booking can be rated".into(),
            ));
        }
        if !(1..=5).contains(&req.score) {
            return Err(ServiceError::Validation(
                "score must be between 1 and 5".into(),
            ));
        }
        if req.comment.as_ref().is_some_and(|c| c.len() > 500) {
            return Err(ServiceError::Validation("comment is too long".into()));
        }

        let rating = self
            .ratings
            .insert(&NewRating {
                booking_id: booking.id.clone(),
                porter_id: booking.porter_id,
                customer_id: booking.customer_id,
                score: req.score,
                comment: req.comment,
            })
            .await
            .map_err(|e| match e {
                RepositoryError::Duplicate => ServiceError::AlreadyRated,
                other => other.into(),
            })?;

        info!(booking_id, porter_id = booking.porter_id, score = rating.score, "Rating recorded");
        Ok(rating)
    }

    #[instrument(skip(self, req))]
    async fn register_porter(
        &self,
        principal: Principal,
        req: NewPorterRequest,
    ) -> Result<Porter, ServiceError> {
        if !principal.is_admin() {
            return Err(ServiceError::AccessDenied);
        }
        if req.badge_number.trim().is_empty() || req.badge_number.len() > 20 {
            return Err(ServiceError::Validation("invalid badge number".into()));
        }
        if req.station.trim().is_empty() || req.station.len() > 100 {
            return Err(ServiceError::Validation("invalid station".into()));
        }

        self.porters.insert(&req).await.map_err(|e| match e {
            RepositoryError::Duplicate => ServiceError::Validation(
                "badge number already registered for this station".into(),
            ),
            other => other.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repository::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::Mutex;

    struct FakePaymentGateway {
        counter: AtomicU64,
        opened: Mutex<Vec<(i64, String)>>,
        voided: Mutex<Vec<String>>,
    }

    impl FakePaymentGateway {
        fn new() -> Self {
            Self {
                counter: AtomicU64::new(0),
                opened: Mutex::new(Vec::new()),
                voided: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for FakePaymentGateway {
        async fn open_session(
            &self,
            amount: i64,
            currency: &str,
        ) -> Result<gateway::PaymentSession, GatewayError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let session_id = format!("cs_test_{n}");
            self.opened.lock().await.push((amount, currency.to_string()));
            Ok(gateway::PaymentSession { session_id })
        }

        async fn void_session(&self, session_id: &str) -> Result<(), GatewayError> {
            self.voided.lock().await.push(session_id.to_string());
            Ok(())
        }
    }

    struct FakeMessaging {
        deliver: AtomicBool,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl FakeMessaging {
        fn new() -> Self {
            Self {
                deliver: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessagingGateway for FakeMessaging {
        async fn send(&self, destination: &str, body: &str) -> bool {
            self.sent
                .lock()
                .await
                .push((destination.to_string(), body.to_string()));
            self.deliver.load(Ordering::SeqCst)
        }
    }

    /// Delegates to the shared store but fails every standalone release,
    /// proving terminal transitions do not depend on that path.
    struct BrokenReleasePorters {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl PortersRepository for BrokenReleasePorters {
        async fn insert(&self, porter: &NewPorterRequest) -> Result<Porter, RepositoryError> {
            PortersRepository::insert(self.inner.as_ref(), porter).await
        }

        async fn get(&self, porter_id: i32) -> Result<Porter, RepositoryError> {
            PortersRepository::get(self.inner.as_ref(), porter_id).await
        }

        async fn find_by_user(&self, user_id: i64) -> Result<Porter, RepositoryError> {
            self.inner.find_by_user(user_id).await
        }

        async fn reserve(&self, station: Option<&str>) -> Result<Option<i32>, RepositoryError> {
            self.inner.reserve(station).await
        }

        async fn release(&self, _porter_id: i32) -> Result<(), RepositoryError> {
            Err(RepositoryError::NotFound)
        }
    }

    type TestService = BookingServiceImpl<
        MemoryStore,
        MemoryStore,
        MemoryStore,
        FakePaymentGateway,
        FakeMessaging,
    >;

    struct Fixture {
        service: TestService,
        store: Arc<MemoryStore>,
        payments: Arc<FakePaymentGateway>,
        messaging: Arc<FakeMessaging>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let payments = Arc::new(FakePaymentGateway::new());
        let messaging = Arc::new(FakeMessaging::new());
        let service = BookingServiceImpl::new(
            store.clone(),
            store.clone(),
            store.clone(),
            payments.clone(),
            messaging.clone(),
            Duration::minutes(30),
            "INR".to_string(),
        );
        Fixture {
            service,
            store,
            payments,
            messaging,
        }
    }

    const ADMIN: Principal = Principal { id: 1, role: Role::Admin };
    const CUSTOMER: Principal = Principal { id: 42, role: Role::Customer };
    const PORTER_USER: Principal = Principal { id: 500, role: Role::Porter };

    // MemoryStore implements all repository traits, so concrete calls
    // need the trait spelled out.
    async fn stored_porter(fx: &Fixture, porter_id: i32) -> Porter {
        PortersRepository::get(fx.store.as_ref(), porter_id).await.unwrap()
    }

    async fn stored_booking(fx: &Fixture, booking_id: &str) -> Booking {
        BookingsRepository::get(fx.store.as_ref(), booking_id).await.unwrap()
    }

    async fn register_porter(fx: &Fixture) -> Porter {
        fx.service
            .register_porter(
                ADMIN,
                NewPorterRequest {
                    user_id: PORTER_USER.id,
                    badge_number: "P00001".to_string(),
                    station: "Central".to_string(),
                },
            )
            .await
            .unwrap()
    }

    fn booking_request() -> NewBookingRequest {
        NewBookingRequest {
            station: "Central".to_string(),
            weight_kg: 20,
            bag_count: 2,
            trolley_required: true,
            contact_phone: "9998887776".to_string(),
            meeting_point: "Platform 4".to_string(),
            meeting_time: Utc::now() + Duration::hours(1),
        }
    }

    async fn create_booking(fx: &Fixture) -> Booking {
        register_porter(fx).await;
        fx.service
            .create_booking(CUSTOMER, booking_request())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_flow() {
        let fx = fixture();
        let booking = create_booking(&fx).await;

        // 20 * 5 + 2 * 10 + 200 = 320; floor not binding.
        assert_eq!(booking.price, 320);
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.otp_code.len(), 6);
        assert!(booking.otp_code.chars().all(|c| c.is_ascii_digit()));

        // Porter exclusively reserved, OTP dispatched.
        let porter = stored_porter(&fx, booking.porter_id).await;
        assert!(!porter.available);
        let sent = fx.messaging.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains(&booking.otp_code));
        drop(sent);

        // Payment authorized alone does not start service.
        fx.service
            .confirm_payment(&booking.payment_session_id, PaymentOutcome::Authorized)
            .await
            .unwrap();
        let b = fx.service.get_booking(CUSTOMER, &booking.id).await.unwrap();
        assert_eq!(b.status, BookingStatus::Pending);

        // OTP handshake completes the conjunction.
        let b = fx
            .service
            .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
            .await
            .unwrap();
        assert_eq!(b.status, BookingStatus::InProgress);

        // Assigned porter completes; pool is restored.
        let b = fx
            .service
            .complete_booking(PORTER_USER, &booking.id)
            .await
            .unwrap();
        assert_eq!(b.status, BookingStatus::Completed);
        assert!(stored_porter(&fx, booking.porter_id).await.available);

        // Single rating updates the aggregate exactly.
        let rating = fx
            .service
            .submit_rating(
                CUSTOMER,
                &booking.id,
                SubmitRatingRequest { score: 5, comment: Some("on time".to_string()) },
            )
            .await
            .unwrap();
        assert_eq!(rating.score, 5);
        let porter = stored_porter(&fx, booking.porter_id).await;
        assert_eq!(porter.total_ratings, 1);
        assert!((porter.rating - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_create_without_porter_voids_session() {
        let fx = fixture();
        // No porters registered at all.
        let err = fx
            .service
            .create_booking(CUSTOMER, booking_request())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoPorterAvailable { .. }));

        let opened = fx.payments.opened.lock().await;
        let voided = fx.payments.voided.lock().await;
        assert_eq!(opened.len(), 1);
        assert_eq!(voided.len(), 1);
    }

    #[tokio::test]
    async fn test_create_validation_rejected_before_side_effects() {
        let fx = fixture();
        register_porter(&fx).await;

        let mut req = booking_request();
        req.weight_kg = 0;
        let err = fx.service.create_booking(CUSTOMER, req).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let mut req = booking_request();
        req.bag_count = 11;
        let err = fx.service.create_booking(CUSTOMER, req).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        // Nothing was opened or reserved.
        assert!(fx.payments.opened.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_fail_creation() {
        let fx = fixture();
        fx.messaging.deliver.store(false, Ordering::SeqCst);
        let booking = create_booking(&fx).await;
        assert_eq!(booking.status, BookingStatus::Pending);

        // The stored code survives, so a resend can still go out.
        fx.messaging.deliver.store(true, Ordering::SeqCst);
        fx.service.resend_otp(CUSTOMER, &booking.id).await.unwrap();
        assert_eq!(fx.messaging.sent.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_payment_failure_cancels_and_releases() {
        let fx = fixture();
        let booking = create_booking(&fx).await;

        fx.service
            .confirm_payment(&booking.payment_session_id, PaymentOutcome::Failed)
            .await
            .unwrap();

        let b = fx.service.get_booking(CUSTOMER, &booking.id).await.unwrap();
        assert_eq!(b.status, BookingStatus::Cancelled);
        assert_eq!(b.payment_status, PaymentStatus::Failed);
        assert!(stored_porter(&fx, booking.porter_id).await.available);
    }

    #[tokio::test]
    async fn test_late_payment_event_cannot_resurrect_cancelled_booking() {
        let fx = fixture();
        let booking = create_booking(&fx).await;

        fx.service.cancel_booking(CUSTOMER, &booking.id).await.unwrap();
        fx.service
            .confirm_payment(&booking.payment_session_id, PaymentOutcome::Authorized)
            .await
            .unwrap();

        let b = fx.service.get_booking(CUSTOMER, &booking.id).await.unwrap();
        assert_eq!(b.status, BookingStatus::Cancelled);
        assert_eq!(b.payment_status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_verify_otp_wrong_code() {
        let fx = fixture();
        let booking = create_booking(&fx).await;
        let wrong = if booking.otp_code == "000000" { "000001" } else { "000000" };

        let err = fx
            .service
            .verify_otp(CUSTOMER, &booking.id, wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::OtpInvalid));
    }

    #[tokio::test]
    async fn test_verify_otp_expired() {
        let fx = fixture();
        register_porter(&fx).await;
        let mut req = booking_request();
        // Meeting long past: the 30-minute window is already over.
        req.meeting_time = Utc::now() - Duration::hours(2);
        let booking = fx.service.create_booking(CUSTOMER, req).await.unwrap();

        let err = fx
            .service
            .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::OtpExpired));
    }

    #[tokio::test]
    async fn test_verify_otp_idempotent_from_both_sides() {
        let fx = fixture();
        let booking = create_booking(&fx).await;
        fx.service
            .confirm_payment(&booking.payment_session_id, PaymentOutcome::Authorized)
            .await
            .unwrap();

        let b = fx
            .service
            .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
            .await
            .unwrap();
        assert_eq!(b.status, BookingStatus::InProgress);

        // The porter re-verifying after the transition is a no-op.
        let b = fx
            .service
            .verify_otp(PORTER_USER, &booking.id, &booking.otp_code)
            .await
            .unwrap();
        assert_eq!(b.status, BookingStatus::InProgress);
    }

    #[tokio::test]
    async fn test_otp_verification_alone_does_not_start_service() {
        let fx = fixture();
        let booking = create_booking(&fx).await;

        let b = fx
            .service
            .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
            .await
            .unwrap();
        assert!(b.otp_verified);
        assert_eq!(b.status, BookingStatus::Pending);

        // The pending authorization arrives and completes the conjunction.
        fx.service
            .confirm_payment(&booking.payment_session_id, PaymentOutcome::Authorized)
            .await
            .unwrap();
        let b = fx.service.get_booking(CUSTOMER, &booking.id).await.unwrap();
        assert_eq!(b.status, BookingStatus::InProgress);
    }

    #[tokio::test]
    async fn test_resend_rotates_code() {
        let fx = fixture();
        let booking = create_booking(&fx).await;

        fx.service.resend_otp(CUSTOMER, &booking.id).await.unwrap();
        let rotated = stored_booking(&fx, &booking.id).await;

        // The old code only works if the draw happened to repeat it.
        if rotated.otp_code != booking.otp_code {
            let err = fx
                .service
                .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::OtpInvalid));
        }
        let b = fx
            .service
            .verify_otp(CUSTOMER, &booking.id, &rotated.otp_code)
            .await
            .unwrap();
        assert!(b.otp_verified);
    }

    #[tokio::test]
    async fn test_resend_rejected_after_verification() {
        let fx = fixture();
        let booking = create_booking(&fx).await;
        fx.service
            .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
            .await
            .unwrap();

        let err = fx.service.resend_otp(CUSTOMER, &booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn test_complete_requires_assigned_porter() {
        let fx = fixture();
        let booking = create_booking(&fx).await;
        fx.service
            .confirm_payment(&booking.payment_session_id, PaymentOutcome::Authorized)
            .await
            .unwrap();
        fx.service
            .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
            .await
            .unwrap();

        // Customer cannot complete.
        let err = fx
            .service
            .complete_booking(CUSTOMER, &booking.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AccessDenied));

        // Another porter cannot complete.
        fx.service
            .register_porter(
                ADMIN,
                NewPorterRequest {
                    user_id: 501,
                    badge_number: "P00002".to_string(),
                    station: "Central".to_string(),
                },
            )
            .await
            .unwrap();
        let other = Principal { id: 501, role: Role::Porter };
        let err = fx
            .service
            .complete_booking(other, &booking.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AccessDenied));
    }

    #[tokio::test]
    async fn test_complete_pending_booking_is_illegal() {
        let fx = fixture();
        let booking = create_booking(&fx).await;

        let err = fx
            .service
            .complete_booking(PORTER_USER, &booking.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn test_cancel_in_progress_rejected() {
        let fx = fixture();
        let booking = create_booking(&fx).await;
        fx.service
            .confirm_payment(&booking.payment_session_id, PaymentOutcome::Authorized)
            .await
            .unwrap();
        fx.service
            .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
            .await
            .unwrap();

        // The physical handshake has happened; no cancellation path left.
        let err = fx
            .service
            .cancel_booking(CUSTOMER, &booking.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn test_cancel_releases_porter_and_voids_session() {
        let fx = fixture();
        let booking = create_booking(&fx).await;

        fx.service.cancel_booking(CUSTOMER, &booking.id).await.unwrap();
        assert!(stored_porter(&fx, booking.porter_id).await.available);
        assert_eq!(
            fx.payments.voided.lock().await.as_slice(),
            &[booking.payment_session_id.clone()]
        );
    }

    #[tokio::test]
    async fn test_terminal_transitions_free_porter_when_release_path_fails() {
        let store = Arc::new(MemoryStore::new());
        let payments = Arc::new(FakePaymentGateway::new());
        let messaging = Arc::new(FakeMessaging::new());
        let porters = Arc::new(BrokenReleasePorters {
            inner: store.clone(),
        });
        let service = BookingServiceImpl::new(
            store.clone(),
            porters,
            store.clone(),
            payments,
            messaging,
            Duration::minutes(30),
            "INR".to_string(),
        );
        service
            .register_porter(
                ADMIN,
                NewPorterRequest {
                    user_id: PORTER_USER.id,
                    badge_number: "P00001".to_string(),
                    station: "Central".to_string(),
                },
            )
            .await
            .unwrap();

        // Completion frees the porter atomically with the status flip.
        let booking = service
            .create_booking(CUSTOMER, booking_request())
            .await
            .unwrap();
        service
            .confirm_payment(&booking.payment_session_id, PaymentOutcome::Authorized)
            .await
            .unwrap();
        service
            .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
            .await
            .unwrap();
        service
            .complete_booking(PORTER_USER, &booking.id)
            .await
            .unwrap();
        let porter = PortersRepository::get(store.as_ref(), booking.porter_id)
            .await
            .unwrap();
        assert!(porter.available);

        // Same for cancellation.
        let booking = service
            .create_booking(CUSTOMER, booking_request())
            .await
            .unwrap();
        service.cancel_booking(CUSTOMER, &booking.id).await.unwrap();
        let porter = PortersRepository::get(store.as_ref(), booking.porter_id)
            .await
            .unwrap();
        assert!(porter.available);
    }

    #[tokio::test]
    async fn test_rating_rejected_unless_completed() {
        let fx = fixture();
        let booking = create_booking(&fx).await;

        let err = fx
            .service
            .submit_rating(CUSTOMER, &booking.id, SubmitRatingRequest { score: 5, comment: None })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn test_second_rating_rejected() {
        let fx = fixture();
        let booking = create_booking(&fx).await;
        fx.service
            .confirm_payment(&booking.payment_session_id, PaymentOutcome::Authorized)
            .await
            .unwrap();
        fx.service
            .verify_otp(CUSTOMER, &booking.id, &booking.otp_code)
            .await
            .unwrap();
        fx.service.complete_booking(PORTER_USER, &booking.id).await.unwrap();

        fx.service
            .submit_rating(CUSTOMER, &booking.id, SubmitRatingRequest { score: 4, comment: None })
            .await
            .unwrap();
        let err = fx
            .service
            .submit_rating(CUSTOMER, &booking.id, SubmitRatingRequest { score: 2, comment: None })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyRated));
    }

    #[tokio::test]
    async fn test_booking_access_control() {
        let fx = fixture();
        let booking = create_booking(&fx).await;

        let stranger = Principal { id: 999, role: Role::Customer };
        let err = fx
            .service
            .get_booking(stranger, &booking.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AccessDenied));

        // Assigned porter and admin both see the booking.
        fx.service.get_booking(PORTER_USER, &booking.id).await.unwrap();
        fx.service.get_booking(ADMIN, &booking.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_porter_requires_admin() {
        let fx = fixture();
        let err = fx
            .service
            .register_porter(
                CUSTOMER,
                NewPorterRequest {
                    user_id: 7,
                    badge_number: "P1".to_string(),
                    station: "Central".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AccessDenied));
    }

    #[tokio::test]
    async fn test_duplicate_badge_rejected_as_validation() {
        let fx = fixture();
        register_porter(&fx).await;
        let err = fx
            .service
            .register_porter(
                ADMIN,
                NewPorterRequest {
                    user_id: 600,
                    badge_number: "P00001".to_string(),
                    station: "Central".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
