//! # Data Repository Layer
//!
//! Repository traits and their implementations for the porter service
//! entities: porters, bookings, ratings. Postgres implementations live in
//! [`pg`], an in-memory implementation backing tests and local runs lives
//! in [`memory`].
//!
//! The concurrency discipline of the whole system is concentrated here:
//! - porter reservation is a single atomic conditional update
//!   (compare-and-set on `available`), never a read-then-write pair;
//! - every booking status transition is a guarded update keyed on the
//!   expected current state, so late or duplicate events cannot resurrect
//!   a settled booking;
//! - transitions that end a booking free the assigned porter in the same
//!   transaction, so a porter can never be stranded unavailable;
//! - a rating insert and the porter aggregate update commit together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::{Booking, NewPorterRequest, PaymentStatus, Porter, Rating};
use thiserror::Error;

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::{PgBookingsRepository, PgPortersRepository, PgRatingsRepository};

/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// A uniqueness constraint was violated.
    #[error("Duplicate record")]
    Duplicate,
}

/// Storage input record for a rating submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRating {
    pub booking_id: String,
    pub porter_id: i32,
    pub customer_id: i64,
    pub score: i32,
    pub comment: Option<String>,
}

/// Repository interface for porters.
///
/// `reserve`/`release` are the only operations that may touch the
/// `available` flag; callers go through the assignment service.
#[async_trait]
pub trait PortersRepository: Send + Sync {
    /// Registers a new porter. Fails with [`RepositoryError::Duplicate`]
    /// when `(badge_number, station)` is already taken.
    async fn insert(&self, porter: &NewPorterRequest) -> Result<Porter, RepositoryError>;

    /// Get a porter by id.
    async fn get(&self, porter_id: i32) -> Result<Porter, RepositoryError>;

    /// Resolve the porter profile for an authenticated user id.
    async fn find_by_user(&self, user_id: i64) -> Result<Porter, RepositoryError>;

    /// Atomically claims one available porter (for the station, or
    /// system-wide when `station` is `None`) and flips it unavailable.
    /// Tie-break is deterministic: lowest porter id first.
    /// Returns `None` when no porter matched.
    async fn reserve(&self, station: Option<&str>) -> Result<Option<i32>, RepositoryError>;

    /// Returns the porter to the pool. Idempotent: releasing an
    /// already-available porter is a no-op.
    async fn release(&self, porter_id: i32) -> Result<(), RepositoryError>;
}

/// Repository interface for bookings.
///
/// Transition methods return `true` when the guarded update matched a row
/// and `false` when the booking was not in the expected state.
#[async_trait]
pub trait BookingsRepository: Send + Sync {
    /// Persists a freshly created booking.
    async fn create(&self, booking: &Booking) -> Result<(), RepositoryError>;

    /// Get a booking by id.
    async fn get(&self, booking_id: &str) -> Result<Booking, RepositoryError>;

    /// Looks a booking up by its payment-session reference.
    async fn find_by_payment_session(&self, session_id: &str) -> Result<Booking, RepositoryError>;

    /// `payment_status: pending -> authorized | failed`, only while the
    /// booking itself is still pending.
    async fn set_payment_outcome(
        &self,
        booking_id: &str,
        status: PaymentStatus,
    ) -> Result<bool, RepositoryError>;

    /// Sets `otp_verified`, only while the booking is pending and still
    /// carries `code`. The code condition closes the race with a
    /// concurrent rotation: a superseded code can never verify.
    async fn mark_otp_verified(&self, booking_id: &str, code: &str)
    -> Result<bool, RepositoryError>;

    /// `pending -> in_progress`, only when payment is authorized and the
    /// OTP is verified. The conjunction is evaluated inside the guard.
    async fn begin_service(&self, booking_id: &str) -> Result<bool, RepositoryError>;

    /// Replaces the OTP code and expiry, only while pending and unverified.
    async fn rotate_otp(
        &self,
        booking_id: &str,
        code: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// `in_progress -> completed`, freeing `porter_id` in the same
    /// transaction. The porter is only touched when the guard matched.
    async fn complete_and_release(
        &self,
        booking_id: &str,
        porter_id: i32,
    ) -> Result<bool, RepositoryError>;

    /// `pending -> cancelled`, freeing `porter_id` in the same
    /// transaction. The porter is only touched when the guard matched.
    async fn cancel_and_release(
        &self,
        booking_id: &str,
        porter_id: i32,
    ) -> Result<bool, RepositoryError>;
}

/// Repository interface for ratings.
#[async_trait]
pub trait RatingsRepository: Send + Sync {
    /// Persists the rating and folds the score into the porter's running
    /// mean in a single transaction. A second rating for the same booking
    /// fails with [`RepositoryError::Duplicate`].
    async fn insert(&self, rating: &NewRating) -> Result<Rating, RepositoryError>;
}
