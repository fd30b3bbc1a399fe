use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};

/// Role — caller role as established by the identity layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Porter,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Porter => "porter",
            Role::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Role::Customer),
            "porter" => Ok(Role::Porter),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Principal — authenticated identity attached to every request.
///
/// The identity provider itself is external; the core only ever sees
/// the resolved user id and role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: i64,
    pub role: Role,
}

impl Principal {
    pub fn new(id: i64, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// BookingStatus — closed set of booking lifecycle states.
///
/// `Completed` and `Cancelled` are terminal: no transition may leave them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "booking_status")]
pub enum BookingStatus {
    #[postgres(name = "pending")]
    Pending,
    #[postgres(name = "in_progress")]
    InProgress,
    #[postgres(name = "completed")]
    Completed,
    #[postgres(name = "cancelled")]
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }
}

/// PaymentStatus — payment leg of a booking. Transitions exactly once
/// out of `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "payment_status")]
pub enum PaymentStatus {
    #[postgres(name = "pending")]
    Pending,
    #[postgres(name = "authorized")]
    Authorized,
    #[postgres(name = "failed")]
    Failed,
}

/// PaymentOutcome — terminal result reported asynchronously by the
/// payment gateway for an open session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Authorized,
    Failed,
}

impl From<PaymentOutcome> for PaymentStatus {
    fn from(outcome: PaymentOutcome) -> Self {
        match outcome {
            PaymentOutcome::Authorized => PaymentStatus::Authorized,
            PaymentOutcome::Failed => PaymentStatus::Failed,
        }
    }
}

/// Porter — station porter with an exclusive-reservation flag and a
/// running rating aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Porter {
    pub id: i32,
    #[serde(rename = "user_id")]
    pub user_id: i64,
    #[serde(rename = "badge_number")]
    pub badge_number: String,
    pub station: String,
    pub available: bool,
    pub rating: f64,
    #[serde(rename = "total_ratings")]
    pub total_ratings: i32,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
}

/// Outcome of checking a submitted OTP against the code stored on a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpCheckError {
    /// The expiry timestamp has passed; the code is dead even if it matches.
    Expired,
    /// The submitted value does not match the stored code.
    Mismatch,
}

/// Booking — a single porter-service engagement. The main aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: String,
    #[serde(rename = "customer_id")]
    pub customer_id: i64,
    #[serde(rename = "porter_id")]
    pub porter_id: i32,
    pub station: String,
    #[serde(rename = "weight_kg")]
    pub weight_kg: i32,
    #[serde(rename = "bag_count")]
    pub bag_count: i32,
    #[serde(rename = "trolley_required")]
    pub trolley_required: bool,
    /// Computed price in integer currency units; immutable once set.
    pub price: i64,
    #[serde(rename = "contact_phone")]
    pub contact_phone: String,
    #[serde(rename = "payment_session_id")]
    pub payment_session_id: String,
    #[serde(rename = "payment_status")]
    pub payment_status: PaymentStatus,
    /// 6 ASCII digits. Never serialized outward; the code travels by SMS only.
    #[serde(skip_serializing, default)]
    pub otp_code: String,
    #[serde(rename = "otp_expiry")]
    pub otp_expiry: DateTime<Utc>,
    #[serde(rename = "otp_verified")]
    pub otp_verified: bool,
    #[serde(rename = "meeting_point")]
    pub meeting_point: String,
    #[serde(rename = "meeting_time")]
    pub meeting_time: DateTime<Utc>,
    pub status: BookingStatus,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
}

impl Booking {
    /// Both signals required for service start: payment authorized and
    /// the physical OTP handshake done.
    pub fn ready_for_service(&self) -> bool {
        self.payment_status == PaymentStatus::Authorized && self.otp_verified
    }

    /// Checks a submitted OTP against this booking at `now`.
    ///
    /// Re-checking an already-verified booking is a no-op success, so a
    /// duplicate verify from the other side of the handshake is harmless.
    /// Expiry wins over mismatch: a stale code is reported as expired.
    pub fn check_otp(&self, code: &str, now: DateTime<Utc>) -> Result<(), OtpCheckError> {
        if self.otp_verified {
            return Ok(());
        }
        if now > self.otp_expiry {
            return Err(OtpCheckError::Expired);
        }
        if self.otp_code != code {
            return Err(OtpCheckError::Mismatch);
        }
        Ok(())
    }

    pub fn can_cancel(&self) -> bool {
        self.status == BookingStatus::Pending
    }
}

/// Rating — one-to-one with a completed booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rating {
    pub id: i64,
    #[serde(rename = "booking_id")]
    pub booking_id: String,
    #[serde(rename = "porter_id")]
    pub porter_id: i32,
    #[serde(rename = "customer_id")]
    pub customer_id: i64,
    pub score: i32,
    pub comment: Option<String>,
    #[serde(rename = "created_at")]
    pub created_at: DateTime<Utc>,
}

/// Customer-supplied inputs for a new booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewBookingRequest {
    pub station: String,
    #[serde(rename = "weight_kg")]
    pub weight_kg: i32,
    #[serde(rename = "bag_count")]
    pub bag_count: i32,
    #[serde(rename = "trolley_required", default)]
    pub trolley_required: bool,
    #[serde(rename = "contact_phone")]
    pub contact_phone: String,
    #[serde(rename = "meeting_point")]
    pub meeting_point: String,
    #[serde(rename = "meeting_time")]
    pub meeting_time: DateTime<Utc>,
}

/// Admin-supplied inputs for registering a porter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPorterRequest {
    #[serde(rename = "user_id")]
    pub user_id: i64,
    #[serde(rename = "badge_number")]
    pub badge_number: String,
    pub station: String,
}

/// Rating submission payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitRatingRequest {
    pub score: i32,
    #[serde(default)]
    pub comment: Option<String>,
}
