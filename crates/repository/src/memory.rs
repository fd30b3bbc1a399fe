//! In-memory implementation of the repository traits.
//!
//! Backs unit tests and local runs without a database. A single lock over
//! the whole store gives every operation the same atomicity the Postgres
//! implementations get from conditional updates and transactions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::{Booking, BookingStatus, NewPorterRequest, PaymentStatus, Porter, Rating};
use tokio::sync::Mutex;

use crate::{BookingsRepository, NewRating, PortersRepository, RatingsRepository, RepositoryError};

#[derive(Debug, Default)]
struct Inner {
    porters: HashMap<i32, Porter>,
    next_porter_id: i32,
    bookings: HashMap<String, Booking>,
    rated_bookings: HashSet<String>,
    next_rating_id: i64,
}

/// Thread-safe in-memory store implementing all repository traits.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PortersRepository for MemoryStore {
    async fn insert(&self, porter: &NewPorterRequest) -> Result<Porter, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner.porters.values().any(|p| {
            p.badge_number == porter.badge_number && p.station == porter.station
        });
        if duplicate {
            return Err(RepositoryError::Duplicate);
        }
        inner.next_porter_id += 1;
        let id = inner.next_porter_id;
        let record = Porter {
            id,
            user_id: porter.user_id,
            badge_number: porter.badge_number.clone(),
            station: porter.station.clone(),
            available: true,
            rating: 0.0,
            total_ratings: 0,
            created_at: Utc::now(),
        };
        inner.porters.insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, porter_id: i32) -> Result<Porter, RepositoryError> {
        let inner = self.inner.lock().await;
        inner
            .porters
            .get(&porter_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn find_by_user(&self, user_id: i64) -> Result<Porter, RepositoryError> {
        let inner = self.inner.lock().await;
        inner
            .porters
            .values()
            .find(|p| p.user_id == user_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn reserve(&self, station: Option<&str>) -> Result<Option<i32>, RepositoryError> {
        let mut inner = self.inner.lock().await;
        // Lowest id first, same tie-break as the SQL implementation.
        let candidate = inner
            .porters
            .values()
            .filter(|p| p.available && station.is_none_or(|s| p.station == s))
            .map(|p| p.id)
            .min();
        if let Some(id) = candidate {
            if let Some(porter) = inner.porters.get_mut(&id) {
                porter.available = false;
            }
        }
        Ok(candidate)
    }

    async fn release(&self, porter_id: i32) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if let Some(porter) = inner.porters.get_mut(&porter_id) {
            porter.available = true;
        }
        Ok(())
    }
}

#[async_trait]
impl BookingsRepository for MemoryStore {
    async fn create(&self, booking: &Booking) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if inner.bookings.contains_key(&booking.id) {
            return Err(RepositoryError::Duplicate);
        }
        inner.bookings.insert(booking.id.clone(), booking.clone());
        Ok(())
    }

    async fn get(&self, booking_id: &str) -> Result<Booking, RepositoryError> {
        let inner = self.inner.lock().await;
        inner
            .bookings
            .get(booking_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn find_by_payment_session(&self, session_id: &str) -> Result<Booking, RepositoryError> {
        let inner = self.inner.lock().await;
        inner
            .bookings
            .values()
            .find(|b| b.payment_session_id == session_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn set_payment_outcome(
        &self,
        booking_id: &str,
        status: PaymentStatus,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        match inner.bookings.get_mut(booking_id) {
            Some(b)
                if b.payment_status == PaymentStatus::Pending
                    && b.status == BookingStatus::Pending =>
            {
                b.payment_status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_otp_verified(
        &self,
        booking_id: &str,
        code: &str,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        match inner.bookings.get_mut(booking_id) {
            Some(b) if b.status == BookingStatus::Pending && b.otp_code == code => {
                b.otp_verified = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn begin_service(&self, booking_id: &str) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        match inner.bookings.get_mut(booking_id) {
            Some(b) if b.status == BookingStatus::Pending && b.ready_for_service() => {
                b.status = BookingStatus::InProgress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rotate_otp(
        &self,
        booking_id: &str,
        code: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        match inner.bookings.get_mut(booking_id) {
            Some(b) if b.status == BookingStatus::Pending && !b.otp_verified => {
                b.otp_code = code.to_string();
                b.otp_expiry = expiry;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_and_release(
        &self,
        booking_id: &str,
        porter_id: i32,
    ) -> Result<bool, RepositoryError> {
        // One lock scope covers both mutations, matching the SQL
        // transaction.
        let mut inner = self.inner.lock().await;
        let transitioned = match inner.bookings.get_mut(booking_id) {
            Some(b) if b.status == BookingStatus::InProgress => {
                b.status = BookingStatus::Completed;
                true
            }
            _ => false,
        };
        if transitioned {
            if let Some(porter) = inner.porters.get_mut(&porter_id) {
                porter.available = true;
            }
        }
        Ok(transitioned)
    }

    async fn cancel_and_release(
        &self,
        booking_id: &str,
        porter_id: i32,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let transitioned = match inner.bookings.get_mut(booking_id) {
            Some(b) if b.status == BookingStatus::Pending => {
                b.status = BookingStatus::Cancelled;
                true
            }
            _ => false,
        };
        if transitioned {
            if let Some(porter) = inner.porters.get_mut(&porter_id) {
                porter.available = true;
            }
        }
        Ok(transitioned)
    }
}

#[async_trait]
impl RatingsRepository for MemoryStore {
    async fn insert(&self, rating: &NewRating) -> Result<Rating, RepositoryError> {
        let mut inner = self.inner.lock().await;
        if inner.rated_bookings.contains(&rating.booking_id) {
            return Err(RepositoryError::Duplicate);
        }
        if !inner.porters.contains_key(&rating.porter_id) {
            return Err(RepositoryError::NotFound);
        }
        inner.rated_bookings.insert(rating.booking_id.clone());
        inner.next_rating_id += 1;
        let id = inner.next_rating_id;
        let porter = inner
            .porters
            .get_mut(&rating.porter_id)
            .ok_or(RepositoryError::NotFound)?;
        let count = porter.total_ratings as f64;
        porter.rating = (porter.rating * count + rating.score as f64) / (count + 1.0);
        porter.total_ratings += 1;
        Ok(Rating {
            id,
            booking_id: rating.booking_id.clone(),
            porter_id: rating.porter_id,
            customer_id: rating.customer_id,
            score: rating.score,
            comment: rating.comment.clone(),
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn porter_request(badge: &str, station: &str) -> NewPorterRequest {
        NewPorterRequest {
            user_id: 100,
            badge_number: badge.to_string(),
            station: station.to_string(),
        }
    }

    // MemoryStore implements several traits with colliding method names,
    // so the helpers pin the trait explicitly.
    async fn add_porter(store: &MemoryStore, badge: &str, station: &str) -> Porter {
        PortersRepository::insert(store, &porter_request(badge, station))
            .await
            .unwrap()
    }

    async fn porter_by_id(store: &MemoryStore, id: i32) -> Porter {
        PortersRepository::get(store, id).await.unwrap()
    }

    fn pending_booking(id: &str, porter_id: i32) -> Booking {
        let meeting = Utc::now() + Duration::hours(1);
        Booking {
            id: id.to_string(),
            customer_id: 42,
            porter_id,
            station: "Central".to_string(),
            weight_kg: 20,
            bag_count: 2,
            trolley_required: false,
            price: 120,
            contact_phone: "9998887776".to_string(),
            payment_session_id: format!("cs_{id}"),
            payment_status: PaymentStatus::Pending,
            otp_code: "123456".to_string(),
            otp_expiry: meeting + Duration::minutes(30),
            otp_verified: false,
            meeting_point: "Platform 4".to_string(),
            meeting_time: meeting,
            status: BookingStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reserve_picks_lowest_id_and_flips_availability() {
        let store = MemoryStore::new();
        let first = add_porter(&store, "P1", "Central").await;
        add_porter(&store, "P2", "Central").await;

        let reserved = store.reserve(Some("Central")).await.unwrap();
        assert_eq!(reserved, Some(first.id));
        assert!(!porter_by_id(&store, first.id).await.available);
    }

    #[tokio::test]
    async fn test_reserve_exclusive_under_concurrency() {
        let store = MemoryStore::new();
        add_porter(&store, "P1", "Central").await;

        let a = store.clone();
        let b = store.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.reserve(Some("Central")).await.unwrap() }),
            tokio::spawn(async move { b.reserve(Some("Central")).await.unwrap() }),
        );
        let results = [ra.unwrap(), rb.unwrap()];
        let wins = results.iter().filter(|r| r.is_some()).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_reserve_respects_station_filter() {
        let store = MemoryStore::new();
        add_porter(&store, "P1", "North").await;
        assert_eq!(store.reserve(Some("Central")).await.unwrap(), None);
        // System-wide reservation ignores the station.
        assert!(store.reserve(None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryStore::new();
        let porter = add_porter(&store, "P1", "Central").await;
        store.reserve(Some("Central")).await.unwrap();

        store.release(porter.id).await.unwrap();
        store.release(porter.id).await.unwrap();
        assert!(porter_by_id(&store, porter.id).await.available);
    }

    #[tokio::test]
    async fn test_duplicate_badge_station_rejected() {
        let store = MemoryStore::new();
        add_porter(&store, "P1", "Central").await;
        let err = PortersRepository::insert(&store, &porter_request("P1", "Central"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Duplicate));
        // Same badge at another station is fine.
        add_porter(&store, "P1", "North").await;
    }

    #[tokio::test]
    async fn test_begin_service_requires_both_flags() {
        let store = MemoryStore::new();
        let porter = add_porter(&store, "P1", "Central").await;
        let booking = pending_booking("b-1", porter.id);
        BookingsRepository::create(&store, &booking).await.unwrap();

        assert!(!store.begin_service("b-1").await.unwrap());

        store
            .set_payment_outcome("b-1", PaymentStatus::Authorized)
            .await
            .unwrap();
        assert!(!store.begin_service("b-1").await.unwrap());

        assert!(store.mark_otp_verified("b-1", "123456").await.unwrap());
        assert!(store.begin_service("b-1").await.unwrap());
        assert_eq!(
            BookingsRepository::get(&store, "b-1").await.unwrap().status,
            BookingStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_terminal_states_cannot_be_left() {
        let store = MemoryStore::new();
        let porter = add_porter(&store, "P1", "Central").await;
        let booking = pending_booking("b-1", porter.id);
        BookingsRepository::create(&store, &booking).await.unwrap();

        assert!(store.cancel_and_release("b-1", porter.id).await.unwrap());
        // A late payment event or verify must not resurrect the booking.
        assert!(!store
            .set_payment_outcome("b-1", PaymentStatus::Authorized)
            .await
            .unwrap());
        assert!(!store.mark_otp_verified("b-1", "123456").await.unwrap());
        assert!(!store.begin_service("b-1").await.unwrap());
        assert!(!store.complete_and_release("b-1", porter.id).await.unwrap());
        assert_eq!(
            BookingsRepository::get(&store, "b-1").await.unwrap().status,
            BookingStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_mark_otp_verified_requires_current_code() {
        let store = MemoryStore::new();
        let porter = add_porter(&store, "P1", "Central").await;
        let booking = pending_booking("b-1", porter.id);
        BookingsRepository::create(&store, &booking).await.unwrap();

        let expiry = Utc::now() + Duration::hours(2);
        assert!(store.rotate_otp("b-1", "654321", expiry).await.unwrap());

        // The rotated-away code can no longer verify.
        assert!(!store.mark_otp_verified("b-1", "123456").await.unwrap());
        assert!(!BookingsRepository::get(&store, "b-1").await.unwrap().otp_verified);
        assert!(store.mark_otp_verified("b-1", "654321").await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_and_release_frees_porter_with_status_flip() {
        let store = MemoryStore::new();
        let porter = add_porter(&store, "P1", "Central").await;
        store.reserve(Some("Central")).await.unwrap();
        let booking = pending_booking("b-1", porter.id);
        BookingsRepository::create(&store, &booking).await.unwrap();
        store
            .set_payment_outcome("b-1", PaymentStatus::Authorized)
            .await
            .unwrap();
        store.mark_otp_verified("b-1", "123456").await.unwrap();
        store.begin_service("b-1").await.unwrap();

        assert!(store.complete_and_release("b-1", porter.id).await.unwrap());
        assert_eq!(
            BookingsRepository::get(&store, "b-1").await.unwrap().status,
            BookingStatus::Completed
        );
        assert!(porter_by_id(&store, porter.id).await.available);
    }

    #[tokio::test]
    async fn test_failed_guard_leaves_porter_untouched() {
        let store = MemoryStore::new();
        let porter = add_porter(&store, "P1", "Central").await;
        store.reserve(Some("Central")).await.unwrap();
        let booking = pending_booking("b-1", porter.id);
        BookingsRepository::create(&store, &booking).await.unwrap();

        // Still pending, so completion does not match; the porter must
        // stay reserved.
        assert!(!store.complete_and_release("b-1", porter.id).await.unwrap());
        assert!(!porter_by_id(&store, porter.id).await.available);

        assert!(store.cancel_and_release("b-1", porter.id).await.unwrap());
        assert!(porter_by_id(&store, porter.id).await.available);
        // A repeated cancel is a no-op on both records.
        assert!(!store.cancel_and_release("b-1", porter.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_rating_running_mean() {
        let store = MemoryStore::new();
        let porter = add_porter(&store, "P1", "Central").await;

        for (i, score) in [5, 3, 4].into_iter().enumerate() {
            let rating = NewRating {
                booking_id: format!("b-{i}"),
                porter_id: porter.id,
                customer_id: 42,
                score,
                comment: None,
            };
            RatingsRepository::insert(&store, &rating).await.unwrap();
        }

        let porter = porter_by_id(&store, porter.id).await;
        assert_eq!(porter.total_ratings, 3);
        assert!((porter.rating - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_second_rating_for_same_booking_rejected() {
        let store = MemoryStore::new();
        let porter = add_porter(&store, "P1", "Central").await;
        let rating = NewRating {
            booking_id: "b-1".to_string(),
            porter_id: porter.id,
            customer_id: 42,
            score: 5,
            comment: Some("great".to_string()),
        };
        RatingsRepository::insert(&store, &rating).await.unwrap();
        let err = RatingsRepository::insert(&store, &rating).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Duplicate));

        // The aggregate only counted the first submission.
        let porter = porter_by_id(&store, porter.id).await;
        assert_eq!(porter.total_ratings, 1);
        assert!((porter.rating - 5.0).abs() < f64::EPSILON);
    }
}
