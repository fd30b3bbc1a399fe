//! PostgreSQL implementations of the repository traits.
//!
//! Every implementation shares a deadpool connection pool. All state
//! transitions are expressed as conditional single-statement updates so
//! the database serializes concurrent writers; the reservation query uses
//! `FOR UPDATE SKIP LOCKED` so two concurrent reserves never block on or
//! claim the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use model::{Booking, BookingStatus, NewPorterRequest, PaymentStatus, Porter, Rating};
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;

use crate::{BookingsRepository, NewRating, PortersRepository, RatingsRepository, RepositoryError};

/// Maps unique-constraint violations to [`RepositoryError::Duplicate`].
fn map_db_err(e: tokio_postgres::Error) -> RepositoryError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        RepositoryError::Duplicate
    } else {
        RepositoryError::Db(e)
    }
}

fn porter_from_row(row: &Row) -> Porter {
    Porter {
        id: row.get("id"),
        user_id: row.get("user_id"),
        badge_number: row.get("badge_number"),
        station: row.get("station"),
        available: row.get("available"),
        rating: row.get("rating"),
        total_ratings: row.get("total_ratings"),
        created_at: row.get("created_at"),
    }
}

fn booking_from_row(row: &Row) -> Booking {
    Booking {
        id: row.get("id"),
        customer_id: row.get("customer_id"),
        porter_id: row.get("porter_id"),
        station: row.get("station"),
        weight_kg: row.get("weight_kg"),
        bag_count: row.get("bag_count"),
        trolley_required: row.get("trolley_required"),
        price: row.get("price"),
        contact_phone: row.get("contact_phone"),
        payment_session_id: row.get("payment_session_id"),
        payment_status: row.get::<_, PaymentStatus>("payment_status"),
        otp_code: row.get("otp_code"),
        otp_expiry: row.get("otp_expiry"),
        otp_verified: row.get("otp_verified"),
        meeting_point: row.get("meeting_point"),
        meeting_time: row.get("meeting_time"),
        status: row.get::<_, BookingStatus>("status"),
        created_at: row.get("created_at"),
    }
}

/// PostgreSQL implementation of [`PortersRepository`].
pub struct PgPortersRepository {
    pool: Pool,
}

impl PgPortersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PortersRepository for PgPortersRepository {
    async fn insert(&self, porter: &NewPorterRequest) -> Result<Porter, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO porters (user_id, badge_number, station)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, badge_number, station, available,
                      rating, total_ratings, created_at
        "#;
        let row = client
            .query_one(
                query,
                &[&porter.user_id, &porter.badge_number, &porter.station],
            )
            .await
            .map_err(map_db_err)?;
        Ok(porter_from_row(&row))
    }

    async fn get(&self, porter_id: i32) -> Result<Porter, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT id, user_id, badge_number, station, available,
                   rating, total_ratings, created_at
            FROM porters WHERE id = $1
        "#;
        let row = client.query_opt(query, &[&porter_id]).await?;
        match row {
            Some(row) => Ok(porter_from_row(&row)),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_by_user(&self, user_id: i64) -> Result<Porter, RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT id, user_id, badge_number, station, available,
                   rating, total_ratings, created_at
            FROM porters WHERE user_id = $1
        "#;
        let row = client.query_opt(query, &[&user_id]).await?;
        match row {
            Some(row) => Ok(porter_from_row(&row)),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn reserve(&self, station: Option<&str>) -> Result<Option<i32>, RepositoryError> {
        let client = self.pool.get().await?;
        // Compare-and-set in one statement. SKIP LOCKED keeps concurrent
        // reserves from claiming the same porter; ORDER BY id makes the
        // selection deterministic.
        let row = match station {
            Some(station) => {
                let query = r#"
                    UPDATE porters SET available = FALSE
                    WHERE id = (
                        SELECT id FROM porters
                        WHERE station = $1 AND available = TRUE
                        ORDER BY id
                        FOR UPDATE SKIP LOCKED
                        LIMIT 1
                    )
                    RETURNING id
                "#;
                client.query_opt(query, &[&station]).await?
            }
            None => {
                let query = r#"
                    UPDATE porters SET available = FALSE
                    WHERE id = (
                        SELECT id FROM porters
                        WHERE available = TRUE
                        ORDER BY id
                        FOR UPDATE SKIP LOCKED
                        LIMIT 1
                    )
                    RETURNING id
                "#;
                client.query_opt(query, &[]).await?
            }
        };
        Ok(row.map(|r| r.get("id")))
    }

    async fn release(&self, porter_id: i32) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        // Unconditional set keeps the operation idempotent.
        client
            .execute("UPDATE porters SET available = TRUE WHERE id = $1", &[&porter_id])
            .await?;
        Ok(())
    }
}

/// PostgreSQL implementation of [`BookingsRepository`].
pub struct PgBookingsRepository {
    pool: Pool,
}

impl PgBookingsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingsRepository for PgBookingsRepository {
    async fn create(&self, booking: &Booking) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO bookings (
                id, customer_id, porter_id, station, weight_kg, bag_count,
                trolley_required, price, contact_phone, payment_session_id,
                payment_status, otp_code, otp_expiry, otp_verified,
                meeting_point, meeting_time, status, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
        "#;
        client
            .execute(
                query,
                &[
                    &booking.id,
                    &booking.customer_id,
                    &booking.porter_id,
                    &booking.station,
                    &booking.weight_kg,
                    &booking.bag_count,
                    &booking.trolley_required,
                    &booking.price,
                    &booking.contact_phone,
                    &booking.payment_session_id,
                    &booking.payment_status,
                    &booking.otp_code,
                    &booking.otp_expiry,
                    &booking.otp_verified,
                    &booking.meeting_point,
                    &booking.meeting_time,
                    &booking.status,
                    &booking.created_at,
                ],
            )
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn get(&self, booking_id: &str) -> Result<Booking, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM bookings WHERE id = $1", &[&booking_id])
            .await?;
        match row {
            Some(row) => Ok(booking_from_row(&row)),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_by_payment_session(&self, session_id: &str) -> Result<Booking, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM bookings WHERE payment_session_id = $1",
                &[&session_id],
            )
            .await?;
        match row {
            Some(row) => Ok(booking_from_row(&row)),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn set_payment_outcome(
        &self,
        booking_id: &str,
        status: PaymentStatus,
    ) -> Result<bool, RepositoryError> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                r#"
                UPDATE bookings SET payment_status = $2
                WHERE id = $1 AND payment_status = 'pending' AND status = 'pending'
                "#,
                &[&booking_id, &status],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn mark_otp_verified(
        &self,
        booking_id: &str,
        code: &str,
    ) -> Result<bool, RepositoryError> {
        let client = self.pool.get().await?;
        // Conditional on the stored code so a concurrently rotated OTP
        // cannot be confirmed with the superseded value.
        let rows = client
            .execute(
                r#"
                UPDATE bookings SET otp_verified = TRUE
                WHERE id = $1 AND status = 'pending' AND otp_code = $2
                "#,
                &[&booking_id, &code],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn begin_service(&self, booking_id: &str) -> Result<bool, RepositoryError> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                r#"
                UPDATE bookings SET status = 'in_progress'
                WHERE id = $1 AND status = 'pending'
                  AND payment_status = 'authorized' AND otp_verified = TRUE
                "#,
                &[&booking_id],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn rotate_otp(
        &self,
        booking_id: &str,
        code: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                r#"
                UPDATE bookings SET otp_code = $2, otp_expiry = $3
                WHERE id = $1 AND status = 'pending' AND otp_verified = FALSE
                "#,
                &[&booking_id, &code, &expiry],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn complete_and_release(
        &self,
        booking_id: &str,
        porter_id: i32,
    ) -> Result<bool, RepositoryError> {
        let mut client = self.pool.get().await?;
        // Status flip and porter release commit together; a failure after
        // the guard matched rolls both back.
        let tx = client.transaction().await?;
        let rows = tx
            .execute(
                "UPDATE bookings SET status = 'completed' WHERE id = $1 AND status = 'in_progress'",
                &[&booking_id],
            )
            .await?;
        if rows == 1 {
            tx.execute(
                "UPDATE porters SET available = TRUE WHERE id = $1",
                &[&porter_id],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(rows == 1)
    }

    async fn cancel_and_release(
        &self,
        booking_id: &str,
        porter_id: i32,
    ) -> Result<bool, RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let rows = tx
            .execute(
                "UPDATE bookings SET status = 'cancelled' WHERE id = $1 AND status = 'pending'",
                &[&booking_id],
            )
            .await?;
        if rows == 1 {
            tx.execute(
                "UPDATE porters SET available = TRUE WHERE id = $1",
                &[&porter_id],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(rows == 1)
    }
}

/// PostgreSQL implementation of [`RatingsRepository`].
pub struct PgRatingsRepository {
    pool: Pool,
}

impl PgRatingsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RatingsRepository for PgRatingsRepository {
    async fn insert(&self, rating: &NewRating) -> Result<Rating, RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_one(
                r#"
                INSERT INTO ratings (booking_id, porter_id, customer_id, score, comment)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, created_at
                "#,
                &[
                    &rating.booking_id,
                    &rating.porter_id,
                    &rating.customer_id,
                    &rating.score,
                    &rating.comment,
                ],
            )
            .await
            .map_err(map_db_err)?;

        // Running mean, folded in the same transaction as the insert so a
        // concurrent rating for the same porter serializes on the row.
        tx.execute(
            r#"
            UPDATE porters
            SET rating = (rating * total_ratings + $2) / (total_ratings + 1),
                total_ratings = total_ratings + 1
            WHERE id = $1
            "#,
            &[&rating.porter_id, &(rating.score as f64)],
        )
        .await?;

        tx.commit().await?;

        Ok(Rating {
            id: row.get("id"),
            booking_id: rating.booking_id.clone(),
            porter_id: rating.porter_id,
            customer_id: rating.customer_id,
            score: rating.score,
            comment: rating.comment.clone(),
            created_at: row.get("created_at"),
        })
    }
}
