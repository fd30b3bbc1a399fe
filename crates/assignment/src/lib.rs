//! Porter assignment service.
//!
//! Owns the porter pool: a porter is claimed for exactly one booking via
//! [`Assignment::reserve`] and returned via [`Assignment::release`]. All
//! mutation of the availability flag funnels through here; the atomicity
//! of the claim itself is delegated to the repository's compare-and-set.

use std::sync::Arc;

use repository::{PortersRepository, RepositoryError};
use thiserror::Error;
use tracing::{info, warn};

/// Errors produced by the assignment service.
#[derive(Debug, Error)]
pub enum AssignmentError {
    /// No porter with `available = true` matched the requested station.
    #[error("No porter available{}", station_suffix(.station))]
    NotAvailable { station: Option<String> },
    /// A repository operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),
}

fn station_suffix(station: &Option<String>) -> String {
    match station {
        Some(s) => format!(" at station {s}"),
        None => String::new(),
    }
}

/// Assignment service over a porters repository.
pub struct Assignment<P> {
    porters: Arc<P>,
}

impl<P: PortersRepository> Assignment<P> {
    pub fn new(porters: Arc<P>) -> Self {
        Self { porters }
    }

    /// Exclusively reserves one available porter.
    ///
    /// The underlying repository performs a single atomic conditional
    /// update, so of any number of concurrent reserves against one free
    /// porter exactly one succeeds.
    ///
    /// # Errors
    /// [`AssignmentError::NotAvailable`] when the pool has no matching
    /// porter; the caller must not create a booking in that case.
    pub async fn reserve(&self, station: Option<&str>) -> Result<i32, AssignmentError> {
        match self.porters.reserve(station).await? {
            Some(porter_id) => {
                info!(porter_id, station = ?station, "Porter reserved");
                Ok(porter_id)
            }
            None => {
                warn!(station = ?station, "No porter available for reservation");
                Err(AssignmentError::NotAvailable {
                    station: station.map(str::to_string),
                })
            }
        }
    }

    /// Returns a porter to the pool. Idempotent: releasing an
    /// already-available porter is a no-op, not an error.
    pub async fn release(&self, porter_id: i32) -> Result<(), AssignmentError> {
        self.porters.release(porter_id).await?;
        info!(porter_id, "Porter released");
        Ok(())
    }
}
