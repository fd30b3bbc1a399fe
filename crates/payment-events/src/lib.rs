//! Kafka consumer for asynchronous payment results.
//!
//! The payment gateway reports session outcomes as JSON events on a
//! Kafka topic. This consumer feeds them into the booking state machine
//! via [`BookingService::confirm_payment`]; stale or malformed events
//! are logged and skipped so the stream never wedges.

use std::sync::Arc;

use anyhow::Result;
use model::PaymentOutcome;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use serde::Deserialize;
use serde_json::from_slice;
use service::BookingService;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

/// Wire shape of a payment result event.
#[derive(Debug, Deserialize)]
pub struct PaymentEvent {
    #[serde(rename = "session_id")]
    pub session_id: String,
    pub outcome: PaymentOutcome,
}

/// PaymentEventsConsumer wraps the underlying StreamConsumer and the
/// booking service it drives.
pub struct PaymentEventsConsumer<S: BookingService + 'static> {
    consumer: StreamConsumer,
    bookings: Arc<S>,
}

impl<S: BookingService + 'static> PaymentEventsConsumer<S> {
    /// Create a consumer for the specified brokers/topic/group.
    pub fn new(
        brokers: &[String],
        topic: &str,
        group_id: &str,
        bookings: Arc<S>,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers.join(","))
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .create()?;

        consumer.subscribe(&[topic])?;
        Ok(Self { consumer, bookings })
    }

    /// Runs the consumption loop until the shutdown signal fires.
    pub async fn run(&self, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
        let mut stream = self.consumer.stream();

        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    match maybe_msg {
                        Some(Ok(msg)) => {
                            if let Err(e) = self.handle_message(&msg).await {
                                error!("Failed to handle payment event: {e}");
                            }
                        }
                        Some(Err(e)) => {
                            error!("Kafka error: {e}");
                        }
                        None => {
                            debug!("Payment event stream ended.");
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("Payment events consumer received shutdown signal.");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handles a single event: parses JSON and applies it to the booking.
    async fn handle_message(&self, msg: &BorrowedMessage<'_>) -> Result<()> {
        let payload = msg
            .payload()
            .ok_or_else(|| anyhow::anyhow!("Empty payment event payload"))?;

        let event: PaymentEvent = match from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                error!("Failed to deserialize payment event JSON: {e}");
                return Ok(()); // Skip bad message, don't crash
            }
        };

        if let Err(e) = self
            .bookings
            .confirm_payment(&event.session_id, event.outcome)
            .await
        {
            // Unknown sessions and settled bookings are expected noise
            // from gateway retries; anything else is worth a log line.
            error!(session_id = %event.session_id, "Failed to apply payment event: {e}");
            return Ok(());
        }

        info!(session_id = %event.session_id, outcome = ?event.outcome, offset = msg.offset(), "Payment event applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_payment_event() {
        let json = r#"{"session_id": "cs_test_42", "outcome": "authorized"}"#;
        let event: PaymentEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.session_id, "cs_test_42");
        assert_eq!(event.outcome, PaymentOutcome::Authorized);
    }

    #[test]
    fn test_deserialize_failed_outcome() {
        let json = r#"{"session_id": "cs_test_43", "outcome": "failed"}"#;
        let event: PaymentEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.outcome, PaymentOutcome::Failed);
    }

    #[test]
    fn test_unknown_outcome_rejected() {
        let json = r#"{"session_id": "cs_test_44", "outcome": "maybe"}"#;
        assert!(serde_json::from_str::<PaymentEvent>(json).is_err());
    }
}
