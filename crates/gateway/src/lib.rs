//! Outbound gateway seams: payment sessions and customer messaging.
//!
//! Both collaborators are external systems; the core only depends on the
//! traits defined here. The payment gateway is an HTTP+JSON service whose
//! results come back asynchronously as events (see the `payment-events`
//! crate). Messaging is best-effort: the SMS bridge consumes a Kafka
//! notifications topic, and a delivery failure never invalidates the OTP
//! already stored on the booking.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

/// Errors from outbound gateway calls.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Unexpected gateway response: {0}")]
    InvalidResponse(String),
}

/// Reference to an opened payment session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentSession {
    #[serde(rename = "session_id")]
    pub session_id: String,
}

/// Payment gateway contract: open a session for an amount; the gateway
/// reports the outcome asynchronously, keyed by the session id.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a payment session for `amount` in `currency`.
    ///
    /// # Errors
    /// Returns [`GatewayError`] when the gateway is unreachable or
    /// responds with something other than a session reference.
    async fn open_session(&self, amount: i64, currency: &str)
    -> Result<PaymentSession, GatewayError>;

    /// Voids a session that will never be charged (e.g. booking creation
    /// aborted after the session was opened).
    async fn void_session(&self, session_id: &str) -> Result<(), GatewayError>;
}

/// Messaging gateway contract: best-effort delivery of a short message.
/// Returns whether the delivery attempt was handed off successfully.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send(&self, destination: &str, body: &str) -> bool;
}

#[derive(Debug, Serialize)]
struct OpenSessionRequest<'a> {
    amount: i64,
    currency: &'a str,
}

/// HTTP+JSON payment gateway client.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn open_session(
        &self,
        amount: i64,
        currency: &str,
    ) -> Result<PaymentSession, GatewayError> {
        let response = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&OpenSessionRequest { amount, currency })
            .send()
            .await?
            .error_for_status()?;

        let session: PaymentSession = response.json().await?;
        if session.session_id.is_empty() {
            return Err(GatewayError::InvalidResponse(
                "empty session_id".to_string(),
            ));
        }
        info!(session_id = %session.session_id, amount, "Payment session opened");
        Ok(session)
    }

    async fn void_session(&self, session_id: &str) -> Result<(), GatewayError> {
        self.client
            .delete(format!("{}/sessions/{}", self.base_url, session_id))
            .send()
            .await?
            .error_for_status()?;
        info!(session_id = %session_id, "Payment session voided");
        Ok(())
    }
}

/// Payload published to the notifications topic for the SMS bridge.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmsNotification<'a> {
    pub to: &'a str,
    pub body: &'a str,
}

/// Kafka-backed messaging gateway: publishes SMS payloads to the
/// notifications topic, where the out-of-scope SMS bridge picks them up.
pub struct KafkaMessagingGateway {
    producer: FutureProducer,
    topic: String,
}

impl KafkaMessagingGateway {
    /// Creates a producer for the given brokers and notifications topic.
    pub fn new(brokers: &[String], topic: &str) -> Result<Self, GatewayError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl MessagingGateway for KafkaMessagingGateway {
    async fn send(&self, destination: &str, body: &str) -> bool {
        let payload = match serde_json::to_string(&SmsNotification {
            to: destination,
            body,
        }) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize notification: {e}");
                return false;
            }
        };

        let record = FutureRecord::to(&self.topic)
            .key(destination)
            .payload(&payload);

        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok(_) => {
                info!(destination = %destination, "Notification published");
                true
            }
            Err((e, _)) => {
                error!("Failed to publish notification: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_session_deserializes_gateway_response() {
        let json = r#"{"session_id": "cs_test_42"}"#;
        let session: PaymentSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.session_id, "cs_test_42");
    }

    #[test]
    fn test_sms_notification_payload_shape() {
        let payload = serde_json::to_string(&SmsNotification {
            to: "9998887776",
            body: "Your code is 123456",
        })
        .unwrap();
        assert_eq!(payload, r#"{"to":"9998887776","body":"Your code is 123456"}"#);
    }
}
