use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the
/// porter booking service.
///
/// The configuration is loaded from environment variables (optionally via
/// a `.env` file) or uses default values if the variable is not set.
/// Fields include database, Kafka, payment gateway, HTTP server and OTP
/// settings. This struct is deserializable via Serde.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name (e.g. "postgres" in Docker Compose, "localhost" for local runs).
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,

    // --- Kafka settings ---
    /// List of Kafka brokers (comma-separated string in env, parsed to Vec<String>).
    pub kafka_brokers: Vec<String>,
    /// Kafka topic carrying asynchronous payment results.
    pub payments_topic: String,
    /// Kafka consumer group ID for the payment events consumer.
    pub payments_group_id: String,
    /// Kafka topic the SMS bridge consumes notifications from.
    pub notifications_topic: String,

    // --- Payment gateway ---
    /// Base URL of the payment gateway HTTP API.
    pub payment_gateway_url: String,
    /// Currency all sessions are opened in.
    pub currency: String,

    // --- OTP ---
    /// How long after the meeting time the OTP stays valid
    /// (human-friendly format, e.g. "30m").
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub otp_ttl: Duration,

    // --- HTTP server ---
    /// The port on which the HTTP server will listen.
    pub http_port: u16,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub shutdown_timeout: Duration,
}

/// Custom deserializer for human-readable durations like "30m", "5s".
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from `.env` file).
    ///
    /// Fields not set via env will be filled with default values.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid or missing required values.
    pub fn load() -> Result<Self> {
        // Load from .env file (for Docker environment)
        dotenvy::dotenv().ok();

        // Note: These default values are for Docker Compose compatibility.
        // When running locally, these values should be overridden by environment variables
        // with localhost as hostname.
        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "porter_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "porter_db")?
            // Kafka
            .set_default("kafka_brokers", vec!["localhost:9092"])?
            .set_default("payments_topic", "payment-results")?
            .set_default("payments_group_id", "porter_payments_group")?
            .set_default("notifications_topic", "sms-notifications")?
            // Payment gateway
            .set_default("payment_gateway_url", "http://localhost:4242")?
            .set_default("currency", "INR")?
            // OTP validity window after the meeting time
            .set_default("otp_ttl", "30m")?
            // HTTP
            .set_default("http_port", 8081)?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?
            .add_source(config::Environment::default().separator("_"))
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }
}
