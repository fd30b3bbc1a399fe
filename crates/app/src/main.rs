/// Porter Booking Backend Application
///
/// This is the main entry point for the porter booking service.
/// The application provides REST API endpoints for the booking lifecycle:
/// creating bookings, OTP verification at the meeting point, completion,
/// cancellation and porter ratings, with payment results arriving
/// asynchronously over Kafka.
///
/// # Architecture
///
/// The application follows a modular architecture with:
/// - Repository layer for data access
/// - Service layer for the booking state machine
/// - Gateway layer for the payment API and SMS dispatch
/// - API layer for HTTP endpoints
/// - Metrics for monitoring
///
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info};

use app_config::AppConfig;
use gateway::{HttpPaymentGateway, KafkaMessagingGateway};
use payment_events::PaymentEventsConsumer;
use repository::{PgBookingsRepository, PgPortersRepository, PgRatingsRepository};
use server::Server;
use service::BookingServiceImpl;

/// Initialize the tracing subscriber for logging
fn init_logger() -> Result<()> {
    tracing_subscriber::fmt::init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = init_logger() {
        eprintln!("Failed to initialize logger: {}", err);
        return Err(anyhow::anyhow!("Failed to initialize logger"));
    }

    info!("Porter Booking Backend starting...");

    // Create a cancellation token for graceful shutdown
    let shutdown = Arc::new(Notify::new());

    // Set up signal handlers for graceful shutdown
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown_signal.notify_one();
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    });

    // Load configuration
    let config = AppConfig::load().context("Failed to load configuration")?;

    // Initialize database
    let db_pool = match db::init_db_pool(&config).await {
        Ok(pool) => {
            info!("Database initialized successfully");
            pool
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            error!("Database connection is required for application to function properly");
            return Err(anyhow::anyhow!("Failed to initialize database"));
        }
    };

    // Initialize repositories over the shared pool
    let bookings_repo = Arc::new(PgBookingsRepository::new(db_pool.clone()));
    let porters_repo = Arc::new(PgPortersRepository::new(db_pool.clone()));
    let ratings_repo = Arc::new(PgRatingsRepository::new(db_pool.clone()));

    // Initialize outbound gateways
    let payment_gateway = Arc::new(HttpPaymentGateway::new(config.payment_gateway_url.clone()));
    let messaging_gateway = Arc::new(
        KafkaMessagingGateway::new(&config.kafka_brokers, &config.notifications_topic)
            .context("Failed to initialize messaging gateway")?,
    );

    let otp_ttl = chrono::Duration::from_std(config.otp_ttl)
        .context("OTP TTL out of range")?;

    // Initialize booking service
    let booking_service = Arc::new(BookingServiceImpl::new(
        bookings_repo,
        porters_repo,
        ratings_repo,
        payment_gateway,
        messaging_gateway,
        otp_ttl,
        config.currency.clone(),
    ));

    // Create a JoinSet to manage all our tasks
    let mut tasks = JoinSet::new();

    // Start payment events consumer
    info!("Initializing payment events consumer");
    let consumer_shutdown = shutdown.clone();
    match PaymentEventsConsumer::new(
        &config.kafka_brokers,
        &config.payments_topic,
        &config.payments_group_id,
        booking_service.clone(),
    ) {
        Ok(consumer) => {
            tasks.spawn(async move {
                info!("Starting payment events consumer");
                if let Err(err) = consumer.run(consumer_shutdown).await {
                    error!("Payment events consumer error: {}", err);
                }
            });
        }
        Err(err) => {
            error!("Failed to initialize payment events consumer: {}", err);
        }
    }

    // Start HTTP server
    info!("Using HTTP port: {}", config.http_port);
    let http_server = Server::new(config.http_port, booking_service);
    tasks.spawn(async move {
        if let Err(err) = http_server.start().await {
            error!("HTTP server error: {}", err);
            // Exit the application if the server fails to start
            std::process::exit(1);
        }
    });

    // Wait for all tasks to complete
    while let Some(res) = tasks.join_next().await {
        if let Err(err) = res {
            error!("Task error: {}", err);
        }
    }

    info!("Application stopped");
    Ok(())
}
