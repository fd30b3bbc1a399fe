//! Server crate provides HTTP server functionality.
//!
//! This module implements the HTTP surface of the porter booking backend:
//! booking lifecycle endpoints, porter registration, ratings, plus health
//! and Prometheus metrics endpoints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use model::Principal;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use serde::Deserialize;
use serde_json::json;
use service::{BookingService, ServiceError};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Server represents the HTTP server for the booking API.
pub struct Server {
    service: Arc<dyn BookingService>,
    port: u16,
    metrics: Arc<Metrics>,
}

/// Metrics collects and exposes HTTP server metrics.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )
        .expect("Failed to create http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )
        .expect("Failed to create http_request_duration_seconds metric");

        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of errors"),
            &["source", "endpoint"],
        )
        .expect("Failed to create errors_total metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("Failed to register http_requests_total metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("Failed to register http_request_duration_seconds metric");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("Failed to register errors_total metric");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
        }
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }

    fn record_error(&self, source: &str, endpoint: &str) {
        self.errors_total
            .with_label_values(&[source, endpoint])
            .inc();
    }
}

/// Authenticated caller, extracted from the `x-user-id` and `x-user-role`
/// headers set by the upstream auth proxy. Requests without both headers
/// are rejected with 401.
struct Auth(Principal);

impl<S> FromRequestParts<S> for Auth
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let role = parts
            .headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        match (user_id, role) {
            (Some(id), Some(role)) => Ok(Auth(Principal { id, role })),
            _ => Err(error_body(StatusCode::UNAUTHORIZED, "authentication required")),
        }
    }
}

/// Body of `POST /api/bookings/{id}/verify-otp`.
#[derive(Debug, Deserialize)]
struct VerifyOtpRequest {
    code: String,
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Maps a service error to its HTTP representation.
fn service_error_response(err: ServiceError) -> Response {
    let status = match &err {
        ServiceError::Validation(_) | ServiceError::OtpExpired | ServiceError::OtpInvalid => {
            StatusCode::BAD_REQUEST
        }
        ServiceError::AccessDenied => StatusCode::FORBIDDEN,
        ServiceError::NotFound => StatusCode::NOT_FOUND,
        ServiceError::NoPorterAvailable { .. }
        | ServiceError::IllegalTransition(_)
        | ServiceError::AlreadyRated => StatusCode::CONFLICT,
        ServiceError::Storage(_) | ServiceError::Gateway(_) => {
            error!("Request failed: {err}");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    error_body(status, &err.to_string())
}

impl Server {
    /// Creates a new Server instance.
    ///
    /// # Arguments
    ///
    /// * `port` - The port on which the server will listen
    /// * `service` - The booking service handling all business operations
    pub fn new(port: u16, service: Arc<dyn BookingService>) -> Self {
        info!("Initializing HTTP server on port {}", port);

        Self {
            service,
            port,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Starts the server and blocks until it's shut down.
    pub async fn start(&self) -> Result<()> {
        let app = self.create_router();

        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("HTTP server listening on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    fn create_router(&self) -> Router {
        let metrics = self.metrics.clone();

        Router::new()
            .route("/api/bookings", post(Self::handle_create_booking))
            .route("/api/bookings/{id}", get(Self::handle_get_booking))
            .route(
                "/api/bookings/{id}/verify-otp",
                post(Self::handle_verify_otp),
            )
            .route(
                "/api/bookings/{id}/resend-otp",
                post(Self::handle_resend_otp),
            )
            .route("/api/bookings/{id}/complete", post(Self::handle_complete))
            .route("/api/bookings/{id}/cancel", post(Self::handle_cancel))
            .route("/api/bookings/{id}/rating", post(Self::handle_submit_rating))
            .route("/api/porters", post(Self::handle_register_porter))
            .route("/health", get(Self::handle_health))
            .route("/metrics", get(Self::handle_metrics))
            .layer(axum::middleware::from_fn_with_state(
                metrics.clone(),
                Self::metrics_middleware,
            ))
            .with_state(AppState {
                service: self.service.clone(),
                metrics,
            })
    }

    /// Middleware for collecting metrics on HTTP requests
    async fn metrics_middleware(
        State(metrics): State<Arc<Metrics>>,
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> Response {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let start = std::time::Instant::now();
        let response = next.run(req).await;
        let duration = start.elapsed();

        let status = response.status().as_u16();
        metrics.record_request(&method, &path, status, duration);
        if status >= 400 {
            metrics.record_error("http", &path);
        }

        response
    }

    async fn handle_create_booking(
        State(state): State<AppState>,
        Auth(principal): Auth,
        Json(req): Json<model::NewBookingRequest>,
    ) -> Response {
        match state.service.create_booking(principal, req).await {
            Ok(booking) => (StatusCode::CREATED, Json(booking)).into_response(),
            Err(e) => service_error_response(e),
        }
    }

    async fn handle_get_booking(
        State(state): State<AppState>,
        Auth(principal): Auth,
        Path(booking_id): Path<String>,
    ) -> Response {
        match state.service.get_booking(principal, &booking_id).await {
            Ok(booking) => (StatusCode::OK, Json(booking)).into_response(),
            Err(e) => service_error_response(e),
        }
    }

    async fn handle_verify_otp(
        State(state): State<AppState>,
        Auth(principal): Auth,
        Path(booking_id): Path<String>,
        Json(req): Json<VerifyOtpRequest>,
    ) -> Response {
        match state
            .service
            .verify_otp(principal, &booking_id, &req.code)
            .await
        {
            Ok(booking) => (StatusCode::OK, Json(booking)).into_response(),
            Err(e) => service_error_response(e),
        }
    }

    async fn handle_resend_otp(
        State(state): State<AppState>,
        Auth(principal): Auth,
        Path(booking_id): Path<String>,
    ) -> Response {
        match state.service.resend_otp(principal, &booking_id).await {
            Ok(()) => (StatusCode::OK, Json(json!({ "status": "sent" }))).into_response(),
            Err(e) => service_error_response(e),
        }
    }

    async fn handle_complete(
        State(state): State<AppState>,
        Auth(principal): Auth,
        Path(booking_id): Path<String>,
    ) -> Response {
        match state.service.complete_booking(principal, &booking_id).await {
            Ok(booking) => (StatusCode::OK, Json(booking)).into_response(),
            Err(e) => service_error_response(e),
        }
    }

    async fn handle_cancel(
        State(state): State<AppState>,
        Auth(principal): Auth,
        Path(booking_id): Path<String>,
    ) -> Response {
        match state.service.cancel_booking(principal, &booking_id).await {
            Ok(booking) => (StatusCode::OK, Json(booking)).into_response(),
            Err(e) => service_error_response(e),
        }
    }

    async fn handle_submit_rating(
        State(state): State<AppState>,
        Auth(principal): Auth,
        Path(booking_id): Path<String>,
        Json(req): Json<model::SubmitRatingRequest>,
    ) -> Response {
        match state
            .service
            .submit_rating(principal, &booking_id, req)
            .await
        {
            Ok(rating) => (StatusCode::CREATED, Json(rating)).into_response(),
            Err(e) => service_error_response(e),
        }
    }

    async fn handle_register_porter(
        State(state): State<AppState>,
        Auth(principal): Auth,
        Json(req): Json<model::NewPorterRequest>,
    ) -> Response {
        match state.service.register_porter(principal, req).await {
            Ok(porter) => (StatusCode::CREATED, Json(porter)).into_response(),
            Err(e) => service_error_response(e),
        }
    }

    async fn handle_health() -> &'static str {
        "OK"
    }

    async fn handle_metrics(State(state): State<AppState>) -> Response {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
        }

        match String::from_utf8(buffer) {
            Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
            Err(e) => {
                error!("Failed to convert metrics to UTF-8: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
            }
        }
    }
}

/// Application state shared between request handlers
#[derive(Clone)]
struct AppState {
    service: Arc<dyn BookingService>,
    metrics: Arc<Metrics>,
}

/// Waits for a shutdown signal (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
