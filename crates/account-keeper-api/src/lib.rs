//! # Account-Keeper HTTP Service
//!
//! HTTP surface for keeping local user accounts in sync with an auth provider
//! and a billing provider.
//!
//! This service provides:
//! - Signed webhook endpoints for both providers
//! - A redirect to the hosted billing checkout page
//! - Health, readiness, and Prometheus metrics endpoints
//!
//! Every webhook is verified, classified, and handed to the
//! [`Reconciler`]. Rejected events are written to a [`DeadLetterSink`]
//! before the error response is returned.

use account_keeper_core::{
    AccountStore, DeadLetterRecord, DeadLetterSink, FilesystemDeadLetterSink,
    InMemoryDeadLetterSink, ReconcileOutcome, Reconciler, Timestamp, WebhookProvider,
    WebhookRequest,
};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use std::{collections::HashMap, future::IntoFuture, sync::Arc, time::Duration, time::Instant};
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};

pub mod config;
pub mod errors;
pub mod metrics;
pub mod responses;

pub use config::{
    BillingConfig, DeadLetterConfig, LoggingConfig, ProviderConfig, ReconcilerConfig,
    ServerConfig, ServiceConfig, StoreConfig,
};
pub use errors::{ConfigError, ServiceError, WebhookHandlerError};
pub use metrics::ServiceMetrics;
pub use responses::{HealthResponse, ReadinessResponse, WebhookResponse};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration for the service
    pub config: Arc<ServiceConfig>,

    /// Verifier for `/webhooks/auth`
    pub auth_provider: Arc<dyn WebhookProvider>,

    /// Verifier for `/webhooks/billing`
    pub billing_provider: Arc<dyn WebhookProvider>,

    pub reconciler: Arc<Reconciler>,

    /// Account store, also probed by `/ready`
    pub store: Arc<dyn AccountStore>,

    /// Destination for every rejected event
    pub dead_letters: Arc<dyn DeadLetterSink>,

    /// Metrics collector for observability
    pub metrics: Arc<ServiceMetrics>,
}

impl AppState {
    /// Assemble state from explicit collaborators.
    ///
    /// The reconciler is built over `store` with the policy from
    /// `config.reconciler`.
    pub fn new(
        config: ServiceConfig,
        auth_provider: Arc<dyn WebhookProvider>,
        billing_provider: Arc<dyn WebhookProvider>,
        store: Arc<dyn AccountStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            config.reconciler.to_policy(),
        ));
        Self {
            config: Arc::new(config),
            auth_provider,
            billing_provider,
            reconciler,
            store,
            dead_letters,
            metrics,
        }
    }

    /// Build providers and metrics from an already validated `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a signing secret cannot be decoded or the
    /// metrics registry rejects a registration.
    pub fn from_config(
        config: ServiceConfig,
        store: Arc<dyn AccountStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Result<Self, ConfigError> {
        let auth_provider = Arc::new(config.build_auth_provider()?);
        let billing_provider = Arc::new(config.build_billing_provider()?);
        let metrics = ServiceMetrics::new()?;

        Ok(Self::new(
            config,
            auth_provider,
            billing_provider,
            store,
            dead_letters,
            metrics,
        ))
    }
}

/// Build the dead-letter sink selected by `config`.
///
/// # Errors
///
/// Returns [`ServiceError::Configuration`] when the filesystem root cannot be created.
pub async fn build_dead_letter_sink(
    config: &DeadLetterConfig,
) -> Result<Arc<dyn DeadLetterSink>, ServiceError> {
    match config {
        DeadLetterConfig::Memory => {
            warn!("Dead letters are kept in memory and will be lost on restart");
            Ok(Arc::new(InMemoryDeadLetterSink::new()))
        }
        DeadLetterConfig::Filesystem { root } => {
            let sink = FilesystemDeadLetterSink::new(root.clone())
                .await
                .map_err(|e| {
                    ServiceError::Configuration(ConfigError::Invalid {
                        message: format!(
                            "dead_letter.root '{}' is not usable: {}",
                            root.display(),
                            e
                        ),
                    })
                })?;
            Ok(Arc::new(sink))
        }
    }
}

// ============================================================================
// Router and Server
// ============================================================================

/// Create the HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let webhook_routes = Router::new()
        .route("/webhooks/auth", post(handle_auth_webhook))
        .route("/webhooks/billing", post(handle_billing_webhook));

    let billing_routes = Router::new().route("/billing/checkout", get(handle_checkout_redirect));

    let health_routes = Router::new()
        .route("/health", get(handle_health_check))
        .route("/ready", get(handle_readiness_check));

    let observability_routes = Router::new().route("/metrics", get(metrics_endpoint));

    let request_timeout = Duration::from_secs(state.config.server.timeout_seconds);
    let max_body_size = state.config.server.max_body_size;

    Router::new()
        .merge(webhook_routes)
        .merge(billing_routes)
        .merge(health_routes)
        .merge(observability_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(max_body_size))
                // Providers only redeliver on 5xx
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::SERVICE_UNAVAILABLE,
                    request_timeout,
                ))
                .into_inner(),
        )
        .with_state(state)
}

/// Bind the configured address and serve until SIGINT or SIGTERM.
///
/// In-flight requests get `server.shutdown_timeout_seconds` to finish once a
/// signal arrives; after that the server stops without waiting for them.
pub async fn start_server(state: AppState) -> Result<(), ServiceError> {
    let address = format!("{}:{}", state.config.server.host, state.config.server.port);
    let shutdown_timeout = Duration::from_secs(state.config.server.shutdown_timeout_seconds);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: address.clone(),
            message: e.to_string(),
        })?;

    info!(address = %address, "Starting HTTP server");

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let graceful = async move {
        shutdown_signal(shutdown_timeout).await;
        let _ = signalled_tx.send(());
    };

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .into_future();

    let drain_deadline = async move {
        match signalled_rx.await {
            Ok(()) => tokio::time::sleep(shutdown_timeout).await,
            // Server finished on its own
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = server => {
            result.map_err(|e| ServiceError::ServerFailed {
                message: e.to_string(),
            })?;
        }
        _ = drain_deadline => {
            warn!(
                timeout_seconds = shutdown_timeout.as_secs(),
                "Graceful shutdown timed out with requests still in flight"
            );
        }
    }

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_timeout: Duration) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown with {}s timeout", shutdown_timeout.as_secs());
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown with {}s timeout", shutdown_timeout.as_secs());
        },
    }
}

// ============================================================================
// Webhook Handlers
// ============================================================================

/// Receive an auth provider (user lifecycle) webhook
#[instrument(skip(state, headers, body), fields(provider = "auth"))]
pub async fn handle_auth_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let provider = state.auth_provider.clone();
    process_webhook(&state, provider.as_ref(), &headers, body).await
}

/// Receive a billing provider (customer, subscription, checkout) webhook
#[instrument(skip(state, headers, body), fields(provider = "billing"))]
pub async fn handle_billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let provider = state.billing_provider.clone();
    process_webhook(&state, provider.as_ref(), &headers, body).await
}

async fn process_webhook(
    state: &AppState,
    provider: &dyn WebhookProvider,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let started = Instant::now();
    let provider_label = provider.provider().as_str();

    let result = verify_and_reconcile(state, provider, headers, body).await;
    state
        .metrics
        .record_webhook_request(provider_label, started.elapsed());
    result
}

async fn verify_and_reconcile(
    state: &AppState,
    provider: &dyn WebhookProvider,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let provider_kind = provider.provider();
    let provider_label = provider_kind.as_str();

    // Header names are already lowercase in HeaderMap; values that are not
    // visible ASCII cannot carry a valid signature and are dropped
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|value| (k.as_str().to_lowercase(), value.to_string()))
        })
        .collect();
    let request = WebhookRequest::new(header_map, body);

    let event = match provider.ingest(&request) {
        Ok(event) => event,
        Err(e) => {
            state
                .metrics
                .verification_failures_total
                .with_label_values(&[provider_label, e.kind()])
                .inc();

            let (event_id, event_type) = best_effort_identity(&request);
            let record = DeadLetterRecord::new(
                provider_kind,
                event_id,
                event_type,
                e.kind(),
                e.to_string(),
                e.is_transient(),
                &request.body,
            );
            dead_letter(state, record).await;
            return Err(WebhookHandlerError::Verification(e));
        }
    };

    match state.reconciler.apply(&event).await {
        Ok(outcome) => {
            state
                .metrics
                .reconcile_outcomes_total
                .with_label_values(&[provider_label, outcome.as_str()])
                .inc();

            if let ReconcileOutcome::Skipped { reason } = &outcome {
                info!(event_id = %event.event_id, reason = %reason, "Webhook acknowledged without changes");
            } else {
                info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    outcome = outcome.as_str(),
                    "Webhook processed"
                );
            }

            Ok(Json(WebhookResponse {
                status: "ok".to_string(),
                event_id: event.event_id,
                event_type: event.event_type,
                outcome: outcome.as_str().to_string(),
            }))
        }
        Err(e) => {
            state
                .metrics
                .reconcile_errors_total
                .with_label_values(&[provider_label, e.kind()])
                .inc();

            let record = DeadLetterRecord::new(
                provider_kind,
                Some(event.event_id.to_string()),
                Some(event.event_type.clone()),
                e.kind(),
                e.to_string(),
                e.is_transient(),
                &request.body,
            );
            dead_letter(state, record).await;
            Err(WebhookHandlerError::Reconciliation(e))
        }
    }
}

/// Pull the event id and type out of a request that failed verification.
///
/// The auth provider carries its id in a header; the billing provider only
/// in the body. Nothing here is trusted beyond labelling the dead letter.
fn best_effort_identity(request: &WebhookRequest) -> (Option<String>, Option<String>) {
    let header_id = request
        .header("svix-id")
        .or_else(|| request.header("webhook-id"))
        .map(str::to_string);

    let body: Option<serde_json::Value> = serde_json::from_slice(&request.body).ok();
    let body_field = |key: &str| {
        body.as_ref()
            .and_then(|value| value.get(key))
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    (header_id.or_else(|| body_field("id")), body_field("type"))
}

/// Write a dead letter; failures are logged and counted but never change the response
async fn dead_letter(state: &AppState, record: DeadLetterRecord) {
    let record_id = record.record_id.clone();
    if let Err(e) = state.dead_letters.record(record).await {
        state.metrics.dead_letter_write_failures.inc();
        error!(record_id = %record_id, error = %e, "Failed to write dead letter");
    }
}

// ============================================================================
// Billing Handlers
// ============================================================================

/// Redirect to the hosted checkout page (`303 See Other`), or 404 when none is configured
pub async fn handle_checkout_redirect(State(state): State<AppState>) -> Response {
    match &state.config.billing.checkout_link {
        Some(link) => Redirect::to(link).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "No checkout link configured",
                "status": StatusCode::NOT_FOUND.as_u16(),
            })),
        )
            .into_response(),
    }
}

// ============================================================================
// Health and Observability Handlers
// ============================================================================

/// Basic health check endpoint
pub async fn handle_health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Timestamp::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check endpoint; ready when the account store answers in time
pub async fn handle_readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let timeout = state.reconciler.policy().store_timeout;
    let reason = match tokio::time::timeout(timeout, state.store.health_check()).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!(
            "account store did not answer within {}ms",
            timeout.as_millis()
        )),
    };

    if let Some(reason) = &reason {
        warn!(reason = %reason, "Readiness check failed");
    }

    let status = if reason.is_none() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: reason.is_none(),
            timestamp: Timestamp::now(),
            reason,
        }),
    )
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
