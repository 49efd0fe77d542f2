//! `lotline serve`: HTTP JSON API over the custody workflow.
//!
//! Runs the state machine on the in-memory store and ledger, with the
//! ledger reconciler in the background.
//!
//! Security:
//! - CORS headers on all responses (permissive for local dev)
//! - Optional API key authentication via LOTLINE_API_KEY env var, required
//!   on every mutating route
//!
//! Endpoints:
//! - GET  /health                              - Server status
//! - GET  /ready                               - Ledger reachability
//! - GET  /trace/lot/{lot_code}                - Ordered history of a lot
//! - GET  /trace/lot/{lot_code}/verify         - Cross-check against the ledger
//! - GET  /trace/batch/{batch_id}              - Lookup by fingerprint identifier
//! - GET  /batches/{batch_id}/fingerprint.svg  - Verification fingerprint
//! - GET  /worklist/{phase}                    - Batches waiting at a phase
//! - GET  /summary?phase=                      - Status counts
//! - GET  /ledger/unconfirmed                  - Chain-unconfirmed work
//! - GET  /actors/{actor_id}/activity          - Batches or decisions by an actor
//! - POST /actors                              - Register a handler
//! - POST /batches                             - Create a batch
//! - POST /batches/{batch_id}/decisions        - Decide the current phase
//! - POST /batches/{batch_id}/confirm          - Attach a ledger batch id
//! - POST /batches/{batch_id}/ledger/retry     - Re-arm given-up ledger writes
//! - POST /records/{record_id}/confirm         - Attach a ledger tx hash
//!
//! All responses except the fingerprint use Content-Type: application/json.

mod handlers;
mod middleware;
mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use lotline_engine::{EngineConfig, EngineError, OpenMeteoCapture, PhaseStateMachine};
use lotline_ledger::MemoryLedger;
use lotline_storage::MemoryStore;
use tower_http::cors::{Any, CorsLayer};

use self::handlers::{
    handle_actor_activity, handle_confirm_batch, handle_confirm_record, handle_create_batch,
    handle_cross_check, handle_fingerprint_svg, handle_health, handle_not_found, handle_ready,
    handle_register_actor, handle_retry_ledger, handle_submit_decision, handle_summary,
    handle_trace_batch, handle_trace_lot, handle_unconfirmed, handle_worklist,
};
use self::middleware::auth_middleware;
pub(crate) use self::state::AppState;

/// Maximum request body size: 2 MB.
const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

/// Map an engine error onto an HTTP response.
fn engine_error(err: EngineError) -> axum::response::Response {
    let status = match &err {
        EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Conflict(_) | EngineError::StaleState(_) => StatusCode::CONFLICT,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::LedgerUnavailable(_) | EngineError::EvidenceUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::Consistency(_) | EngineError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if let EngineError::Validation(issues) = &err {
        let body = serde_json::json!({
            "error": err.to_string(),
            "fields": issues,
        });
        return (status, Json(body)).into_response();
    }
    json_error(status, &err.to_string()).into_response()
}

/// Build the router. Split out from [`start_server`] for in-process tests.
pub(crate) fn router(state: Arc<AppState>) -> Router {
    // CORS: permissive for local dev
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/trace/lot/{lot_code}", get(handle_trace_lot))
        .route("/trace/lot/{lot_code}/verify", get(handle_cross_check))
        .route("/trace/batch/{batch_id}", get(handle_trace_batch))
        .route("/batches/{batch_id}/fingerprint.svg", get(handle_fingerprint_svg))
        .route("/worklist/{phase}", get(handle_worklist))
        .route("/summary", get(handle_summary))
        .route("/ledger/unconfirmed", get(handle_unconfirmed))
        .route("/actors/{actor_id}/activity", get(handle_actor_activity))
        .route("/actors", post(handle_register_actor))
        .route("/batches", post(handle_create_batch))
        .route("/batches/{batch_id}/decisions", post(handle_submit_decision))
        .route("/batches/{batch_id}/confirm", post(handle_confirm_batch))
        .route("/batches/{batch_id}/ledger/retry", post(handle_retry_ledger))
        .route("/records/{record_id}/confirm", post(handle_confirm_record))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Build the state machine for `config`, attaching weather capture when
/// enabled and a site is configured.
pub(crate) fn build_machine(config: &EngineConfig) -> PhaseStateMachine<MemoryStore, MemoryLedger> {
    let machine = PhaseStateMachine::new(MemoryStore::new(), MemoryLedger::new(), config);
    match config.capture.site() {
        Some(site) if config.capture.enabled => {
            eprintln!(
                "Weather capture enabled for site {}, {}",
                site.latitude, site.longitude
            );
            machine.with_capture(Arc::new(OpenMeteoCapture::new(
                site,
                &config.capture.weather_url,
                config.capture.timeout(),
            )))
        }
        _ => machine,
    }
}

/// Start the HTTP server on the given port.
///
/// Security:
/// - CORS: Permissive (`Any` origin) for local dev; tighten for production.
/// - API key: If `LOTLINE_API_KEY` env var is set, mutating routes require auth.
pub async fn start_server(
    port: u16,
    config: EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    // API key: from LOTLINE_API_KEY env var (None = no auth)
    let api_key = std::env::var("LOTLINE_API_KEY")
        .ok()
        .filter(|k| !k.is_empty());
    if api_key.is_some() {
        eprintln!("API key authentication enabled");
    }

    let machine = build_machine(&config);
    machine.init().await?;
    let state = Arc::new(AppState::new(machine, api_key));
    let app = router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    eprintln!("Lotline listening on http://0.0.0.0:{}", port);
    tracing::info!(port, "server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush ledger work queued by the last requests.
    state.machine.shutdown().await?;
    eprintln!("\nServer shut down.");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    eprintln!("\nReceived shutdown signal...");
}
