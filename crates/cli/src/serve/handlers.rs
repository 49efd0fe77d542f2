//! HTTP route handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use lotline_core::{Decision, Evidence, Fingerprint, Phase};
use lotline_engine::{CreateBatchRequest, DecisionRequest};
use lotline_storage::Actor;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::state::AppState;
use super::{engine_error, json_error};

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

fn parse_body<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, Response> {
    serde_json::from_value(body).map_err(|e| {
        json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            &format!("invalid request body: {}", e),
        )
        .into_response()
    })
}

fn parse_phase(raw: &str) -> Result<Phase, Response> {
    raw.parse::<Phase>()
        .map_err(|e| json_error(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()).into_response())
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// 200 when the ledger is reachable, 503 otherwise. Custody routes keep
/// working either way.
pub(crate) async fn handle_ready(State(state): State<Arc<AppState>>) -> Response {
    match state.machine.ready().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ready"}))).into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Reads ────────────────────────────────────────────────────────────────────

/// GET /trace/lot/{lot_code}
pub(crate) async fn handle_trace_lot(
    State(state): State<Arc<AppState>>,
    Path(lot_code): Path<String>,
) -> Response {
    match state.reader.lookup(&lot_code).await {
        Ok(Some(trace)) => (StatusCode::OK, Json(trace)).into_response(),
        Ok(None) => json_error(
            StatusCode::NOT_FOUND,
            &format!("lot '{}' not found", lot_code),
        )
        .into_response(),
        Err(e) => engine_error(e),
    }
}

/// GET /trace/lot/{lot_code}/verify
pub(crate) async fn handle_cross_check(
    State(state): State<Arc<AppState>>,
    Path(lot_code): Path<String>,
) -> Response {
    match state.reader.cross_check(&lot_code).await {
        Ok(Some(check)) => (StatusCode::OK, Json(check)).into_response(),
        Ok(None) => json_error(
            StatusCode::NOT_FOUND,
            &format!("lot '{}' not found", lot_code),
        )
        .into_response(),
        Err(e) => engine_error(e),
    }
}

/// GET /trace/batch/{batch_id}
pub(crate) async fn handle_trace_batch(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> Response {
    match state.reader.lookup_batch(&batch_id).await {
        Ok(Some(trace)) => (StatusCode::OK, Json(trace)).into_response(),
        Ok(None) => json_error(
            StatusCode::NOT_FOUND,
            &format!("batch '{}' not found", batch_id),
        )
        .into_response(),
        Err(e) => engine_error(e),
    }
}

/// GET /batches/{batch_id}/fingerprint.svg
pub(crate) async fn handle_fingerprint_svg(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> Response {
    match state.reader.lookup_batch(&batch_id).await {
        Ok(Some(_)) => {
            let svg = Fingerprint::generate(&batch_id).to_svg();
            (StatusCode::OK, [(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response()
        }
        Ok(None) => json_error(
            StatusCode::NOT_FOUND,
            &format!("batch '{}' not found", batch_id),
        )
        .into_response(),
        Err(e) => engine_error(e),
    }
}

/// GET /worklist/{phase}
pub(crate) async fn handle_worklist(
    State(state): State<Arc<AppState>>,
    Path(phase): Path<String>,
) -> Response {
    let phase = match parse_phase(&phase) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.reader.worklist(phase).await {
        Ok(batches) => {
            let body = serde_json::json!({ "phase": phase, "batches": batches });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SummaryParams {
    phase: Option<String>,
}

/// GET /summary
pub(crate) async fn handle_summary(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SummaryParams>,
) -> Response {
    let phase = match params.phase.as_deref().map(parse_phase).transpose() {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.reader.status_summary(phase).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => engine_error(e),
    }
}

/// GET /actors/{actor_id}/activity
pub(crate) async fn handle_actor_activity(
    State(state): State<Arc<AppState>>,
    Path(actor_id): Path<String>,
) -> Response {
    match state.reader.actor_activity(&actor_id).await {
        Ok(activity) => (StatusCode::OK, Json(activity)).into_response(),
        Err(e) => engine_error(e),
    }
}

/// GET /ledger/unconfirmed
pub(crate) async fn handle_unconfirmed(State(state): State<Arc<AppState>>) -> Response {
    match state.machine.unconfirmed_report().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Writes ───────────────────────────────────────────────────────────────────

/// POST /actors
pub(crate) async fn handle_register_actor(
    State(state): State<Arc<AppState>>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let actor: Actor = match parse_body(parsed) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let actor_id = actor.actor_id.clone();
    match state.machine.register_actor(actor).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "actor_id": actor_id })),
        )
            .into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateBatchBody {
    actor_id: String,
    #[serde(flatten)]
    request: CreateBatchRequest,
}

/// POST /batches
pub(crate) async fn handle_create_batch(
    State(state): State<Arc<AppState>>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let body: CreateBatchBody = match parse_body(parsed) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.machine.create_batch(&body.actor_id, body.request).await {
        Ok(created) => {
            let response = serde_json::json!({
                "batch": created.batch,
                "record": created.record,
                "fingerprint": {
                    "data_url": created.fingerprint.to_data_url(),
                    "svg_path": format!("/batches/{}/fingerprint.svg", created.batch.batch_id),
                },
            });
            (StatusCode::CREATED, Json(response)).into_response()
        }
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct DecisionBody {
    actor_id: String,
    phase: Phase,
    decision: Decision,
    notes: String,
    #[serde(default)]
    evidence: Evidence,
}

/// POST /batches/{batch_id}/decisions
pub(crate) async fn handle_submit_decision(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let body: DecisionBody = match parse_body(parsed) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let request = DecisionRequest {
        batch_id,
        actor_id: body.actor_id,
        actor_phase: body.phase,
        decision: body.decision,
        notes: body.notes,
        evidence: body.evidence,
    };
    match state.machine.submit_decision(request).await {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    tx_hash: String,
}

/// POST /records/{record_id}/confirm
pub(crate) async fn handle_confirm_record(
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<i64>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let body: ConfirmBody = match parse_body(parsed) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state
        .machine
        .confirm_ledger_write(record_id, &body.tx_hash)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "record_id": record_id, "tx_hash": body.tx_hash })),
        )
            .into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ConfirmBatchBody {
    chain_id: u64,
}

/// POST /batches/{batch_id}/confirm
pub(crate) async fn handle_confirm_batch(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let body: ConfirmBatchBody = match parse_body(parsed) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state
        .machine
        .confirm_batch_on_ledger(&batch_id, body.chain_id)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "batch_id": batch_id, "chain_id": body.chain_id })),
        )
            .into_response(),
        Err(e) => engine_error(e),
    }
}

/// POST /batches/{batch_id}/ledger/retry
pub(crate) async fn handle_retry_ledger(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> Response {
    match state.machine.retry_ledger_writes(&batch_id).await {
        Ok(rearmed) => (
            StatusCode::OK,
            Json(serde_json::json!({ "batch_id": batch_id, "rearmed": rearmed })),
        )
            .into_response(),
        Err(e) => engine_error(e),
    }
}
