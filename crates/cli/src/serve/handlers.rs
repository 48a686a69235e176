//! HTTP route handlers over the provenance facade.
//!
//! Mutations answer `202 Accepted` with the local result; the ledger outcome
//! is read later from the status routes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use agritrace_engine::{EngineError, NewStep};
use agritrace_ledger::LedgerRead;
use agritrace_storage::{
    BatchRegistration, IdempotencyKey, OperationState, ProductRegistration, StorageError,
    TransferRecord,
};

use super::json_error;
use super::state::AppState;

/// Map an engine error to a status code and JSON body.
fn engine_error(err: EngineError) -> Response {
    let status = match &err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        EngineError::Fatal(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::WrongSubjectKind { .. }
        | EngineError::NotAbandoned { .. }
        | EngineError::Storage(StorageError::InvalidTransition { .. })
        | EngineError::Storage(StorageError::StepExists { .. })
        | EngineError::Storage(StorageError::SubjectExists { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }
    json_error(status, &err.to_string()).into_response()
}

fn accepted<T: serde::Serialize>(body: T) -> Response {
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

fn ok<T: serde::Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// GET /ledger
pub(crate) async fn handle_ledger(State(state): State<Arc<AppState>>) -> Response {
    ok(state.facade.ledger_info().await)
}

// ── Mutations ────────────────────────────────────────────────────────────────

/// POST /batches
pub(crate) async fn handle_register_batch(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<BatchRegistration>,
) -> Response {
    match state.facade.register_batch(batch).await {
        Ok(submission) => accepted(submission),
        Err(e) => engine_error(e),
    }
}

/// POST /products
pub(crate) async fn handle_register_product(
    State(state): State<Arc<AppState>>,
    Json(product): Json<ProductRegistration>,
) -> Response {
    match state.facade.register_product(product).await {
        Ok(submission) => accepted(submission),
        Err(e) => engine_error(e),
    }
}

/// POST /transfers
pub(crate) async fn handle_record_transfer(
    State(state): State<Arc<AppState>>,
    Json(transfer): Json<TransferRecord>,
) -> Response {
    match state.facade.record_transfer(transfer).await {
        Ok(submission) => accepted(submission),
        Err(e) => engine_error(e),
    }
}

/// POST /subjects/{code}/steps
///
/// The body is a step without `subject_code`; the path supplies it.
pub(crate) async fn handle_append_step(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(mut body): Json<serde_json::Value>,
) -> Response {
    let Some(fields) = body.as_object_mut() else {
        return json_error(StatusCode::BAD_REQUEST, "step body must be a JSON object")
            .into_response();
    };
    fields.insert("subject_code".to_string(), serde_json::Value::String(code));
    let step: NewStep = match serde_json::from_value(body) {
        Ok(s) => s,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid step: {}", e))
                .into_response()
        }
    };
    match state.facade.append_step(step).await {
        Ok((step, submission)) => accepted(serde_json::json!({
            "step": step,
            "ledger": submission,
        })),
        Err(e) => engine_error(e),
    }
}

/// POST /products/{code}/verify
pub(crate) async fn handle_mark_verified(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Response {
    match state.facade.mark_verified(&code).await {
        Ok(submission) => accepted(submission),
        Err(e) => engine_error(e),
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

/// GET /subjects/{code}/ledger-status
pub(crate) async fn handle_ledger_status(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Response {
    match state.facade.get_ledger_status(&code).await {
        Ok(status) => ok(status),
        Err(e) => engine_error(e),
    }
}

/// GET /products/{code}/verified
///
/// A ledger that cannot be asked answers 503 with `unknown`, never `false`.
pub(crate) async fn handle_verified(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Response {
    let read = state.facade.is_verified_on_chain(&code).await;
    let status = match &read {
        LedgerRead::Found(_) => StatusCode::OK,
        LedgerRead::NotFound => StatusCode::NOT_FOUND,
        LedgerRead::Unknown(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(read)).into_response()
}

// ── Operators ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct OperationsQuery {
    state: Option<String>,
}

/// GET /operations?state=...
pub(crate) async fn handle_operations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OperationsQuery>,
) -> Response {
    let filter = match query.state.as_deref() {
        None => None,
        Some(raw) => match OperationState::parse(raw) {
            Some(s) => Some(s),
            None => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    &format!("unknown state '{}'", raw),
                )
                .into_response()
            }
        },
    };
    match state.facade.operations(filter).await {
        Ok(ops) => ok(serde_json::json!({ "operations": ops })),
        Err(e) => engine_error(e),
    }
}

/// GET /operations/abandoned
pub(crate) async fn handle_abandoned(State(state): State<Arc<AppState>>) -> Response {
    match state.facade.abandoned().await {
        Ok(ops) => ok(serde_json::json!({ "operations": ops })),
        Err(e) => engine_error(e),
    }
}

/// POST /operations/{key}/resubmit
pub(crate) async fn handle_resubmit(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    match state
        .facade
        .resubmit_abandoned(&IdempotencyKey::from_raw(key))
        .await
    {
        Ok(op) => accepted(op),
        Err(e) => engine_error(e),
    }
}

/// POST /operations/corrective-pass
pub(crate) async fn handle_corrective_pass(State(state): State<Arc<AppState>>) -> Response {
    match state.facade.corrective_pass().await {
        Ok(revived) => accepted(serde_json::json!({ "revived": revived })),
        Err(e) => engine_error(e),
    }
}

/// POST /subjects/{code}/steps/{step_number}/resync
pub(crate) async fn handle_resync_step(
    State(state): State<Arc<AppState>>,
    Path((code, step_number)): Path<(String, u32)>,
) -> Response {
    match state.facade.resync_step(&code, step_number).await {
        Ok(submission) => accepted(submission),
        Err(e) => engine_error(e),
    }
}

/// GET /nonces/blocked
pub(crate) async fn handle_blocked_nonces(State(state): State<Arc<AppState>>) -> Response {
    ok(serde_json::json!({ "blocked": state.facade.blocked_nonces().await }))
}
