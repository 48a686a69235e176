//! `agritrace serve` -- HTTP JSON API over the provenance engine.
//!
//! Starts the engine (dispatcher and confirmation poller) and exposes the
//! facade as an async HTTP service using `axum` + `tokio`.
//!
//! Endpoints:
//! - GET  /health                                  - Server status (exempt from auth)
//! - GET  /ledger                                  - Network, account and nonce summary
//! - POST /batches                                 - Register a batch
//! - POST /products                                - Register a product
//! - POST /transfers                               - Record a product transfer
//! - POST /subjects/{code}/steps                   - Append a supply-chain step
//! - POST /products/{code}/verify                  - Mark a product verified
//! - GET  /subjects/{code}/ledger-status           - Per-operation sync status
//! - GET  /products/{code}/verified                - On-chain verification lookup
//! - GET  /operations?state=                       - List ledger operations
//! - GET  /operations/abandoned                    - List abandoned operations
//! - POST /operations/{key}/resubmit               - Revive an abandoned operation
//! - POST /operations/corrective-pass              - Revive every abandoned operation
//! - POST /subjects/{code}/steps/{n}/resync        - Re-mirror a committed step
//! - GET  /nonces/blocked                          - Head-of-line nonce blocks
//!
//! All responses use Content-Type: application/json.

mod handlers;
mod middleware;
mod state;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use agritrace_engine::{EngineBuilder, EngineConfig};
use agritrace_ledger::{AccountSigner, LedgerGateway, SimulatedLedger};

use self::handlers::{
    handle_abandoned, handle_append_step, handle_blocked_nonces, handle_corrective_pass,
    handle_health, handle_ledger, handle_ledger_status, handle_mark_verified, handle_not_found,
    handle_operations, handle_record_transfer, handle_register_batch, handle_register_product,
    handle_resubmit, handle_resync_step, handle_verified,
};
use self::middleware::auth_middleware;
use self::state::AppState;

/// Maximum request body size: 1 MB.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

/// Pick the gateway: an in-process ledger for `--simulate`, otherwise the
/// configured JSON-RPC endpoint.
fn gateway_for(
    config: &EngineConfig,
    simulate: bool,
) -> Result<Arc<dyn LedgerGateway>, Box<dyn std::error::Error>> {
    if !simulate {
        return Ok(Arc::new(agritrace_engine::connect(config)?));
    }
    let ledger = match &config.ledger.signing_key_path {
        Some(path) => SimulatedLedger::new(Some(AccountSigner::from_file(path)?)),
        None => SimulatedLedger::with_random_account(),
    };
    tracing::warn!("serving against a simulated ledger; nothing reaches a real chain");
    Ok(Arc::new(ledger))
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ledger", get(handle_ledger))
        .route("/batches", post(handle_register_batch))
        .route("/products", post(handle_register_product))
        .route("/transfers", post(handle_record_transfer))
        .route("/subjects/{code}/steps", post(handle_append_step))
        .route(
            "/subjects/{code}/steps/{step_number}/resync",
            post(handle_resync_step),
        )
        .route("/subjects/{code}/ledger-status", get(handle_ledger_status))
        .route("/products/{code}/verify", post(handle_mark_verified))
        .route("/products/{code}/verified", get(handle_verified))
        .route("/operations", get(handle_operations))
        .route("/operations/abandoned", get(handle_abandoned))
        .route("/operations/corrective-pass", post(handle_corrective_pass))
        .route("/operations/{key}/resubmit", post(handle_resubmit))
        .route("/nonces/blocked", get(handle_blocked_nonces))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Start the engine and serve the HTTP API on `port` until Ctrl+C.
///
/// If `[server] api_key` is set (or `AGRITRACE_API_KEY`), all endpoints
/// except /health require it.
pub async fn start_server(
    port: u16,
    config: EngineConfig,
    simulate: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = gateway_for(&config, simulate)?;
    let api_key = config.server.api_key.clone().filter(|k| !k.is_empty());
    if api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }

    let engine = EngineBuilder::new(config).gateway(gateway).start().await?;
    let state = Arc::new(AppState {
        facade: engine.facade().clone(),
        api_key,
    });

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "agritrace listening");
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    engine.shutdown().await;
    tracing::info!("server shut down");
    served?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
