//! HTTP middleware: API key authentication.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::state::AppState;

/// If an API key is configured, every request except `/health` must carry
/// either `Authorization: Bearer <key>` or `X-API-Key: <key>`.
pub(crate) async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(request).await;
    };
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let headers = request.headers();
    let matches = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(|key| key == expected);

    match matches {
        Some(true) => next.run(request).await,
        Some(false) => super::json_error(StatusCode::FORBIDDEN, "invalid API key").into_response(),
        None => {
            super::json_error(StatusCode::UNAUTHORIZED, "authentication required").into_response()
        }
    }
}
