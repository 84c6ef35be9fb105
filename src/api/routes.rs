//! API route definitions.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::state::AppState;
use crate::detect::Severity;

const DEFAULT_HISTORY_LIMIT: usize = 20;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/history", get(history))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

/// 200 while the last run was SUCCESS or WARNING, 503 otherwise.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.status.load() {
        Ok(Some(doc)) => {
            let code = match doc.severity {
                Severity::Success | Severity::Warning => StatusCode::OK,
                Severity::Error => StatusCode::SERVICE_UNAVAILABLE,
            };
            (code, Json(json!({ "data": doc, "meta": meta() })))
        }
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "data": null, "meta": { "message": "no status yet" } })),
        ),
        Err(e) => {
            warn!(error = %e, "status document unreadable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "data": null, "meta": { "message": "status unreadable" } })),
            )
        }
    }
}

async fn status(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.status.load() {
        Ok(Some(doc)) => (StatusCode::OK, Json(json!({ "data": doc, "meta": meta() }))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "data": null, "meta": { "message": "no status yet" } })),
        ),
        Err(e) => {
            warn!(error = %e, "status document unreadable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "data": null, "meta": { "message": "status unreadable" } })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn history(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> (StatusCode, Json<Value>) {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match state.history.recent(limit) {
        Ok(records) => {
            let total = records.len();
            (
                StatusCode::OK,
                Json(json!({ "data": records, "meta": { "total": total, "limit": limit } })),
            )
        }
        Err(e) => {
            warn!(error = %e, "history unreadable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "data": [], "meta": { "message": "history unreadable" } })),
            )
        }
    }
}
