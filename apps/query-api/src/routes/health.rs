use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service is up"))
)]
pub(crate) async fn health() -> Json<JsonValue> {
    Json(json!({
        "status": "healthy",
        "service": "query-api",
        "ts": Utc::now().to_rfc3339(),
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
