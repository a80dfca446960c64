use crate::auth::ApiKeyAuth;
use crate::error::{map_db_error, ApiError};
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use telemetry_core::alerts;
use telemetry_core::model::SensorFamily;

#[derive(sqlx::FromRow)]
struct FamilyCountRow {
    family: String,
    total: i64,
    active: i64,
}

#[utoipa::path(
    get,
    path = "/api/v1/dashboard/summary",
    tag = "dashboard",
    responses((status = 200, description = "Fleet summary for dashboards")),
    security(("ApiKey" = []))
)]
pub(crate) async fn dashboard_summary(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
) -> Result<Json<JsonValue>, ApiError> {
    let zones = key.zone_filter().map(|z| z.to_vec());
    let rows: Vec<FamilyCountRow> = sqlx::query_as(
        r#"
        SELECT
            family,
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE last_seen > NOW() - INTERVAL '24 hours') AS active
        FROM sensors
        WHERE ($1::text[] IS NULL OR metadata->>'zone' = ANY($1))
        GROUP BY family
        ORDER BY family
        "#,
    )
    .bind(zones)
    .fetch_all(state.store.read_pool())
    .await
    .map_err(map_db_error)?;

    let families: Vec<JsonValue> = rows
        .iter()
        .filter(|row| {
            SensorFamily::parse(&row.family)
                .map(|family| key.require_family(family).is_ok())
                .unwrap_or(false)
        })
        .map(|row| {
            json!({
                "family": row.family,
                "total": row.total,
                "active": row.active,
            })
        })
        .collect();

    let mut active_alerts = 0usize;
    for family in [SensorFamily::WaterLevel, SensorFamily::Moisture] {
        if key.require_family(family).is_err() {
            continue;
        }
        let scoped = super::zone_scoped_ids(&state, &key, family).await?;
        let latest = state
            .store
            .latest(family, scoped.as_deref(), super::MAX_PAGE_LIMIT)
            .await
            .map_err(map_db_error)?;
        active_alerts += latest
            .iter()
            .map(|reading| alerts::derive(reading).len())
            .sum::<usize>();
    }

    Ok(Json(json!({
        "tenant": key.tenant,
        "generated_at": Utc::now().to_rfc3339(),
        "families": families,
        "active_alerts": active_alerts,
    })))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/dashboard/summary", get(dashboard_summary))
}
