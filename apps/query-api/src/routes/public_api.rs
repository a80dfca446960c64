use super::{reading_json, zone_scoped_ids};
use crate::auth::{ApiKeyAuth, KeyContext};
use crate::error::{map_db_error, ApiError};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use telemetry_core::model::SensorFamily;
use telemetry_core::time::{format_be_date, local_day_utc_range, parse_be_date};

fn parse_public_family(raw: &str) -> Result<SensorFamily, ApiError> {
    match raw {
        "water-levels" | "water-level" => Ok(SensorFamily::WaterLevel),
        "moisture" => Ok(SensorFamily::Moisture),
        "weather" => Ok(SensorFamily::Weather),
        other => Err(ApiError::not_found(format!("unknown family '{other}'"))),
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct PublicDateQuery {
    /// Buddhist-Era calendar day, `DD/MM/YYYY`.
    date: Option<String>,
}

/// A BE `date` names an Asia/Bangkok calendar day; the window is its UTC
/// projection.
fn public_window(query: &PublicDateQuery) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let raw = query.date.as_deref().ok_or_else(|| {
        ApiError::bad_request("date=DD/MM/YYYY (Buddhist Era) is required")
    })?;
    let day = parse_be_date(raw).map_err(ApiError::bad_request)?;
    Ok(local_day_utc_range(day))
}

/// Reading plus the Buddhist-calendar sibling timestamp public consumers
/// expect.
fn public_reading_json(reading: &telemetry_core::model::Reading) -> JsonValue {
    let mut value = reading_json(reading);
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "timestamp_buddhist".to_string(),
            json!(format_be_date(reading.time())),
        );
    }
    value
}

#[utoipa::path(
    get,
    path = "/api/v1/public/{family}/latest",
    tag = "public",
    responses((status = 200, description = "Latest reading per sensor, BE timestamps included")),
    security(("ApiKey" = []))
)]
pub(crate) async fn public_latest(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Path(family): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let family = parse_public_family(&family)?;
    key.require_family(family)?;

    let scoped = zone_scoped_ids(&state, &key, family).await?;
    let latest = state
        .store
        .latest(family, scoped.as_deref(), super::MAX_PAGE_LIMIT)
        .await
        .map_err(map_db_error)?;
    let data: Vec<JsonValue> = latest.iter().map(public_reading_json).collect();
    Ok(Json(json!({ "data": data })))
}

#[utoipa::path(
    get,
    path = "/api/v1/public/{family}/timeseries",
    tag = "public",
    responses(
        (status = 200, description = "Readings for the BE calendar day"),
        (status = 400, description = "Missing or invalid BE date")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn public_timeseries(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Path(family): Path<String>,
    Query(query): Query<PublicDateQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let family = parse_public_family(&family)?;
    key.require_family(family)?;
    let (start, end) = public_window(&query)?;

    let sensor_ids = family_sensor_ids(&state, &key, family).await?;
    let page = state
        .store
        .series(family, &sensor_ids, start, end, telemetry_core::store::MAX_SERIES_ROWS)
        .await
        .map_err(map_db_error)?;

    let data: Vec<JsonValue> = page.readings.iter().map(public_reading_json).collect();
    Ok(Json(json!({
        "date_buddhist": query.date,
        "start": start.to_rfc3339(),
        "end": end.to_rfc3339(),
        "data": data,
        "truncated": page.truncated,
        "next_cursor": page.next_cursor,
    })))
}

#[utoipa::path(
    get,
    path = "/api/v1/public/{family}/statistics",
    tag = "public",
    responses(
        (status = 200, description = "Statistics for the BE calendar day"),
        (status = 400, description = "Missing or invalid BE date")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn public_statistics(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Path(family): Path<String>,
    Query(query): Query<PublicDateQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let family = parse_public_family(&family)?;
    key.require_family(family)?;
    let (start, end) = public_window(&query)?;

    let scoped = zone_scoped_ids(&state, &key, family).await?;
    let stats = state
        .store
        .statistics(family, scoped.as_deref(), start, end)
        .await
        .map_err(map_db_error)?;

    Ok(Json(json!({
        "date_buddhist": query.date,
        "start": start.to_rfc3339(),
        "end": end.to_rfc3339(),
        "min": stats.min,
        "max": stats.max,
        "avg": stats.avg,
        "count": stats.count,
    })))
}

async fn family_sensor_ids(
    state: &AppState,
    key: &KeyContext,
    family: SensorFamily,
) -> Result<Vec<String>, ApiError> {
    let page = state
        .store
        .list_sensors(Some(&[family]), key.zone_filter(), 1, super::MAX_PAGE_LIMIT)
        .await
        .map_err(map_db_error)?;
    Ok(page.sensors.into_iter().map(|sensor| sensor.id).collect())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/public/{family}/latest", get(public_latest))
        .route("/public/{family}/timeseries", get(public_timeseries))
        .route("/public/{family}/statistics", get(public_statistics))
}
