use super::{in_zones, parse_time_range, reading_json, sensor_json};
use crate::auth::{ApiKeyAuth, EndpointClass};
use crate::error::{map_db_error, ApiError};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use telemetry_core::model::{Reading, SensorFamily};

/// Legacy RID-MS surface: water-level sensors in the shapes the partner
/// integration was built against.

async fn rid_ms_sensors(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
) -> Result<Json<JsonValue>, ApiError> {
    key.require_class(EndpointClass::Advanced)?;
    key.require_family(SensorFamily::WaterLevel)?;

    let page = state
        .store
        .list_sensors(
            Some(&[SensorFamily::WaterLevel]),
            key.zone_filter(),
            1,
            super::MAX_PAGE_LIMIT,
        )
        .await
        .map_err(map_db_error)?;

    let now = Utc::now();
    let sensors: Vec<JsonValue> = page
        .sensors
        .iter()
        .map(|sensor| sensor_json(sensor, now))
        .collect();
    Ok(Json(json!({ "sensors": sensors, "total": page.total })))
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct RidMsReadingsQuery {
    sensor_id: String,
    start: Option<String>,
    end: Option<String>,
}

async fn rid_ms_readings(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Query(query): Query<RidMsReadingsQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    key.require_class(EndpointClass::Advanced)?;
    key.require_family(SensorFamily::WaterLevel)?;
    let (start, end) = parse_time_range(query.start.as_deref(), query.end.as_deref())?;

    // A sensor outside the key's zones reads as absent.
    let sensor = state
        .store
        .get_sensor(&query.sensor_id)
        .await
        .map_err(map_db_error)?
        .filter(|sensor| sensor.family == SensorFamily::WaterLevel)
        .filter(|sensor| in_zones(sensor, key.zone_filter()))
        .ok_or_else(|| ApiError::not_found("Sensor not found"))?;

    let page = state
        .store
        .series(
            SensorFamily::WaterLevel,
            &[sensor.id],
            start,
            end,
            telemetry_core::store::MAX_SERIES_ROWS,
        )
        .await
        .map_err(map_db_error)?;

    let readings: Vec<JsonValue> = page.readings.iter().map(reading_json).collect();
    Ok(Json(json!({
        "sensor_id": query.sensor_id,
        "readings": readings,
        "truncated": page.truncated,
    })))
}

/// GeoJSON FeatureCollection: one point Feature per located sensor with
/// its newest reading in the properties.
async fn rid_ms_spatial(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
) -> Result<Json<JsonValue>, ApiError> {
    key.require_class(EndpointClass::Advanced)?;
    key.require_family(SensorFamily::WaterLevel)?;

    let page = state
        .store
        .list_sensors(
            Some(&[SensorFamily::WaterLevel]),
            key.zone_filter(),
            1,
            super::MAX_PAGE_LIMIT,
        )
        .await
        .map_err(map_db_error)?;
    let scoped = super::zone_scoped_ids(&state, &key, SensorFamily::WaterLevel).await?;
    let latest = state
        .store
        .latest(SensorFamily::WaterLevel, scoped.as_deref(), super::MAX_PAGE_LIMIT)
        .await
        .map_err(map_db_error)?;
    let latest_by_id: HashMap<&str, &Reading> = latest
        .iter()
        .map(|reading| (reading.sensor_id(), reading))
        .collect();

    let features: Vec<JsonValue> = page
        .sensors
        .iter()
        .filter(|sensor| in_zones(sensor, key.zone_filter()))
        .filter_map(|sensor| {
            let location = sensor.location?;
            let mut properties = serde_json::Map::new();
            properties.insert("id".to_string(), json!(sensor.id));
            properties.insert("family".to_string(), json!(sensor.family.as_str()));
            properties.insert("last_seen".to_string(), json!(sensor.last_seen.to_rfc3339()));
            if let Some(reading) = latest_by_id.get(sensor.id.as_str()) {
                properties.insert("last_reading".to_string(), reading_json(reading));
            }
            Some(json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [location.lng, location.lat],
                },
                "properties": JsonValue::Object(properties),
            }))
        })
        .collect();

    Ok(Json(json!({
        "type": "FeatureCollection",
        "features": features,
    })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/external/rid-ms/sensors", get(rid_ms_sensors))
        .route("/external/rid-ms/readings", get(rid_ms_readings))
        .route("/external/rid-ms/spatial", get(rid_ms_spatial))
}
