use super::{
    in_zones, page_envelope, pagination, parse_time_range, reading_json, sensor_json,
};
use crate::auth::{ApiKeyAuth, EndpointClass};
use crate::error::{map_db_error, ApiError};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use telemetry_core::model::{family_of_sensor_id, LatLng, SensorFamily};

#[derive(Debug, serde::Deserialize)]
pub(crate) struct SensorsListQuery {
    #[serde(rename = "type")]
    sensor_type: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/api/v1/sensors",
    tag = "sensors",
    responses(
        (status = 200, description = "Paginated sensors"),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Family out of scope")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn list_sensors(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Query(query): Query<SensorsListQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let (page, limit) = pagination(query.page, query.limit)?;

    let families: Vec<SensorFamily> = match query.sensor_type.as_deref() {
        Some(raw) => {
            let family = SensorFamily::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown sensor type '{raw}'")))?;
            key.require_family(family)?;
            vec![family]
        }
        None => {
            let mut families = key.allowed_families.clone();
            if families.contains(&SensorFamily::Moisture)
                && !families.contains(&SensorFamily::Gateway)
            {
                families.push(SensorFamily::Gateway);
            }
            families
        }
    };

    let result = state
        .store
        .list_sensors(Some(&families), key.zone_filter(), page, limit)
        .await
        .map_err(map_db_error)?;

    let now = Utc::now();
    let data: Vec<JsonValue> = result
        .sensors
        .iter()
        .map(|sensor| sensor_json(sensor, now))
        .collect();
    Ok(Json(page_envelope(json!(data), page, limit, result.total)))
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct NearbyQuery {
    lat: f64,
    lng: f64,
    /// Kilometers.
    radius: Option<f64>,
    limit: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/api/v1/sensors/nearby",
    tag = "sensors",
    responses((status = 200, description = "Sensors within the radius")),
    security(("ApiKey" = []))
)]
pub(crate) async fn nearby_sensors(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    if !(-90.0..=90.0).contains(&query.lat) || !(-180.0..=180.0).contains(&query.lng) {
        return Err(ApiError::bad_request("invalid coordinates"));
    }
    let radius_km = query.radius.unwrap_or(5.0);
    if !(radius_km > 0.0 && radius_km <= 500.0) {
        return Err(ApiError::bad_request("radius must be in (0, 500] km"));
    }

    let center = LatLng {
        lat: query.lat,
        lng: query.lng,
    };
    let nearby = state
        .store
        .nearby_sensors(center, radius_km, query.limit.unwrap_or(100).min(1_000))
        .await
        .map_err(map_db_error)?;

    let now = Utc::now();
    let data: Vec<JsonValue> = nearby
        .iter()
        .filter(|entry| key.require_family(entry.sensor.family).is_ok())
        .filter(|entry| in_zones(&entry.sensor, key.zone_filter()))
        .map(|entry| {
            let mut value = sensor_json(&entry.sensor, now);
            if let Some(obj) = value.as_object_mut() {
                obj.insert("distance_km".to_string(), json!(entry.distance_km));
            }
            value
        })
        .collect();
    Ok(Json(json!({ "data": data })))
}

#[utoipa::path(
    get,
    path = "/api/v1/sensors/{id}",
    tag = "sensors",
    responses(
        (status = 200, description = "Sensor detail"),
        (status = 404, description = "Unknown sensor")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn get_sensor(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let sensor = fetch_scoped_sensor(&state, &key, &id).await?;
    Ok(Json(sensor_json(&sensor, Utc::now())))
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ReadingsQuery {
    start: Option<String>,
    end: Option<String>,
    limit: Option<usize>,
    #[serde(rename = "sortOrder")]
    sort_order: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/sensors/{id}/readings",
    tag = "sensors",
    responses(
        (status = 200, description = "Readings in the window"),
        (status = 404, description = "Unknown sensor")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn sensor_readings(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Path(id): Path<String>,
    Query(query): Query<ReadingsQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let sensor = fetch_scoped_sensor(&state, &key, &id).await?;
    let (start, end) = parse_time_range(query.start.as_deref(), query.end.as_deref())?;

    let page = state
        .store
        .series(
            sensor.family,
            &[sensor.id.clone()],
            start,
            end,
            query.limit.unwrap_or(1_000),
        )
        .await
        .map_err(map_db_error)?;

    let descending = query
        .sort_order
        .as_deref()
        .map(|order| order.eq_ignore_ascii_case("desc"))
        .unwrap_or(false);
    let mut data: Vec<JsonValue> = page.readings.iter().map(reading_json).collect();
    if descending {
        data.reverse();
    }

    Ok(Json(json!({
        "data": data,
        "truncated": page.truncated,
        "next_cursor": page.next_cursor,
    })))
}

#[utoipa::path(
    get,
    path = "/api/v1/sensors/{id}/latest",
    tag = "sensors",
    responses(
        (status = 200, description = "Newest reading"),
        (status = 404, description = "Unknown sensor or no readings")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn sensor_latest(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let sensor = fetch_scoped_sensor(&state, &key, &id).await?;
    let readings = state
        .store
        .latest(sensor.family, Some(&[sensor.id.clone()]), 1)
        .await
        .map_err(map_db_error)?;
    let reading = readings
        .first()
        .ok_or_else(|| ApiError::not_found("No readings for this sensor"))?;
    Ok(Json(reading_json(reading)))
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct StatisticsQuery {
    start: Option<String>,
    end: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/sensors/{id}/statistics",
    tag = "sensors",
    responses(
        (status = 200, description = "Window statistics"),
        (status = 404, description = "Unknown sensor")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn sensor_statistics(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Path(id): Path<String>,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let sensor = fetch_scoped_sensor(&state, &key, &id).await?;
    let (start, end) = parse_time_range(query.start.as_deref(), query.end.as_deref())?;
    let stats = state
        .store
        .statistics(sensor.family, Some(&[sensor.id.clone()]), start, end)
        .await
        .map_err(map_db_error)?;
    Ok(Json(json!({
        "sensor_id": sensor.id,
        "start": start.to_rfc3339(),
        "end": end.to_rfc3339(),
        "min": stats.min,
        "max": stats.max,
        "avg": stats.avg,
        "count": stats.count,
    })))
}

#[utoipa::path(
    patch,
    path = "/api/v1/sensors/{id}",
    tag = "sensors",
    responses(
        (status = 200, description = "Updated sensor"),
        (status = 403, description = "Admin tier required"),
        (status = 404, description = "Unknown sensor")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn patch_sensor(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Path(id): Path<String>,
    Json(delta): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    key.require_class(EndpointClass::Admin)?;
    let Some(delta) = delta.as_object() else {
        return Err(ApiError::bad_request("metadata delta must be an object"));
    };

    let sensor = state
        .store
        .patch_sensor_metadata(&id, delta)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| ApiError::not_found("Sensor not found"))?;
    Ok(Json(sensor_json(&sensor, Utc::now())))
}

/// Sensor lookup that enforces the key's family and zone scopes. A
/// scoped-out sensor reads as absent, not as forbidden.
async fn fetch_scoped_sensor(
    state: &AppState,
    key: &crate::auth::KeyContext,
    id: &str,
) -> Result<telemetry_core::model::Sensor, ApiError> {
    if family_of_sensor_id(id).is_none() {
        return Err(ApiError::not_found("Sensor not found"));
    }
    let sensor = state
        .store
        .get_sensor(id)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| ApiError::not_found("Sensor not found"))?;
    key.require_family(sensor.family)?;
    if !in_zones(&sensor, key.zone_filter()) {
        return Err(ApiError::not_found("Sensor not found"));
    }
    Ok(sensor)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sensors", get(list_sensors))
        .route("/sensors/nearby", get(nearby_sensors))
        .route("/sensors/{id}", get(get_sensor).patch(patch_sensor))
        .route("/sensors/{id}/readings", get(sensor_readings))
        .route("/sensors/{id}/latest", get(sensor_latest))
        .route("/sensors/{id}/statistics", get(sensor_statistics))
}
