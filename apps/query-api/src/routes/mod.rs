pub mod dashboard;
pub mod external;
pub mod families;
pub mod health;
pub mod keys_admin;
pub mod public_api;
pub mod sensors;
pub mod ws;

use crate::auth::{require_api_key, KeyContext};
use crate::error::{map_db_error, ApiError};
use crate::state::AppState;
use axum::routing::get;
use axum::{middleware, Router};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value as JsonValue};
use telemetry_core::model::{Reading, Sensor, SensorFamily};
use telemetry_core::store::sensor_active;

pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .merge(sensors::router())
        .merge(families::router())
        .merge(public_api::router())
        .merge(external::router())
        .merge(dashboard::router())
        .merge(keys_admin::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(health::router())
        .route("/", get(ws::ws_handler))
        .nest("/api/v1", authed.merge(crate::openapi::router()))
        .with_state(state)
}

pub(crate) const DEFAULT_PAGE_LIMIT: usize = 20;
pub(crate) const MAX_PAGE_LIMIT: usize = 1_000;

pub(crate) fn pagination(
    page: Option<usize>,
    limit: Option<usize>,
) -> Result<(usize, usize), ApiError> {
    let page = page.unwrap_or(1);
    if page == 0 {
        return Err(ApiError::bad_request("page is 1-based"));
    }
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    Ok((page, limit))
}

pub(crate) fn page_envelope(data: JsonValue, page: usize, limit: usize, total: i64) -> JsonValue {
    let total_pages = if total <= 0 {
        0
    } else {
        (total as u64).div_ceil(limit as u64)
    };
    json!({
        "data": data,
        "pagination": {
            "page": page,
            "limit": limit,
            "total": total,
            "totalPages": total_pages,
        }
    })
}

/// `start`/`end` in RFC 3339; defaults to the trailing 24 hours.
pub(crate) fn parse_time_range(
    start: Option<&str>,
    end: Option<&str>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let end = match end {
        Some(raw) => parse_ts(raw)?,
        None => Utc::now(),
    };
    let start = match start {
        Some(raw) => parse_ts(raw)?,
        None => end - Duration::hours(24),
    };
    if end <= start {
        return Err(ApiError::bad_request("end must be after start"));
    }
    Ok((start, end))
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ApiError::bad_request(format!("invalid timestamp '{raw}'")))
}

pub(crate) fn sensor_json(sensor: &Sensor, now: DateTime<Utc>) -> JsonValue {
    json!({
        "id": sensor.id,
        "family": sensor.family.as_str(),
        "manufacturer": sensor.manufacturer,
        "first_seen": sensor.first_seen.to_rfc3339(),
        "last_seen": sensor.last_seen.to_rfc3339(),
        "active": sensor_active(sensor.last_seen, now),
        "location": sensor.location.map(|l| json!({"lat": l.lat, "lng": l.lng})),
        "metadata": JsonValue::Object(sensor.metadata.clone()),
    })
}

pub(crate) fn reading_json(reading: &Reading) -> JsonValue {
    let mut value = serde_json::to_value(reading).unwrap_or_else(|_| json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "time".to_string(),
            json!(reading
                .time()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
    }
    value
}

/// Zone scoping for reading queries: a key carrying `allowed_zones` only
/// ever sees readings from sensors inside those zones, so the query is
/// narrowed to the zone's sensor ids up front. Unscoped keys pass `None`
/// through and read the whole family.
pub(crate) async fn zone_scoped_ids(
    state: &AppState,
    key: &KeyContext,
    family: SensorFamily,
) -> Result<Option<Vec<String>>, ApiError> {
    let Some(zones) = key.zone_filter() else {
        return Ok(None);
    };
    let page = state
        .store
        .list_sensors(Some(&[family]), Some(zones), 1, MAX_PAGE_LIMIT)
        .await
        .map_err(map_db_error)?;
    Ok(Some(
        page.sensors.into_iter().map(|sensor| sensor.id).collect(),
    ))
}

/// Zone scoping: sensors carry their irrigation zone in metadata.
pub(crate) fn in_zones(sensor: &Sensor, zones: Option<&[String]>) -> bool {
    let Some(zones) = zones else {
        return true;
    };
    sensor
        .metadata
        .get("zone")
        .and_then(|v| v.as_str())
        .map(|zone| zones.iter().any(|allowed| allowed == zone))
        .unwrap_or(false)
}

#[cfg(test)]
mod auth_gap_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        router(crate::test_support::test_state())
    }

    async fn get_status(uri: &str) -> (StatusCode, JsonValue) {
        let response = app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);
        (status, body)
    }

    #[tokio::test]
    async fn health_is_public() {
        let (status, body) = get_status("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn sensors_require_an_api_key() {
        let (status, body) = get_status("/api/v1/sensors").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["statusCode"], 401);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn dashboard_requires_an_api_key() {
        let (status, _) = get_status("/api/v1/dashboard/summary").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn public_endpoints_still_require_a_key() {
        let (status, _) = get_status("/api/v1/public/water-levels/latest").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let (status, body) = get_status("/api/v1/openapi.json").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"].is_object());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_and_caps() {
        assert_eq!(pagination(None, None).unwrap(), (1, 20));
        assert_eq!(pagination(Some(3), Some(100)).unwrap(), (3, 100));
        assert!(pagination(Some(0), None).is_err());
        assert!(pagination(None, Some(1001)).is_err());
    }

    #[test]
    fn page_envelope_computes_total_pages() {
        let envelope = page_envelope(json!([]), 2, 20, 45);
        assert_eq!(envelope["pagination"]["totalPages"], 3);
        assert_eq!(envelope["pagination"]["total"], 45);
    }

    #[test]
    fn time_range_defaults_to_the_last_day() {
        let (start, end) = parse_time_range(None, None).unwrap();
        assert_eq!((end - start).num_hours(), 24);
        assert!(parse_time_range(Some("2025-08-01T00:00:00Z"), Some("2025-07-01T00:00:00Z")).is_err());
        assert!(parse_time_range(Some("yesterday"), None).is_err());
    }
}
