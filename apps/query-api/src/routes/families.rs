use super::{page_envelope, pagination, parse_time_range, reading_json, zone_scoped_ids};
use crate::auth::{ApiKeyAuth, EndpointClass, KeyContext};
use crate::error::{map_db_error, ApiError};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};
use telemetry_core::alerts;
use telemetry_core::model::SensorFamily;
use telemetry_core::store::{Agg, Bucket};

#[derive(Debug, serde::Deserialize)]
pub(crate) struct FamilyQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

/// Latest reading per sensor of the family, paginated.
async fn family_overview(
    state: &AppState,
    key: &KeyContext,
    family: SensorFamily,
    query: FamilyQuery,
) -> Result<Json<JsonValue>, ApiError> {
    key.require_family(family)?;
    let (page, limit) = pagination(query.page, query.limit)?;

    let scoped = zone_scoped_ids(state, key, family).await?;
    let latest = state
        .store
        .latest(family, scoped.as_deref(), super::MAX_PAGE_LIMIT)
        .await
        .map_err(map_db_error)?;
    let total = latest.len() as i64;
    let data: Vec<JsonValue> = latest
        .iter()
        .skip(page.saturating_sub(1) * limit)
        .take(limit)
        .map(reading_json)
        .collect();
    Ok(Json(page_envelope(json!(data), page, limit, total)))
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct AggregateQuery {
    start: Option<String>,
    end: Option<String>,
    interval: Option<String>,
    aggregation: Option<String>,
}

/// Bucketed aggregates over the family's primary measure. Multi-agg is a
/// comma-separated list (`avg,max`).
async fn family_aggregated(
    state: &AppState,
    key: &KeyContext,
    family: SensorFamily,
    query: AggregateQuery,
) -> Result<Json<JsonValue>, ApiError> {
    key.require_class(EndpointClass::Advanced)?;
    key.require_family(family)?;

    let (start, end) = parse_time_range(query.start.as_deref(), query.end.as_deref())?;
    let bucket = match query.interval.as_deref() {
        Some(raw) => Bucket::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown interval '{raw}'")))?,
        None => Bucket::Hour,
    };
    let aggs = match query.aggregation.as_deref() {
        Some(raw) => Agg::parse_set(raw).map_err(ApiError::bad_request)?,
        None => vec![Agg::Avg],
    };

    let scoped = zone_scoped_ids(state, key, family).await?;
    let buckets = state
        .store
        .aggregate(family, scoped.as_deref(), start, end, bucket)
        .await
        .map_err(map_db_error)?;

    let data: Vec<JsonValue> = buckets
        .iter()
        .map(|row| {
            let mut out = serde_json::Map::new();
            out.insert(
                "bucket_start".to_string(),
                json!(row.bucket_start.to_rfc3339()),
            );
            for agg in &aggs {
                out.insert(agg.as_str().to_string(), json!(row.value_of(*agg)));
            }
            JsonValue::Object(out)
        })
        .collect();

    Ok(Json(json!({
        "family": family.as_str(),
        "interval": bucket.as_str(),
        "start": start.to_rfc3339(),
        "end": end.to_rfc3339(),
        "data": data,
    })))
}

/// Currently-active threshold alerts, derived from each sensor's newest
/// reading with the same rules the ingest path publishes.
async fn family_alerts(
    state: &AppState,
    key: &KeyContext,
    family: SensorFamily,
) -> Result<Json<JsonValue>, ApiError> {
    key.require_family(family)?;
    let scoped = zone_scoped_ids(state, key, family).await?;
    let latest = state
        .store
        .latest(family, scoped.as_deref(), super::MAX_PAGE_LIMIT)
        .await
        .map_err(map_db_error)?;

    let data: Vec<JsonValue> = latest
        .iter()
        .flat_map(|reading| {
            alerts::derive(reading).into_iter().map(|alert| {
                json!({
                    "severity": alert.severity,
                    "kind": alert.kind,
                    "topic": alert.topic(),
                    "details": alert.payload,
                })
            })
        })
        .collect();
    Ok(Json(json!({ "data": data })))
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ComparisonQuery {
    sensor_ids: String,
    start: Option<String>,
    end: Option<String>,
}

/// Side-by-side window statistics for a set of sensors.
async fn family_comparison(
    state: &AppState,
    key: &KeyContext,
    family: SensorFamily,
    query: ComparisonQuery,
) -> Result<Json<JsonValue>, ApiError> {
    key.require_class(EndpointClass::Advanced)?;
    key.require_family(family)?;

    let sensor_ids: Vec<String> = query
        .sensor_ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if sensor_ids.is_empty() || sensor_ids.len() > 20 {
        return Err(ApiError::bad_request("sensor_ids must name 1 to 20 sensors"));
    }
    let (start, end) = parse_time_range(query.start.as_deref(), query.end.as_deref())?;

    // Requested ids outside the key's zones simply drop out of the result.
    let sensor_ids: Vec<String> = match zone_scoped_ids(state, key, family).await? {
        Some(allowed) => sensor_ids
            .into_iter()
            .filter(|id| allowed.contains(id))
            .collect(),
        None => sensor_ids,
    };

    let stats = state
        .store
        .statistics_per_sensor(family, &sensor_ids, start, end)
        .await
        .map_err(map_db_error)?;

    let data: Vec<JsonValue> = stats
        .iter()
        .map(|(sensor_id, row)| {
            json!({
                "sensor_id": sensor_id,
                "min": row.min,
                "max": row.max,
                "avg": row.avg,
                "count": row.count,
            })
        })
        .collect();
    Ok(Json(json!({
        "start": start.to_rfc3339(),
        "end": end.to_rfc3339(),
        "data": data,
    })))
}

macro_rules! family_routes {
    ($family:expr, $overview:ident, $aggregated:ident, $alerts:ident, $comparison:ident) => {
        pub(crate) async fn $overview(
            State(state): State<AppState>,
            ApiKeyAuth(key): ApiKeyAuth,
            Query(query): Query<FamilyQuery>,
        ) -> Result<Json<JsonValue>, ApiError> {
            family_overview(&state, &key, $family, query).await
        }

        pub(crate) async fn $aggregated(
            State(state): State<AppState>,
            ApiKeyAuth(key): ApiKeyAuth,
            Query(query): Query<AggregateQuery>,
        ) -> Result<Json<JsonValue>, ApiError> {
            family_aggregated(&state, &key, $family, query).await
        }

        pub(crate) async fn $alerts(
            State(state): State<AppState>,
            ApiKeyAuth(key): ApiKeyAuth,
        ) -> Result<Json<JsonValue>, ApiError> {
            family_alerts(&state, &key, $family).await
        }

        pub(crate) async fn $comparison(
            State(state): State<AppState>,
            ApiKeyAuth(key): ApiKeyAuth,
            Query(query): Query<ComparisonQuery>,
        ) -> Result<Json<JsonValue>, ApiError> {
            family_comparison(&state, &key, $family, query).await
        }
    };
}

family_routes!(
    SensorFamily::WaterLevel,
    water_levels,
    water_levels_aggregated,
    water_levels_alerts,
    water_levels_comparison
);
family_routes!(
    SensorFamily::Moisture,
    moisture,
    moisture_aggregated,
    moisture_alerts,
    moisture_comparison
);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/water-levels", get(water_levels))
        .route("/water-levels/aggregated", get(water_levels_aggregated))
        .route("/water-levels/alerts", get(water_levels_alerts))
        .route("/water-levels/comparison", get(water_levels_comparison))
        .route("/moisture", get(moisture))
        .route("/moisture/aggregated", get(moisture_aggregated))
        .route("/moisture/alerts", get(moisture_alerts))
        .route("/moisture/comparison", get(moisture_comparison))
}
