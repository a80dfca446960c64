use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Irrigation Telemetry Read API",
        description = "Sensor registry, time-series and aggregate reads, public Buddhist-calendar endpoints"
    ),
    paths(
        crate::routes::health::health,
        crate::routes::sensors::list_sensors,
        crate::routes::sensors::nearby_sensors,
        crate::routes::sensors::get_sensor,
        crate::routes::sensors::sensor_readings,
        crate::routes::sensors::sensor_latest,
        crate::routes::sensors::sensor_statistics,
        crate::routes::sensors::patch_sensor,
        crate::routes::public_api::public_latest,
        crate::routes::public_api::public_timeseries,
        crate::routes::public_api::public_statistics,
        crate::routes::dashboard::dashboard_summary,
        crate::routes::keys_admin::create_api_key,
        crate::routes::keys_admin::revoke_api_key,
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(serve_openapi))
}
