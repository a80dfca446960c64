use crate::auth::{ApiKeyAuth, EndpointClass, Tier};
use crate::error::{map_db_error, ApiError};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};
use telemetry_core::model::SensorFamily;
use uuid::Uuid;

#[derive(Debug, serde::Deserialize)]
pub(crate) struct CreateKeyRequest {
    tenant: String,
    tier: String,
    allowed_families: Vec<String>,
    #[serde(default)]
    allowed_zones: Option<Vec<String>>,
    #[serde(default)]
    expires_at: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/api-keys",
    tag = "admin",
    responses(
        (status = 201, description = "Key created; plaintext returned once"),
        (status = 403, description = "Internal tier required")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn create_api_key(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    key.require_class(EndpointClass::Admin)?;

    let tenant = payload.tenant.trim();
    if tenant.is_empty() {
        return Err(ApiError::bad_request("tenant is required"));
    }
    let tier = Tier::parse(&payload.tier)
        .ok_or_else(|| ApiError::bad_request(format!("unknown tier '{}'", payload.tier)))?;
    let families: Vec<SensorFamily> = payload
        .allowed_families
        .iter()
        .map(|raw| {
            SensorFamily::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown family '{raw}'")))
        })
        .collect::<Result<_, _>>()?;
    if families.is_empty() {
        return Err(ApiError::bad_request("allowed_families must not be empty"));
    }
    let expires_at = payload
        .expires_at
        .as_deref()
        .map(super::parse_ts)
        .transpose()?;

    let (id, plaintext) = state
        .keys
        .create_key(
            tenant,
            tier,
            &families,
            payload.allowed_zones.as_deref(),
            expires_at,
        )
        .await
        .map_err(map_db_error)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": id,
            "key": plaintext,
            "tenant": tenant,
            "tier": tier.as_str(),
        })),
    ))
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/api-keys/{id}",
    tag = "admin",
    responses(
        (status = 204, description = "Key revoked"),
        (status = 404, description = "Unknown key id")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn revoke_api_key(
    State(state): State<AppState>,
    ApiKeyAuth(key): ApiKeyAuth,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    key.require_class(EndpointClass::Admin)?;
    let revoked = state.keys.revoke_key(id).await.map_err(map_db_error)?;
    if revoked {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("API key not found"))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/api-keys", post(create_api_key))
        .route("/admin/api-keys/{id}", delete(revoke_api_key))
}
