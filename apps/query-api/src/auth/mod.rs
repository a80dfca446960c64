pub mod api_keys;
pub mod rate_limit;

pub use api_keys::{ApiKeyAuthority, EndpointClass, KeyContext, Tier};
pub use rate_limit::{RateDecision, RateLimiter};

use crate::error::{map_db_error, ApiError};
use crate::state::AppState;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::future::Future;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Handler-side view of the authenticated key, populated by
/// [`require_api_key`].
#[derive(Debug, Clone)]
pub struct ApiKeyAuth(pub KeyContext);

impl<S> FromRequestParts<S> for ApiKeyAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let context = parts.extensions.get::<KeyContext>().cloned();
        async move {
            context
                .map(ApiKeyAuth)
                .ok_or_else(|| ApiError::unauthorized("Missing or invalid API key"))
        }
    }
}

/// Gate in front of every authed route: validates `X-API-Key`, debits the
/// tier bucket, annotates the request, and stamps the `X-RateLimit-*`
/// headers onto whatever the handler returns.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let raw_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let Some(raw_key) = raw_key else {
        return ApiError::unauthorized("Missing or invalid API key").into_response();
    };

    let context = match state.keys.resolve(&raw_key).await {
        Ok(Some(context)) => context,
        Ok(None) => {
            return ApiError::unauthorized("Missing or invalid API key").into_response();
        }
        Err(err) => return map_db_error(err).into_response(),
    };

    let decision = state
        .limiter
        .check(context.id, context.tier.quota_per_window());
    if !decision.allowed {
        let mut response =
            ApiError::rate_limited(decision.reset_after.as_secs()).into_response();
        stamp_rate_headers(&mut response, &decision);
        return response;
    }

    request.extensions_mut().insert(context);
    let mut response = next.run(request).await;
    stamp_rate_headers(&mut response, &decision);
    response
}

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

fn stamp_rate_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    let limit = decision
        .limit
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unlimited".to_string());
    let remaining = decision
        .remaining
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unlimited".to_string());
    if let Ok(value) = HeaderValue::from_str(&limit) {
        headers.insert(RATE_LIMIT_LIMIT, value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining) {
        headers.insert(RATE_LIMIT_REMAINING, value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_after.as_secs().to_string()) {
        headers.insert(RATE_LIMIT_RESET, value);
    }
}
