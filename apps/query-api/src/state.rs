use crate::auth::{ApiKeyAuthority, RateLimiter};
use crate::config::ApiConfig;
use crate::hub::WsHub;
use std::sync::Arc;
use telemetry_core::store::TsStore;

#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: TsStore,
    pub keys: Arc<ApiKeyAuthority>,
    pub limiter: Arc<RateLimiter>,
    pub hub: Arc<WsHub>,
}
