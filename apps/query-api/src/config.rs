use anyhow::{Context, Result};
use std::env;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub database_url: String,
    pub read_pool_size: u32,
    pub write_pool_size: u32,
    pub key_cache_ttl_secs: u64,
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("API_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .context("API_DATABASE_URL or DATABASE_URL is required")?;

        let read_pool_size = env::var("API_READ_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(16);
        let write_pool_size = env::var("API_WRITE_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(4);
        let key_cache_ttl_secs = env::var("API_KEY_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        let mqtt_host = env::var("API_MQTT_HOST")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let mqtt_port = env::var("API_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(1883);
        let mqtt_username = env::var("API_MQTT_USERNAME").ok();
        let mqtt_password = env::var("API_MQTT_PASSWORD").ok();

        Ok(Self {
            database_url,
            read_pool_size,
            write_pool_size,
            key_cache_ttl_secs,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
        })
    }
}
