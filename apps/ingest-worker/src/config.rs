use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub secondary_database_url: Option<String>,
    pub queue_url: Option<String>,
    pub dead_letter_url: Option<String>,
    pub worker_count: usize,
    pub receive_batch: usize,
    pub max_receive_count: u32,
    pub store_timeout_ms: u64,
    pub bus_receive_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
    pub status_interval_secs: u64,
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("WORKER_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .context("WORKER_DATABASE_URL or DATABASE_URL is required")?;
        let secondary_database_url = env::var("WORKER_SECONDARY_DATABASE_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let queue_url = env::var("WORKER_QUEUE_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let dead_letter_url = env::var("WORKER_DLQ_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let worker_count = env::var("WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(8);
        let receive_batch = env::var("WORKER_RECEIVE_BATCH")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10)
            .clamp(1, 10);
        let max_receive_count = env::var("WORKER_MAX_RECEIVE_COUNT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(5);
        let store_timeout_ms = env::var("WORKER_STORE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5_000);
        let bus_receive_timeout_ms = env::var("WORKER_BUS_RECEIVE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(20_000);
        let shutdown_grace_secs = env::var("WORKER_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        let status_interval_secs = env::var("WORKER_STATUS_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        let mqtt_host = env::var("WORKER_MQTT_HOST")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let mqtt_port = env::var("WORKER_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(1883);
        let mqtt_username = env::var("WORKER_MQTT_USERNAME").ok();
        let mqtt_password = env::var("WORKER_MQTT_PASSWORD").ok();
        let mqtt_client_id = env::var("WORKER_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("ingest-worker-{}", std::process::id()));

        Ok(Self {
            database_url,
            secondary_database_url,
            queue_url,
            dead_letter_url,
            worker_count,
            receive_batch,
            max_receive_count,
            store_timeout_ms,
            bus_receive_timeout_ms,
            shutdown_grace_secs,
            status_interval_secs,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
        })
    }

    /// Write pool sized at twice the worker pool so workers never queue on
    /// connections; the read pool stays minimal here.
    pub fn write_pool_size(&self) -> u32 {
        (self.worker_count * 2).max(2) as u32
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn bus_receive_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_receive_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(5))
    }
}
