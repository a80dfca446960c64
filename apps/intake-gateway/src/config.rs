use anyhow::{bail, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Which front door this process is. The edge listener accepts anything a
/// legacy gateway throws at it; the cloud relay additionally routes and
/// shapes traffic by provisioning token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeMode {
    Edge,
    Cloud,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: String,
    pub mode: IntakeMode,
    pub queue_url: Option<String>,
    pub dead_letter_url: Option<String>,
    pub ring_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub token_table_path: Option<PathBuf>,
    pub token_table_ttl_secs: u64,
    pub tenant_rate_per_sec: f64,
    pub tenant_rate_burst: f64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let listen_addr =
            env::var("INTAKE_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let mode = match env::var("INTAKE_MODE")
            .unwrap_or_else(|_| "edge".to_string())
            .to_lowercase()
            .as_str()
        {
            "edge" => IntakeMode::Edge,
            "cloud" => IntakeMode::Cloud,
            other => bail!("INTAKE_MODE must be 'edge' or 'cloud', got '{other}'"),
        };

        let queue_url = env::var("INTAKE_QUEUE_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let dead_letter_url = env::var("INTAKE_DLQ_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let ring_capacity = env::var("INTAKE_RING_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10_000);
        let enqueue_timeout_ms = env::var("INTAKE_ENQUEUE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(2_000);

        let token_table_path = env::var("INTAKE_TOKEN_TABLE_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        if mode == IntakeMode::Cloud && token_table_path.is_none() {
            bail!("INTAKE_TOKEN_TABLE_PATH is required in cloud mode");
        }
        let token_table_ttl_secs = env::var("INTAKE_TOKEN_TABLE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(300);

        let tenant_rate_per_sec = env::var("INTAKE_TENANT_RATE_PER_SEC")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(100.0);
        let tenant_rate_burst = env::var("INTAKE_TENANT_RATE_BURST")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(200.0);

        Ok(Self {
            listen_addr,
            mode,
            queue_url,
            dead_letter_url,
            ring_capacity,
            enqueue_timeout_ms,
            token_table_path,
            token_table_ttl_secs,
            tenant_rate_per_sec,
            tenant_rate_burst,
        })
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn token_table_ttl(&self) -> Duration {
        Duration::from_secs(self.token_table_ttl_secs)
    }
}
