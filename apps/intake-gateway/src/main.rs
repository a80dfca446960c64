mod config;
mod relay;
mod ring;
mod routes;
mod shed;

use crate::config::{Config, IntakeMode};
use crate::relay::CloudRelay;
use crate::ring::RingForwarder;
use crate::shed::EmptyPayloadTracker;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry_core::bus::{MemoryBus, MessageBus, SqsBus};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn build_bus(config: &Config) -> Arc<dyn MessageBus> {
    match (&config.queue_url, &config.dead_letter_url) {
        (Some(queue), Some(dlq)) => {
            tracing::info!(queue = %queue, "using SQS bus");
            Arc::new(SqsBus::from_env(queue.clone(), dlq.clone()).await)
        }
        _ => {
            tracing::warn!("INTAKE_QUEUE_URL not set; using in-process bus (local mode)");
            Arc::new(MemoryBus::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    let cancel = CancellationToken::new();
    let bus = build_bus(&config).await;
    let forwarder = RingForwarder::start(
        bus,
        config.ring_capacity,
        config.enqueue_timeout(),
        cancel.clone(),
    );

    let relay = match (config.mode, &config.token_table_path) {
        (IntakeMode::Cloud, Some(path)) => {
            let relay = Arc::new(CloudRelay::load(
                path.clone(),
                config.tenant_rate_per_sec,
                config.tenant_rate_burst,
            )?);
            relay
                .clone()
                .start_refresh(config.token_table_ttl(), cancel.clone());
            Some(relay)
        }
        _ => None,
    };

    let state = routes::AppState {
        mode: config.mode,
        forwarder,
        shed: Arc::new(EmptyPayloadTracker::default()),
        relay,
    };

    let app = routes::router(state);
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind intake listener on {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, mode = ?config.mode, "intake gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    cancel.cancel();
    Ok(())
}
