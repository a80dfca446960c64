mod config;
mod publisher;
mod stats;
mod worker;

use crate::config::Config;
use crate::publisher::{location_topic, EventPublisher, MqttPublisher, NullPublisher};
use crate::stats::IngestStats;
use crate::worker::{run_worker, WorkerContext};
use anyhow::{Context, Result};
use futures::future;
use std::sync::Arc;
use telemetry_core::bus::{MemoryBus, MessageBus, SqsBus};
use telemetry_core::registry::{LocationUpdate, SensorRegistry};
use telemetry_core::store::{ensure_schema, TsStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ingest_worker=info".into()),
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
            tracing::warn!("WORKER_QUEUE_URL not set; using in-process bus (local mode)");
            Arc::new(MemoryBus::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    let store = TsStore::connect(&config.database_url, 4, config.write_pool_size())
        .await
        .context("failed to connect to the time-series store")?;
    ensure_schema(&store).await?;
    let store = Arc::new(store);

    let secondary = match &config.secondary_database_url {
        Some(url) => {
            let secondary = TsStore::connect(url, 2, config.write_pool_size())
                .await
                .context("failed to connect to the secondary store")?;
            ensure_schema(&secondary).await?;
            tracing::info!("dual-write to secondary store enabled");
            Some(Arc::new(secondary))
        }
        None => None,
    };

    let bus = build_bus(&config).await;

    let publisher: Arc<dyn EventPublisher> = match &config.mqtt_host {
        Some(host) => {
            let (mqtt, _mqtt_task) = MqttPublisher::new(
                &config.mqtt_client_id,
                host,
                config.mqtt_port,
                config.mqtt_username.as_deref(),
                config.mqtt_password.as_deref(),
            );
            Arc::new(mqtt)
        }
        None => {
            tracing::warn!("WORKER_MQTT_HOST not set; real-time publishing disabled");
            Arc::new(NullPublisher)
        }
    };

    let (location_tx, location_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(SensorRegistry::new(store.clone(), Some(location_tx)));

    let cancel = CancellationToken::new();
    spawn_location_pump(location_rx, publisher.clone(), cancel.clone());

    let stats = Arc::new(IngestStats::new());
    let ctx = Arc::new(WorkerContext {
        bus,
        sink: store,
        secondary,
        registry,
        publisher,
        stats: stats.clone(),
        max_receive_count: config.max_receive_count,
        store_timeout: config.store_timeout(),
        receive_batch: config.receive_batch,
        bus_receive_timeout: config.bus_receive_timeout(),
    });

    let workers: Vec<_> = (0..config.worker_count)
        .map(|worker_id| {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { run_worker(ctx, worker_id, cancel).await })
        })
        .collect();

    let status_cancel = cancel.clone();
    let status_interval = config.status_interval();
    let status_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(status_interval);
        loop {
            tokio::select! {
                _ = status_cancel.cancelled() => break,
                _ = ticker.tick() => stats.log_status(),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received; draining in-flight messages");
    cancel.cancel();

    // Workers finish their current batch; anything not completed inside the
    // grace window stays unacknowledged and reappears after the visibility
    // timeout.
    let drain = future::join_all(workers);
    if tokio::time::timeout(config.shutdown_grace(), drain)
        .await
        .is_err()
    {
        tracing::warn!(
            grace_secs = config.shutdown_grace_secs,
            "grace window elapsed; leaving remaining messages to redelivery"
        );
    }
    status_handle.abort();

    Ok(())
}

fn spawn_location_pump(
    mut location_rx: mpsc::UnboundedReceiver<LocationUpdate>,
    publisher: Arc<dyn EventPublisher>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = location_rx.recv() => {
                    let Some(update) = update else { break };
                    let topic = location_topic(update.family, &update.sensor_id);
                    let payload = serde_json::json!({
                        "sensor_id": update.sensor_id,
                        "lat": update.location.lat,
                        "lng": update.location.lng,
                        "time": update.observed_at.to_rfc3339(),
                    });
                    if let Err(err) = publisher.publish(&topic, &payload).await {
                        tracing::warn!(topic = %topic, error = %err, "location publish failed");
                    }
                }
            }
        }
    });
}
