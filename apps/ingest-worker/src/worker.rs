use crate::publisher::{reading_topic, EventPublisher};
use crate::stats::IngestStats;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use telemetry_core::alerts;
use telemetry_core::bus::{BusMessage, MessageBus};
use telemetry_core::decode;
use telemetry_core::error::{DecodeReason, Disposition, IngestError};
use telemetry_core::model::Reading;
use telemetry_core::registry::{RegistryBackend, SensorRegistry};
use telemetry_core::store::{TsStore, WriteOutcome};
use tokio_util::sync::CancellationToken;

/// Storage seam for the worker; production is the time-series store.
#[async_trait]
pub trait ReadingSink: Send + Sync + 'static {
    async fn write_reading(&self, reading: &Reading) -> Result<WriteOutcome, sqlx::Error>;
    async fn write_readings_batch(&self, readings: &[Reading]) -> Result<u64, sqlx::Error>;
}

#[async_trait]
impl ReadingSink for TsStore {
    async fn write_reading(&self, reading: &Reading) -> Result<WriteOutcome, sqlx::Error> {
        TsStore::write_reading(self, reading).await
    }

    async fn write_readings_batch(&self, readings: &[Reading]) -> Result<u64, sqlx::Error> {
        TsStore::write_readings_batch(self, readings).await
    }
}

pub struct WorkerContext<S: ReadingSink, B: RegistryBackend> {
    pub bus: Arc<dyn MessageBus>,
    pub sink: Arc<S>,
    /// Optional dual-write target; failures never fail the message.
    pub secondary: Option<Arc<S>>,
    pub registry: Arc<SensorRegistry<B>>,
    pub publisher: Arc<dyn EventPublisher>,
    pub stats: Arc<IngestStats>,
    pub max_receive_count: u32,
    pub store_timeout: Duration,
    pub receive_batch: usize,
    pub bus_receive_timeout: Duration,
}

/// One worker: long-poll, then run each message through
/// `received -> decoded -> registered -> stored -> published -> acked`.
/// On shutdown the current batch is finished; nothing new is accepted.
pub async fn run_worker<S: ReadingSink, B: RegistryBackend>(
    ctx: Arc<WorkerContext<S, B>>,
    worker_id: usize,
    cancel: CancellationToken,
) {
    tracing::info!(worker_id, "ingest worker started");
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(ctx.bus_receive_timeout, ctx.bus.receive(ctx.receive_batch)) => {
                match result {
                    Ok(Ok(batch)) => batch,
                    Ok(Err(err)) => {
                        tracing::warn!(worker_id, error = %err, "bus receive failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        }
                    }
                    Err(_) => continue,
                }
            }
        };

        for message in &batch {
            process_message(&ctx, message).await;
        }
    }
    tracing::info!(worker_id, "ingest worker stopped");
}

pub async fn process_message<S: ReadingSink, B: RegistryBackend>(
    ctx: &WorkerContext<S, B>,
    message: &BusMessage,
) {
    ctx.stats.messages_total.fetch_add(1, Ordering::Relaxed);

    if message.receive_count > ctx.max_receive_count {
        dead_letter(ctx, message, "max_receives").await;
        return;
    }

    let envelope = match message.envelope() {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, "bus body is not an envelope");
            dead_letter(ctx, message, DecodeReason::ShapeMismatch.as_str()).await;
            return;
        }
    };

    let decoded = match decode::decode(&envelope) {
        Ok(decoded) => decoded,
        Err(err) => {
            let reason = err.reason;
            tracing::debug!(reason = reason.as_str(), detail = %err.detail, token = %envelope.token, "decode failed");
            match IngestError::from(err).disposition() {
                Disposition::Ack => {
                    ctx.stats.empty_payload_total.fetch_add(1, Ordering::Relaxed);
                    ack(ctx, message).await;
                }
                Disposition::DeadLetter(reason) => {
                    dead_letter(ctx, message, reason.as_str()).await;
                }
                Disposition::Nack => nack(ctx),
            }
            return;
        }
    };

    // Registration must land before readings become visible.
    for facts in &decoded.sensor_facts {
        if let Err(err) = ctx.registry.observe(facts).await {
            tracing::warn!(sensor_id = %facts.id, error = %err, "registry upsert failed");
            nack(ctx);
            return;
        }
    }

    let mut written: Vec<Reading> = Vec::with_capacity(decoded.readings.len());
    for reading in &decoded.readings {
        match tokio::time::timeout(ctx.store_timeout, ctx.sink.write_reading(reading)).await {
            Ok(Ok(WriteOutcome::Written)) => written.push(reading.clone()),
            Ok(Ok(WriteOutcome::Duplicate)) => {
                ctx.stats
                    .ingest_duplicates_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    sensor_id = reading.sensor_id(),
                    time = %reading.time(),
                    "duplicate reading skipped"
                );
            }
            Ok(Err(err)) => match IngestError::from(err) {
                IngestError::Duplicate { .. } => {
                    ctx.stats
                        .ingest_duplicates_total
                        .fetch_add(1, Ordering::Relaxed);
                }
                other => {
                    tracing::warn!(sensor_id = reading.sensor_id(), error = %other, "store write failed");
                    nack(ctx);
                    return;
                }
            },
            Err(_) => {
                tracing::warn!(
                    sensor_id = reading.sensor_id(),
                    timeout_ms = ctx.store_timeout.as_millis() as u64,
                    "store write timed out"
                );
                nack(ctx);
                return;
            }
        }
    }
    ctx.stats
        .written_total
        .fetch_add(written.len() as u64, Ordering::Relaxed);

    if let Some(secondary) = &ctx.secondary {
        if !written.is_empty() {
            if let Err(err) = secondary.write_readings_batch(&written).await {
                ctx.stats
                    .replication_lag
                    .fetch_add(written.len() as u64, Ordering::Relaxed);
                tracing::warn!(error = %err, lagging = written.len(), "secondary store write failed");
            }
        }
    }

    for reading in &written {
        publish_reading(ctx, reading).await;
    }

    ack(ctx, message).await;
}

async fn publish_reading<S: ReadingSink, B: RegistryBackend>(
    ctx: &WorkerContext<S, B>,
    reading: &Reading,
) {
    let topic = reading_topic(reading.family(), reading.sensor_id());
    match serde_json::to_value(reading) {
        Ok(payload) => {
            if let Err(err) = ctx.publisher.publish(&topic, &payload).await {
                ctx.stats
                    .publish_errors_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic = %topic, error = %err, "reading publish failed");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "reading serialization failed");
        }
    }

    for alert in alerts::derive(reading) {
        let topic = alert.topic();
        if let Err(err) = ctx.publisher.publish(&topic, &alert.payload).await {
            ctx.stats
                .publish_errors_total
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(topic = %topic, error = %err, "alert publish failed");
        }
    }
}

async fn ack<S: ReadingSink, B: RegistryBackend>(ctx: &WorkerContext<S, B>, message: &BusMessage) {
    if let Err(err) = ctx.bus.ack(&message.receipt).await {
        // Redelivery is safe: the unique key makes the replay a no-op.
        tracing::warn!(error = %err, "ack failed; message will be redelivered");
    }
}

async fn dead_letter<S: ReadingSink, B: RegistryBackend>(
    ctx: &WorkerContext<S, B>,
    message: &BusMessage,
    reason: &str,
) {
    match ctx.bus.dead_letter(message, reason).await {
        Ok(()) => {
            ctx.stats
                .dead_lettered_total
                .fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            tracing::warn!(error = %err, reason, "dead-letter failed; message will be redelivered");
        }
    }
}

fn nack(ctx: &WorkerContext<impl ReadingSink, impl RegistryBackend>) {
    // No ack: the visibility timeout hands the message back to the bus.
    ctx.stats.nacked_total.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::Value as JsonValue;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use telemetry_core::bus::MemoryBus;
    use telemetry_core::model::{LatLng, RawEnvelope, SensorFacts, Transport};

    #[derive(Default)]
    struct FakeSink {
        outcomes: Mutex<VecDeque<Result<WriteOutcome, sqlx::Error>>>,
        writes: Mutex<Vec<Reading>>,
    }

    impl FakeSink {
        fn queue(&self, outcome: Result<WriteOutcome, sqlx::Error>) {
            self.outcomes.lock().expect("lock").push_back(outcome);
        }

        fn written(&self) -> Vec<Reading> {
            self.writes.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl ReadingSink for FakeSink {
        async fn write_reading(&self, reading: &Reading) -> Result<WriteOutcome, sqlx::Error> {
            let outcome = self
                .outcomes
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(Ok(WriteOutcome::Written));
            if matches!(outcome, Ok(WriteOutcome::Written)) {
                self.writes.lock().expect("lock").push(reading.clone());
            }
            outcome
        }

        async fn write_readings_batch(&self, readings: &[Reading]) -> Result<u64, sqlx::Error> {
            self.writes
                .lock()
                .expect("lock")
                .extend(readings.iter().cloned());
            Ok(readings.len() as u64)
        }
    }

    #[derive(Default)]
    struct FakeRegistry;

    #[async_trait]
    impl RegistryBackend for FakeRegistry {
        async fn upsert_sensor(&self, _facts: &SensorFacts) -> Result<(), sqlx::Error> {
            Ok(())
        }

        async fn record_location(
            &self,
            _id: &str,
            _location: LatLng,
            _observed_at: DateTime<Utc>,
        ) -> Result<(), sqlx::Error> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        topics: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, _payload: &JsonValue) -> Result<(), anyhow::Error> {
            self.topics.lock().expect("lock").push(topic.to_string());
            Ok(())
        }
    }

    struct Harness {
        bus: Arc<MemoryBus>,
        sink: Arc<FakeSink>,
        publisher: Arc<RecordingPublisher>,
        ctx: WorkerContext<FakeSink, FakeRegistry>,
    }

    fn harness() -> Harness {
        let bus = Arc::new(MemoryBus::default());
        let sink = Arc::new(FakeSink::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let ctx = WorkerContext {
            bus: bus.clone(),
            sink: sink.clone(),
            secondary: None,
            registry: Arc::new(SensorRegistry::new(Arc::new(FakeRegistry), None)),
            publisher: publisher.clone(),
            stats: Arc::new(IngestStats::new()),
            max_receive_count: 5,
            store_timeout: Duration::from_secs(5),
            receive_batch: 10,
            bus_receive_timeout: Duration::from_secs(1),
        };
        Harness {
            bus,
            sink,
            publisher,
            ctx,
        }
    }

    fn water_level_envelope(level: f64) -> RawEnvelope {
        let body = format!(
            r#"{{"deviceID":"abc","macAddress":"1A2B3C4D5E6F","latitude":13.75,"longitude":100.50,"RSSI":-65,"voltage":420,"level":{level},"timestamp":1748841346551}}"#
        );
        RawEnvelope {
            received_at: Utc::now(),
            transport: Transport::EdgeHttp,
            token: "munbon-ridr-water-level".to_string(),
            source_ip: Some("203.0.113.9".to_string()),
            content_type: "application/json".to_string(),
            vendor_payload: body.into_bytes(),
        }
    }

    async fn pump(harness: &Harness) {
        let batch = harness.bus.receive(10).await.unwrap();
        for message in &batch {
            process_message(&harness.ctx, message).await;
        }
    }

    #[tokio::test]
    async fn happy_path_stores_publishes_and_acks() {
        let h = harness();
        h.bus.send(&water_level_envelope(15.0)).await.unwrap();
        pump(&h).await;

        assert_eq!(h.sink.written().len(), 1);
        assert_eq!(h.bus.depth(), 0, "message acked");
        let topics = h.publisher.topics.lock().expect("lock").clone();
        assert_eq!(topics, vec!["sensors/water_level/WL-1A2B3C4D5E6F/data"]);
        assert_eq!(
            h.ctx.stats.written_total.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn duplicates_count_and_ack_without_publish() {
        let h = harness();
        h.sink.queue(Ok(WriteOutcome::Duplicate));
        h.bus.send(&water_level_envelope(15.0)).await.unwrap();
        pump(&h).await;

        assert_eq!(h.bus.depth(), 0, "duplicate still acked");
        assert_eq!(
            h.ctx.stats.ingest_duplicates_total.load(Ordering::Relaxed),
            1
        );
        assert!(h.publisher.topics.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn transient_store_failure_nacks_for_redelivery() {
        let h = harness();
        h.sink.queue(Err(sqlx::Error::PoolTimedOut));
        h.bus.send(&water_level_envelope(15.0)).await.unwrap();
        pump(&h).await;

        assert_eq!(h.ctx.stats.nacked_total.load(Ordering::Relaxed), 1);
        assert_eq!(h.bus.depth(), 1, "message stays on the bus");

        h.bus.expire_visibility();
        let redelivered = h.bus.receive(10).await.unwrap();
        assert_eq!(redelivered[0].receive_count, 2);
    }

    #[tokio::test]
    async fn redelivered_duplicate_leaves_exactly_one_reading() {
        let h = harness();
        let envelope = water_level_envelope(15.0);
        h.bus.send(&envelope).await.unwrap();
        h.bus.send(&envelope).await.unwrap();
        // The second write hits the unique key.
        h.sink.queue(Ok(WriteOutcome::Written));
        h.sink.queue(Ok(WriteOutcome::Duplicate));
        pump(&h).await;

        assert_eq!(h.sink.written().len(), 1);
        assert_eq!(h.bus.depth(), 0);
        assert_eq!(
            h.ctx.stats.ingest_duplicates_total.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn garbage_payloads_are_dead_lettered_with_a_reason() {
        let h = harness();
        let mut envelope = water_level_envelope(15.0);
        envelope.vendor_payload = br#"{"level": "not a water level payload"}"#.to_vec();
        envelope.token = "munbon-mystery".to_string();
        h.bus.send(&envelope).await.unwrap();
        pump(&h).await;

        let dead = h.bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "unknown_token");
        assert_eq!(h.bus.depth(), 0);
        assert_eq!(h.ctx.stats.dead_lettered_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn empty_payloads_are_acked_and_counted() {
        let h = harness();
        let mut envelope = water_level_envelope(15.0);
        envelope.vendor_payload = b"  ".to_vec();
        h.bus.send(&envelope).await.unwrap();
        pump(&h).await;

        assert_eq!(h.bus.depth(), 0);
        assert_eq!(h.ctx.stats.empty_payload_total.load(Ordering::Relaxed), 1);
        assert!(h.bus.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn messages_over_the_receive_cap_go_to_the_dead_letter_stream() {
        let h = harness();
        h.bus.send(&water_level_envelope(15.0)).await.unwrap();
        let mut message = h.bus.receive(1).await.unwrap().remove(0);
        message.receive_count = 6;
        process_message(&h.ctx, &message).await;

        let dead = h.bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "max_receives");
        assert!(h.sink.written().is_empty());
    }

    #[tokio::test]
    async fn high_water_publishes_an_alert_after_the_reading() {
        let h = harness();
        h.bus.send(&water_level_envelope(31.0)).await.unwrap();
        pump(&h).await;

        let topics = h.publisher.topics.lock().expect("lock").clone();
        assert_eq!(
            topics,
            vec![
                "sensors/water_level/WL-1A2B3C4D5E6F/data",
                "alerts/critical/water_high"
            ]
        );
    }
}
