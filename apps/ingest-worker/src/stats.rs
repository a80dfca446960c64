use std::sync::atomic::{AtomicU64, Ordering};

/// Shared ingest counters, surfaced on a periodic status line.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub messages_total: AtomicU64,
    pub written_total: AtomicU64,
    pub ingest_duplicates_total: AtomicU64,
    pub dead_lettered_total: AtomicU64,
    pub nacked_total: AtomicU64,
    pub empty_payload_total: AtomicU64,
    pub publish_errors_total: AtomicU64,
    pub replication_lag: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_status(&self) {
        tracing::info!(
            messages = self.messages_total.load(Ordering::Relaxed),
            written = self.written_total.load(Ordering::Relaxed),
            duplicates = self.ingest_duplicates_total.load(Ordering::Relaxed),
            dead_lettered = self.dead_lettered_total.load(Ordering::Relaxed),
            nacked = self.nacked_total.load(Ordering::Relaxed),
            empty_payloads = self.empty_payload_total.load(Ordering::Relaxed),
            publish_errors = self.publish_errors_total.load(Ordering::Relaxed),
            replication_lag = self.replication_lag.load(Ordering::Relaxed),
            "ingest status"
        );
    }
}
