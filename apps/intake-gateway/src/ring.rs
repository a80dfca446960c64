use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_core::bus::MessageBus;
use telemetry_core::model::RawEnvelope;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Bounded in-memory ring between the HTTP handlers and the bus. Exists
/// only to bridge transient bus hiccups; when it overflows the oldest
/// envelope is dropped and counted.
#[derive(Clone)]
pub struct RingForwarder {
    inner: Arc<RingInner>,
}

struct RingInner {
    queue: Mutex<VecDeque<RawEnvelope>>,
    notify: Notify,
    capacity: usize,
    dropped_total: AtomicU64,
    forwarded_total: AtomicU64,
    closed: CancellationToken,
}

impl RingForwarder {
    pub fn start(
        bus: Arc<dyn MessageBus>,
        capacity: usize,
        send_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let inner = Arc::new(RingInner {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped_total: AtomicU64::new(0),
            forwarded_total: AtomicU64::new(0),
            closed: cancel.clone(),
        });

        let drain = inner.clone();
        tokio::spawn(async move {
            run_drain(drain, bus, send_timeout, cancel).await;
        });

        Self { inner }
    }

    /// Accepts an envelope for forwarding. Fails only when the process is
    /// shutting down; overflow sheds the oldest buffered envelope instead
    /// of the new one.
    pub fn enqueue(&self, envelope: RawEnvelope) -> Result<(), anyhow::Error> {
        if self.inner.closed.is_cancelled() {
            anyhow::bail!("intake forwarder is shut down");
        }
        {
            let mut queue = self.inner.queue.lock().expect("ring lock");
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                let dropped = self.inner.dropped_total.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped_total = dropped, "intake ring overflow, dropped oldest envelope");
            }
            queue.push_back(envelope);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.inner.queue.lock().expect("ring lock").len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    pub fn forwarded_total(&self) -> u64 {
        self.inner.forwarded_total.load(Ordering::Relaxed)
    }
}

async fn run_drain(
    inner: Arc<RingInner>,
    bus: Arc<dyn MessageBus>,
    send_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let envelope = {
            let mut queue = inner.queue.lock().expect("ring lock");
            queue.pop_front()
        };

        let Some(envelope) = envelope else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.notify.notified() => continue,
            }
        };

        match tokio::time::timeout(send_timeout, bus.send(&envelope)).await {
            Ok(Ok(())) => {
                inner.forwarded_total.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "bus send failed, retrying");
                requeue_front(&inner, envelope);
                if backoff(&cancel).await {
                    break;
                }
            }
            Err(_) => {
                tracing::warn!(timeout_ms = send_timeout.as_millis() as u64, "bus send timed out, retrying");
                requeue_front(&inner, envelope);
                if backoff(&cancel).await {
                    break;
                }
            }
        }
    }

    let remaining = inner.queue.lock().expect("ring lock").len();
    if remaining > 0 {
        tracing::warn!(remaining, "intake forwarder stopped with buffered envelopes");
    }
}

fn requeue_front(inner: &RingInner, envelope: RawEnvelope) {
    let mut queue = inner.queue.lock().expect("ring lock");
    if queue.len() >= inner.capacity {
        queue.pop_back();
        inner.dropped_total.fetch_add(1, Ordering::Relaxed);
    }
    queue.push_front(envelope);
}

/// Returns true when shutdown was requested during the backoff.
async fn backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(Duration::from_secs(1)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;
    use telemetry_core::bus::{BusError, BusMessage, MemoryBus};
    use telemetry_core::model::Transport;

    fn envelope(tag: &str) -> RawEnvelope {
        RawEnvelope {
            received_at: Utc::now(),
            transport: Transport::EdgeHttp,
            token: "munbon-ridr-water-level".to_string(),
            source_ip: None,
            content_type: "application/json".to_string(),
            vendor_payload: tag.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn envelopes_flow_through_to_the_bus() {
        let bus = Arc::new(MemoryBus::default());
        let cancel = CancellationToken::new();
        let forwarder = RingForwarder::start(
            bus.clone(),
            16,
            Duration::from_secs(1),
            cancel.clone(),
        );
        forwarder.enqueue(envelope("a")).unwrap();
        forwarder.enqueue(envelope("b")).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.depth(), 2);
        assert_eq!(forwarder.forwarded_total(), 2);
        cancel.cancel();
    }

    /// Bus that fails until flipped healthy, for hiccup bridging tests.
    struct FlakyBus {
        healthy: AtomicBool,
        delegate: MemoryBus,
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn send(&self, envelope: &RawEnvelope) -> Result<(), BusError> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(BusError::Io("unreachable".to_string()));
            }
            self.delegate.send(envelope).await
        }

        async fn receive(&self, max: usize) -> Result<Vec<BusMessage>, BusError> {
            self.delegate.receive(max).await
        }

        async fn ack(&self, receipt: &str) -> Result<(), BusError> {
            self.delegate.ack(receipt).await
        }

        async fn dead_letter(&self, message: &BusMessage, reason: &str) -> Result<(), BusError> {
            self.delegate.dead_letter(message, reason).await
        }
    }

    #[tokio::test]
    async fn hiccups_are_bridged_by_the_ring() {
        let bus = Arc::new(FlakyBus {
            healthy: AtomicBool::new(false),
            delegate: MemoryBus::default(),
        });
        let cancel = CancellationToken::new();
        let forwarder = RingForwarder::start(
            bus.clone(),
            16,
            Duration::from_millis(200),
            cancel.clone(),
        );
        forwarder.enqueue(envelope("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.delegate.depth(), 0);

        bus.healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(bus.delegate.depth(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        // No drain task: nothing consumes, so the ring fills up.
        let forwarder = RingForwarder {
            inner: Arc::new(RingInner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: 2,
                dropped_total: AtomicU64::new(0),
                forwarded_total: AtomicU64::new(0),
                closed: CancellationToken::new(),
            }),
        };
        forwarder.enqueue(envelope("a")).unwrap();
        forwarder.enqueue(envelope("b")).unwrap();
        forwarder.enqueue(envelope("c")).unwrap();
        assert_eq!(forwarder.depth(), 2);
        assert_eq!(forwarder.dropped_total(), 1);
    }
}
