use crate::error::IngestError;
use crate::model::RawEnvelope;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Contract required of the upstream message bus: at-least-once delivery,
/// per-message visibility timeout, and a dead-letter stream. FIFO is not
/// required; idempotency lives in the store's `(sensor_id, time)` key.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn send(&self, envelope: &RawEnvelope) -> Result<(), BusError>;
    /// Long-polls for up to `max` messages. Returns immediately when the
    /// bus has traffic; otherwise blocks up to the configured wait time.
    async fn receive(&self, max: usize) -> Result<Vec<BusMessage>, BusError>;
    /// Deletes the message; it will not be redelivered.
    async fn ack(&self, receipt: &str) -> Result<(), BusError>;
    /// Copies the message to the dead-letter stream tagged with `reason`
    /// (a decode reason or `max_receives`), then deletes it from the main
    /// stream.
    async fn dead_letter(&self, message: &BusMessage, reason: &str) -> Result<(), BusError>;
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub receipt: String,
    pub body: String,
    pub receive_count: u32,
}

impl BusMessage {
    pub fn envelope(&self) -> Result<RawEnvelope, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus i/o: {0}")]
    Io(String),
}

impl From<BusError> for IngestError {
    fn from(err: BusError) -> Self {
        IngestError::TransientIo(err.to_string())
    }
}

/// Amazon SQS implementation of the bus contract.
pub struct SqsBus {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    dead_letter_url: String,
    wait_time: Duration,
    visibility_timeout: Duration,
}

impl SqsBus {
    pub fn new(
        client: aws_sdk_sqs::Client,
        queue_url: impl Into<String>,
        dead_letter_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            dead_letter_url: dead_letter_url.into(),
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(30),
        }
    }

    pub async fn from_env(
        queue_url: impl Into<String>,
        dead_letter_url: impl Into<String>,
    ) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(aws_sdk_sqs::Client::new(&config), queue_url, dead_letter_url)
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }
}

#[async_trait]
impl MessageBus for SqsBus {
    async fn send(&self, envelope: &RawEnvelope) -> Result<(), BusError> {
        let body =
            serde_json::to_string(envelope).map_err(|err| BusError::Io(err.to_string()))?;
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|err| BusError::Io(err.to_string()))?;
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<BusMessage>, BusError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max.clamp(1, 10) as i32)
            .wait_time_seconds(self.wait_time.as_secs() as i32)
            .visibility_timeout(self.visibility_timeout.as_secs() as i32)
            .message_system_attribute_names(
                aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount,
            )
            .send()
            .await
            .map_err(|err| BusError::Io(err.to_string()))?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|msg| {
                let receipt = msg.receipt_handle?;
                let body = msg.body?;
                let receive_count = msg
                    .attributes
                    .as_ref()
                    .and_then(|attrs| {
                        attrs.get(
                            &aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount,
                        )
                    })
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(1);
                Some(BusMessage {
                    receipt,
                    body,
                    receive_count,
                })
            })
            .collect();
        Ok(messages)
    }

    async fn ack(&self, receipt: &str) -> Result<(), BusError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|err| BusError::Io(err.to_string()))?;
        Ok(())
    }

    async fn dead_letter(&self, message: &BusMessage, reason: &str) -> Result<(), BusError> {
        let attribute = aws_sdk_sqs::types::MessageAttributeValue::builder()
            .data_type("String")
            .string_value(reason)
            .build()
            .map_err(|err| BusError::Io(err.to_string()))?;
        self.client
            .send_message()
            .queue_url(&self.dead_letter_url)
            .message_body(&message.body)
            .message_attributes("reason", attribute)
            .send()
            .await
            .map_err(|err| BusError::Io(err.to_string()))?;
        self.ack(&message.receipt).await
    }
}

/// In-memory bus with real visibility-timeout semantics, used by tests and
/// single-host deployments.
pub struct MemoryBus {
    inner: Mutex<MemoryBusState>,
    visibility_timeout: Duration,
}

#[derive(Default)]
struct MemoryBusState {
    queue: VecDeque<StoredMessage>,
    dead: Vec<(String, String)>,
    next_receipt: u64,
}

struct StoredMessage {
    receipt: String,
    body: String,
    receive_count: u32,
    visible_at: Instant,
}

impl MemoryBus {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(MemoryBusState::default()),
            visibility_timeout,
        }
    }

    pub fn dead_letters(&self) -> Vec<(String, String)> {
        self.inner.lock().expect("bus lock").dead.clone()
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("bus lock").queue.len()
    }

    /// Makes every in-flight message immediately visible again; test hook
    /// standing in for the passage of the visibility timeout.
    pub fn expire_visibility(&self) {
        let mut inner = self.inner.lock().expect("bus lock");
        let now = Instant::now();
        for message in inner.queue.iter_mut() {
            message.visible_at = now;
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn send(&self, envelope: &RawEnvelope) -> Result<(), BusError> {
        let body =
            serde_json::to_string(envelope).map_err(|err| BusError::Io(err.to_string()))?;
        let mut inner = self.inner.lock().expect("bus lock");
        inner.next_receipt += 1;
        let receipt = format!("mem-{}", inner.next_receipt);
        inner.queue.push_back(StoredMessage {
            receipt,
            body,
            receive_count: 0,
            visible_at: Instant::now(),
        });
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<BusMessage>, BusError> {
        let mut inner = self.inner.lock().expect("bus lock");
        let now = Instant::now();
        let mut out = Vec::new();
        for message in inner.queue.iter_mut() {
            if out.len() >= max.clamp(1, 10) {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            message.receive_count += 1;
            message.visible_at = now + self.visibility_timeout;
            out.push(BusMessage {
                receipt: message.receipt.clone(),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
        }
        Ok(out)
    }

    async fn ack(&self, receipt: &str) -> Result<(), BusError> {
        let mut inner = self.inner.lock().expect("bus lock");
        inner.queue.retain(|message| message.receipt != receipt);
        Ok(())
    }

    async fn dead_letter(&self, message: &BusMessage, reason: &str) -> Result<(), BusError> {
        let mut inner = self.inner.lock().expect("bus lock");
        inner
            .queue
            .retain(|stored| stored.receipt != message.receipt);
        inner.dead.push((message.body.clone(), reason.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Transport;
    use chrono::Utc;

    fn envelope() -> RawEnvelope {
        RawEnvelope {
            received_at: Utc::now(),
            transport: Transport::EdgeHttp,
            token: "munbon-ridr-water-level".to_string(),
            source_ip: None,
            content_type: "application/json".to_string(),
            vendor_payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn received_messages_stay_invisible_until_the_timeout() {
        let bus = MemoryBus::new(Duration::from_secs(30));
        bus.send(&envelope()).await.unwrap();

        let first = bus.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);

        // Still in flight: a second poll sees nothing.
        assert!(bus.receive(10).await.unwrap().is_empty());

        bus.expire_visibility();
        let redelivered = bus.receive(10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].receive_count, 2);
    }

    #[tokio::test]
    async fn ack_removes_the_message_for_good() {
        let bus = MemoryBus::default();
        bus.send(&envelope()).await.unwrap();
        let received = bus.receive(1).await.unwrap();
        bus.ack(&received[0].receipt).await.unwrap();
        bus.expire_visibility();
        assert!(bus.receive(10).await.unwrap().is_empty());
        assert_eq!(bus.depth(), 0);
    }

    #[tokio::test]
    async fn dead_letter_moves_the_message_with_its_reason() {
        let bus = MemoryBus::default();
        bus.send(&envelope()).await.unwrap();
        let received = bus.receive(1).await.unwrap();
        bus.dead_letter(&received[0], "shape_mismatch")
            .await
            .unwrap();
        assert_eq!(bus.depth(), 0);
        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "shape_mismatch");
    }

    #[tokio::test]
    async fn bodies_round_trip_as_envelopes() {
        let bus = MemoryBus::default();
        bus.send(&envelope()).await.unwrap();
        let received = bus.receive(1).await.unwrap();
        let decoded = received[0].envelope().unwrap();
        assert_eq!(decoded.token, "munbon-ridr-water-level");
    }
}
