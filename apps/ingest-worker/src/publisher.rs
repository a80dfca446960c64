use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::Value as JsonValue;
use std::time::Duration;
use telemetry_core::model::SensorFamily;
use tokio::task::JoinHandle;

pub fn reading_topic(family: SensorFamily, sensor_id: &str) -> String {
    format!("sensors/{}/{}/data", family.as_str(), sensor_id)
}

pub fn location_topic(family: SensorFamily, sensor_id: &str) -> String {
    format!("sensors/{}/{}/location", family.as_str(), sensor_id)
}

/// Best-effort event sink; delivery is non-persistent by design and
/// failures only surface as counters.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: &JsonValue) -> Result<(), anyhow::Error>;
}

/// MQTT mirror of the real-time topics, QoS 0.
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(
        client_id: &str,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(10));
        if let (Some(username), Some(password)) = (username, password) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "mqtt event loop error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        (Self { client }, handle)
    }
}

#[async_trait]
impl EventPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &JsonValue) -> Result<(), anyhow::Error> {
        let bytes = serde_json::to_vec(payload)?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, bytes)
            .await?;
        Ok(())
    }
}

/// Stands in when no broker is configured.
pub struct NullPublisher;

#[async_trait]
impl EventPublisher for NullPublisher {
    async fn publish(&self, _topic: &str, _payload: &JsonValue) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
