use crate::config::ApiConfig;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Per-subscriber buffer cap; beyond it the oldest event is dropped and a
/// synthetic `slow_consumer` notice is delivered in-band.
const SUBSCRIBER_QUEUE_CAP: usize = 1_000;
const SLOW_CONSUMER_TOPIC: &str = "system/slow_consumer";

#[derive(Debug, Clone, serde::Serialize)]
pub struct OutboundEvent {
    pub topic: String,
    pub payload: JsonValue,
}

pub struct Subscriber {
    id: u64,
    topics: Mutex<HashSet<String>>,
    queue: Mutex<VecDeque<OutboundEvent>>,
    dropped: AtomicU64,
    notify: Notify,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(&self, topics: &[String]) {
        let mut set = self.topics.lock().expect("subscriber topics lock");
        for topic in topics {
            let trimmed = topic.trim();
            if !trimmed.is_empty() {
                set.insert(trimmed.to_string());
            }
        }
    }

    pub fn unsubscribe(&self, topics: &[String]) {
        let mut set = self.topics.lock().expect("subscriber topics lock");
        for topic in topics {
            set.remove(topic.trim());
        }
    }

    fn wants(&self, topic: &str) -> bool {
        let set = self.topics.lock().expect("subscriber topics lock");
        set.iter().any(|filter| topic_matches(filter, topic))
    }

    fn push(&self, event: OutboundEvent) {
        let mut queue = self.queue.lock().expect("subscriber queue lock");
        if queue.len() >= SUBSCRIBER_QUEUE_CAP {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    /// Next event for this subscriber; a pending drop notice takes
    /// precedence so slow consumers learn they lost data.
    pub async fn next(&self) -> OutboundEvent {
        loop {
            {
                let dropped = self.dropped.swap(0, Ordering::Relaxed);
                if dropped > 0 {
                    return OutboundEvent {
                        topic: SLOW_CONSUMER_TOPIC.to_string(),
                        payload: serde_json::json!({
                            "event": "slow_consumer",
                            "dropped": dropped,
                        }),
                    };
                }
                let mut queue = self.queue.lock().expect("subscriber queue lock");
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Fan-out hub: the broker side pushes every event once; delivery to each
/// subscriber is serialized through its own bounded queue.
#[derive(Default)]
pub struct WsHub {
    subscribers: Mutex<HashMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl WsHub {
    pub fn register(&self) -> Arc<Subscriber> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            topics: Mutex::new(HashSet::new()),
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        self.subscribers
            .lock()
            .expect("hub lock")
            .insert(id, subscriber.clone());
        subscriber
    }

    pub fn remove(&self, id: u64) {
        self.subscribers.lock().expect("hub lock").remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("hub lock").len()
    }

    pub fn publish(&self, topic: &str, payload: JsonValue) {
        let subscribers: Vec<Arc<Subscriber>> = {
            let map = self.subscribers.lock().expect("hub lock");
            map.values().cloned().collect()
        };
        for subscriber in subscribers {
            if subscriber.wants(topic) {
                subscriber.push(OutboundEvent {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

/// MQTT-style filter match over `/`-separated topic levels: `+` matches a
/// single level, a trailing `#` matches the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (None, None) => return true,
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(level)) if expected == level => continue,
            _ => return false,
        }
    }
}

/// Mirrors the broker's real-time topics into the hub so WebSocket
/// subscribers see the same stream the MQTT side publishes.
pub fn start_mqtt_bridge(config: &ApiConfig, hub: Arc<WsHub>, cancel: CancellationToken) {
    let Some(host) = config.mqtt_host.clone() else {
        tracing::warn!("API_MQTT_HOST not set; WebSocket fan-out runs without a broker feed");
        return;
    };
    let port = config.mqtt_port;
    let username = config.mqtt_username.clone();
    let password = config.mqtt_password.clone();

    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = run_bridge_once(
                &host,
                port,
                username.as_deref(),
                password.as_deref(),
                &hub,
                cancel.clone(),
            )
            .await
            {
                tracing::warn!(error = %err, "mqtt bridge loop failed; reconnecting");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });
}

async fn run_bridge_once(
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
    hub: &Arc<WsHub>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut options = MqttOptions::new(
        format!("query-api-hub-{}", std::process::id()),
        host,
        port,
    );
    options.set_keep_alive(Duration::from_secs(10));
    if let (Some(username), Some(password)) = (username, password) {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 32);
    client.subscribe("sensors/#", QoS::AtMostOnce).await?;
    client.subscribe("alerts/#", QoS::AtMostOnce).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        match serde_json::from_slice::<JsonValue>(&publish.payload) {
                            Ok(payload) => hub.publish(publish.topic.as_str(), payload),
                            Err(err) => {
                                tracing::debug!(topic = %publish.topic, error = %err, "non-json broker payload ignored");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => anyhow::bail!("mqtt disconnected"),
                    Ok(_) => {}
                    Err(err) => anyhow::bail!(err),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_match_exact_plus_and_hash() {
        assert!(topic_matches(
            "sensors/water_level/WL-1A2B3C4D5E6F/data",
            "sensors/water_level/WL-1A2B3C4D5E6F/data"
        ));
        assert!(topic_matches(
            "sensors/+/WL-1A2B3C4D5E6F/data",
            "sensors/water_level/WL-1A2B3C4D5E6F/data"
        ));
        assert!(topic_matches("alerts/#", "alerts/critical/flood"));
        assert!(!topic_matches("alerts/#", "sensors/moisture/MS-1/data"));
        assert!(!topic_matches(
            "sensors/+/data",
            "sensors/water_level/WL-1/data"
        ));
    }

    #[tokio::test]
    async fn events_reach_matching_subscribers_only() {
        let hub = WsHub::default();
        let a = hub.register();
        let b = hub.register();
        a.subscribe(&["sensors/water_level/+/data".to_string()]);
        b.subscribe(&["alerts/#".to_string()]);

        hub.publish(
            "sensors/water_level/WL-1A2B3C4D5E6F/data",
            json!({"level_cm": 15}),
        );

        let event = a.next().await;
        assert_eq!(event.topic, "sensors/water_level/WL-1A2B3C4D5E6F/data");
        assert!(b.queue.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = WsHub::default();
        let sub = hub.register();
        sub.subscribe(&["alerts/#".to_string()]);
        sub.unsubscribe(&["alerts/#".to_string()]);
        hub.publish("alerts/critical/flood", json!({}));
        assert!(sub.queue.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn slow_consumers_get_a_drop_notice() {
        let hub = WsHub::default();
        let sub = hub.register();
        sub.subscribe(&["alerts/#".to_string()]);

        for i in 0..(SUBSCRIBER_QUEUE_CAP + 5) {
            hub.publish("alerts/warning/water_low", json!({"seq": i}));
        }

        let first = sub.next().await;
        assert_eq!(first.topic, SLOW_CONSUMER_TOPIC);
        assert_eq!(first.payload["dropped"], 5);

        // The oldest surviving event is the sixth published.
        let next = sub.next().await;
        assert_eq!(next.payload["seq"], 5);
    }

    #[tokio::test]
    async fn removed_subscribers_are_forgotten() {
        let hub = WsHub::default();
        let sub = hub.register();
        assert_eq!(hub.subscriber_count(), 1);
        hub.remove(sub.id());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
