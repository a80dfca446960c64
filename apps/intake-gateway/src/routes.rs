use crate::config::IntakeMode;
use crate::relay::{CloudRelay, RelayDecision};
use crate::ring::RingForwarder;
use crate::shed::EmptyPayloadTracker;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry_core::model::{RawEnvelope, Transport};

#[derive(Clone)]
pub struct AppState {
    pub mode: IntakeMode,
    pub forwarder: RingForwarder,
    pub shed: Arc<EmptyPayloadTracker>,
    pub relay: Option<Arc<CloudRelay>>,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<JsonValue>) {
    (
        status,
        Json(json!({
            "error": message.into(),
            "statusCode": status.as_u16(),
        })),
    )
}

/// Tolerant intake endpoint. Legacy gateways send keep-alive dials with
/// empty or identity-less bodies; those are acknowledged with `200` and
/// shed, never forwarded. Everything else is wrapped into an envelope and
/// queued; classification happens downstream.
async fn ingest_sensor_data(
    State(state): State<AppState>,
    Path((_family, token)): Path<(String, String)>,
    conn: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JsonValue>, (StatusCode, Json<JsonValue>)> {
    let source_ip = conn.map(|ConnectInfo(addr)| addr.ip().to_string());

    if let Some(relay) = &state.relay {
        match relay.resolve(&token) {
            RelayDecision::Allowed(_) => {}
            RelayDecision::Denied | RelayDecision::Unknown => {
                return Err(error_body(StatusCode::UNAUTHORIZED, "invalid token"));
            }
            RelayDecision::RateLimited => {
                return Err(error_body(StatusCode::TOO_MANY_REQUESTS, "tenant rate exceeded"));
            }
        }
    }

    if !carries_identity(&body) {
        let source = source_ip.as_deref().unwrap_or("unknown");
        state.shed.record(source);
        tracing::debug!(source, token = %token, "shed empty or identity-less payload");
        return Ok(Json(json!({"status": "success"})));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let envelope = RawEnvelope {
        received_at: Utc::now(),
        transport: match state.mode {
            IntakeMode::Edge => Transport::EdgeHttp,
            IntakeMode::Cloud => Transport::CloudHttp,
        },
        token,
        source_ip,
        content_type,
        vendor_payload: body.to_vec(),
    };

    state.forwarder.enqueue(envelope).map_err(|err| {
        tracing::error!(error = %err, "failed to queue envelope");
        error_body(StatusCode::SERVICE_UNAVAILABLE, "intake temporarily unavailable")
    })?;

    Ok(Json(json!({"status": "success"})))
}

/// A body is forwardable when it parses as JSON and names at least one
/// identity field any decoder could key on.
fn carries_identity(body: &[u8]) -> bool {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return false;
    }
    let Ok(value) = serde_json::from_slice::<JsonValue>(body) else {
        return false;
    };
    let Some(obj) = value.as_object() else {
        return false;
    };
    const IDENTITY_FIELDS: &[&str] = &["gw_id", "macAddress", "deviceID", "station"];
    IDENTITY_FIELDS.iter().any(|field| {
        obj.get(*field)
            .map(|v| match v {
                JsonValue::String(s) => !s.trim().is_empty(),
                JsonValue::Null => false,
                _ => true,
            })
            .unwrap_or(false)
    })
}

async fn health(State(state): State<AppState>) -> Json<JsonValue> {
    let service = match state.mode {
        IntakeMode::Edge => "intake-gateway-edge",
        IntakeMode::Cloud => "intake-gateway-cloud",
    };
    Json(json!({
        "status": "healthy",
        "service": service,
        "ts": Utc::now().to_rfc3339(),
    }))
}

async fn empty_payload_stats(State(state): State<AppState>) -> Json<JsonValue> {
    let sources = state.shed.snapshot();
    Json(json!({
        "sources": sources,
        "ring_depth": state.forwarder.depth(),
        "ring_dropped_total": state.forwarder.dropped_total(),
    }))
}

/// Static per-token configuration blob served to devices at boot.
async fn token_attributes(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<JsonValue>, (StatusCode, Json<JsonValue>)> {
    let Some(relay) = &state.relay else {
        return Err(error_body(StatusCode::NOT_FOUND, "not found"));
    };
    relay
        .attributes(&token)
        .map(Json)
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, "unknown token"))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/sensor-data/{family}/{token}",
            post(ingest_sensor_data),
        )
        .route("/api/stats/empty-payloads", get(empty_payload_stats))
        .route("/api/v1/{token}/attributes", get(token_attributes))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use telemetry_core::bus::{MemoryBus, MessageBus};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn test_state(mode: IntakeMode, relay: Option<Arc<CloudRelay>>) -> (AppState, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::default());
        let forwarder = RingForwarder::start(
            bus.clone(),
            16,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        (
            AppState {
                mode,
                forwarder,
                shed: Arc::new(EmptyPayloadTracker::default()),
                relay,
            },
            bus,
        )
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    const WATER_LEVEL_BODY: &str = r#"{"deviceID":"abc","macAddress":"1A2B3C4D5E6F","latitude":13.75,"longitude":100.50,"RSSI":-65,"voltage":420,"level":15,"timestamp":1748841346551}"#;

    #[tokio::test]
    async fn forwards_valid_payloads_to_the_bus() {
        let (state, bus) = test_state(IntakeMode::Edge, None);
        let app = router(state);
        let resp = app
            .oneshot(post(
                "/api/sensor-data/water-level/munbon-ridr-water-level",
                WATER_LEVEL_BODY,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let messages = bus.receive(10).await.unwrap();
        assert_eq!(messages.len(), 1);
        let envelope = messages[0].envelope().unwrap();
        assert_eq!(envelope.token, "munbon-ridr-water-level");
        assert_eq!(envelope.transport, Transport::EdgeHttp);
    }

    #[tokio::test]
    async fn empty_payloads_get_200_but_are_not_forwarded() {
        let (state, bus) = test_state(IntakeMode::Edge, None);
        let shed = state.shed.clone();
        let app = router(state);
        let resp = app
            .oneshot(post("/api/sensor-data/moisture/munbon-m2m-moisture", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.depth(), 0);
        assert_eq!(shed.snapshot().len(), 1);
        assert!(shed.snapshot()[0].count >= 1);
    }

    #[tokio::test]
    async fn text_plain_json_is_accepted() {
        let (state, bus) = test_state(IntakeMode::Edge, None);
        let app = router(state);
        let request = Request::builder()
            .method("POST")
            .uri("/api/sensor-data/water-level/munbon-ridr-water-level")
            .header("content-type", "text/plain")
            .body(Body::from(WATER_LEVEL_BODY.to_string()))
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.depth(), 1);
    }

    #[tokio::test]
    async fn identity_check_spots_moisture_gateways() {
        assert!(carries_identity(br#"{"gw_id":"3","sensor":[]}"#));
        assert!(!carries_identity(br#"{"gw_id":""}"#));
        assert!(!carries_identity(b"  "));
        assert!(!carries_identity(b"not json"));
        assert!(!carries_identity(br#"[1,2,3]"#));
    }

    #[tokio::test]
    async fn health_reports_the_service() {
        let (state, _bus) = test_state(IntakeMode::Edge, None);
        let app = router(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn attributes_404_without_a_relay() {
        let (state, _bus) = test_state(IntakeMode::Edge, None);
        let app = router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/munbon-m2m-moisture/attributes")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
