mod moisture;
mod quality;
mod water_level;
mod weather;

pub use quality::{moisture_quality, water_level_quality, weather_quality};

use crate::error::{DecodeError, DecodeReason};
use crate::model::{RawEnvelope, Reading, SensorFacts, SensorFamily};
use serde_json::Value as JsonValue;

/// Intake tokens the fleet is provisioned with. Dispatch is token-first;
/// payload sniffing only kicks in for unrecognized tokens so that legacy
/// gateways with stale firmware keep working.
pub const WATER_LEVEL_TOKEN: &str = "munbon-ridr-water-level";
pub const MOISTURE_TOKEN: &str = "munbon-m2m-moisture";
pub const WEATHER_TOKEN: &str = "munbon-aos-weather";

#[derive(Debug, Clone)]
pub struct Decoded {
    pub family: SensorFamily,
    pub readings: Vec<Reading>,
    pub sensor_facts: Vec<SensorFacts>,
}

/// Maps a bus envelope to canonical readings plus the sensor facts the
/// registry needs. Pure: no clock reads, no side effects; equal envelopes
/// decode to equal values.
pub fn decode(envelope: &RawEnvelope) -> Result<Decoded, DecodeError> {
    let body = trim_payload(&envelope.vendor_payload);
    if body.is_empty() {
        return Err(DecodeError::new(DecodeReason::EmptyPayload, "empty body"));
    }

    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|err| DecodeError::new(DecodeReason::ShapeMismatch, err.to_string()))?;

    match envelope.token.as_str() {
        WATER_LEVEL_TOKEN => water_level::decode(&value),
        MOISTURE_TOKEN => moisture::decode(&value),
        WEATHER_TOKEN => weather::decode(&value),
        other => sniff(&value).ok_or_else(|| {
            DecodeError::new(DecodeReason::UnknownToken, format!("token '{other}'"))
        })?,
    }
}

fn sniff(value: &JsonValue) -> Option<Result<Decoded, DecodeError>> {
    let obj = value.as_object()?;
    if obj.contains_key("macAddress") || obj.contains_key("deviceID") {
        return Some(water_level::decode(value));
    }
    if obj.contains_key("gw_id") {
        return Some(moisture::decode(value));
    }
    if obj.contains_key("station") {
        return Some(weather::decode(value));
    }
    None
}

fn trim_payload(payload: &[u8]) -> &[u8] {
    let start = payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(payload.len());
    let end = payload
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &payload[start..end]
}

/// Vendor numeric strings: `"016"` is decimal sixteen, `""` is null.
pub(crate) fn parse_vendor_number(raw: Option<&str>) -> Option<f64> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Transport;
    use chrono::{TimeZone, Utc};

    fn envelope(token: &str, body: &str) -> RawEnvelope {
        RawEnvelope {
            received_at: Utc.with_ymd_and_hms(2025, 8, 1, 16, 0, 0).unwrap(),
            transport: Transport::EdgeHttp,
            token: token.to_string(),
            source_ip: Some("203.0.113.9".to_string()),
            content_type: "application/json".to_string(),
            vendor_payload: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn empty_bodies_decode_to_empty_payload() {
        let err = decode(&envelope(WATER_LEVEL_TOKEN, "   \n")).unwrap_err();
        assert_eq!(err.reason, DecodeReason::EmptyPayload);
    }

    #[test]
    fn unknown_token_without_recognizable_shape_is_rejected() {
        let err = decode(&envelope("munbon-unknown", r#"{"foo": 1}"#)).unwrap_err();
        assert_eq!(err.reason, DecodeReason::UnknownToken);
    }

    #[test]
    fn sniffing_recovers_water_level_payloads_under_stale_tokens() {
        let body = r#"{"deviceID":"abc","macAddress":"1A2B3C4D5E6F","latitude":13.75,"longitude":100.50,"RSSI":-65,"voltage":420,"level":15,"timestamp":1748841346551}"#;
        let decoded = decode(&envelope("munbon-legacy", body)).unwrap();
        assert_eq!(decoded.family, SensorFamily::WaterLevel);
        assert_eq!(decoded.readings.len(), 1);
    }

    #[test]
    fn decode_is_pure() {
        let body = r#"{"deviceID":"abc","macAddress":"1A2B3C4D5E6F","latitude":13.75,"longitude":100.50,"RSSI":-65,"voltage":420,"level":15,"timestamp":1748841346551}"#;
        let a = decode(&envelope(WATER_LEVEL_TOKEN, body)).unwrap();
        let b = decode(&envelope(WATER_LEVEL_TOKEN, body)).unwrap();
        assert_eq!(a.readings, b.readings);
    }

    #[test]
    fn vendor_numbers_parse_leading_zeros_and_map_empty_to_null() {
        assert_eq!(parse_vendor_number(Some("016")), Some(16.0));
        assert_eq!(parse_vendor_number(Some("3.95")), Some(3.95));
        assert_eq!(parse_vendor_number(Some("")), None);
        assert_eq!(parse_vendor_number(Some("  ")), None);
        assert_eq!(parse_vendor_number(None), None);
    }
}
