use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Sensor families served by the pipeline. The wire/path form uses kebab
/// case (`water-level`), storage and topics use snake case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorFamily {
    WaterLevel,
    Moisture,
    Gateway,
    Weather,
}

impl SensorFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorFamily::WaterLevel => "water_level",
            SensorFamily::Moisture => "moisture",
            SensorFamily::Gateway => "gateway",
            SensorFamily::Weather => "weather",
        }
    }

    pub fn path_slug(&self) -> &'static str {
        match self {
            SensorFamily::WaterLevel => "water-level",
            SensorFamily::Moisture => "moisture",
            SensorFamily::Gateway => "gateway",
            SensorFamily::Weather => "weather",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "water_level" | "water-level" | "water-levels" => Some(SensorFamily::WaterLevel),
            "moisture" => Some(SensorFamily::Moisture),
            "gateway" => Some(SensorFamily::Gateway),
            "weather" => Some(SensorFamily::Weather),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// Derives the canonical water-level id from a vendor MAC address:
/// `WL-` plus the last 12 hex digits, uppercased. Returns `None` when the
/// MAC does not carry 12 hex digits.
pub fn water_level_sensor_id(mac_address: &str) -> Option<String> {
    let hex: String = mac_address
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    if hex.len() < 12 {
        return None;
    }
    let tail = &hex[hex.len() - 12..];
    Some(format!("WL-{}", tail.to_uppercase()))
}

fn pad5(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    // Leading zeros in vendor payloads ("016") are decimal, not octal.
    let value: u64 = trimmed.parse().ok()?;
    if value > 99_999 {
        return None;
    }
    Some(format!("{value:05}"))
}

/// `MS-<gwid5>-<sid5>`, both components zero-padded decimal.
pub fn moisture_sensor_id(gw_id: &str, sensor_id: &str) -> Option<String> {
    Some(format!("MS-{}-{}", pad5(gw_id)?, pad5(sensor_id)?))
}

/// `GW-<gwid5>`.
pub fn gateway_sensor_id(gw_id: &str) -> Option<String> {
    Some(format!("GW-{}", pad5(gw_id)?))
}

/// `AOS-<stationNum>`.
pub fn weather_sensor_id(station: u32) -> String {
    format!("AOS-{station}")
}

pub fn family_of_sensor_id(id: &str) -> Option<SensorFamily> {
    match id.split('-').next()? {
        "WL" => Some(SensorFamily::WaterLevel),
        "MS" => Some(SensorFamily::Moisture),
        "GW" => Some(SensorFamily::Gateway),
        "AOS" => Some(SensorFamily::Weather),
        _ => None,
    }
}

/// Registry entity. One row per sensor id, updated in place; sensors are
/// never deleted (staleness is a computed view, not a stored state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub family: SensorFamily,
    pub manufacturer: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub location: Option<LatLng>,
    pub metadata: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterLevelReading {
    pub time: DateTime<Utc>,
    pub sensor_id: String,
    pub level_cm: f64,
    pub voltage_v: f64,
    pub rssi_dbm: i32,
    pub temperature_c: Option<f64>,
    pub quality: f64,
    pub location: Option<LatLng>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoistureReading {
    pub time: DateTime<Utc>,
    pub sensor_id: String,
    pub moisture_surface_pct: Option<f64>,
    pub moisture_deep_pct: Option<f64>,
    pub temp_surface_c: Option<f64>,
    pub temp_deep_c: Option<f64>,
    pub ambient_humidity_pct: Option<f64>,
    pub ambient_temp_c: Option<f64>,
    pub flood: bool,
    pub voltage_v: Option<f64>,
    pub quality: f64,
    pub location: Option<LatLng>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub time: DateTime<Utc>,
    pub sensor_id: String,
    pub rainfall_mm: Option<f64>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub wind_speed_ms: Option<f64>,
    pub wind_max_ms: Option<f64>,
    pub wind_dir_deg: Option<f64>,
    pub solar_radiation_wm2: Option<f64>,
    pub battery_v: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub quality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Reading {
    WaterLevel(WaterLevelReading),
    Moisture(MoistureReading),
    Weather(WeatherReading),
}

impl Reading {
    pub fn sensor_id(&self) -> &str {
        match self {
            Reading::WaterLevel(r) => &r.sensor_id,
            Reading::Moisture(r) => &r.sensor_id,
            Reading::Weather(r) => &r.sensor_id,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Reading::WaterLevel(r) => r.time,
            Reading::Moisture(r) => r.time,
            Reading::Weather(r) => r.time,
        }
    }

    pub fn quality(&self) -> f64 {
        match self {
            Reading::WaterLevel(r) => r.quality,
            Reading::Moisture(r) => r.quality,
            Reading::Weather(r) => r.quality,
        }
    }

    pub fn family(&self) -> SensorFamily {
        match self {
            Reading::WaterLevel(_) => SensorFamily::WaterLevel,
            Reading::Moisture(_) => SensorFamily::Moisture,
            Reading::Weather(_) => SensorFamily::Weather,
        }
    }

    pub fn location(&self) -> Option<LatLng> {
        match self {
            Reading::WaterLevel(r) => r.location,
            Reading::Moisture(r) => r.location,
            Reading::Weather(_) => None,
        }
    }
}

/// Identity facts extracted at decode time, consumed by the registry to
/// keep the `Sensor` row fresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorFacts {
    pub id: String,
    pub family: SensorFamily,
    pub manufacturer: String,
    pub seen_at: DateTime<Utc>,
    pub location: Option<LatLng>,
    pub metadata: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    EdgeHttp,
    CloudHttp,
    Mqtt,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::EdgeHttp => "edge_http",
            Transport::CloudHttp => "cloud_http",
            Transport::Mqtt => "mqtt",
        }
    }
}

/// Bus-transit wrapper around a vendor payload. Created at intake,
/// destroyed on successful consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub received_at: DateTime<Utc>,
    pub transport: Transport,
    pub token: String,
    pub source_ip: Option<String>,
    pub content_type: String,
    #[serde(with = "payload_encoding")]
    pub vendor_payload: Vec<u8>,
}

/// Raw bytes travel base64-encoded inside the JSON envelope.
mod payload_encoding {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn water_level_id_uses_last_12_hex_digits_uppercased() {
        assert_eq!(
            water_level_sensor_id("1a2b3c4d5e6f").as_deref(),
            Some("WL-1A2B3C4D5E6F")
        );
        // Longer identifiers keep only the trailing 12 hex digits.
        assert_eq!(
            water_level_sensor_id("00:11:22:1a:2b:3c:4d:5e:6f").as_deref(),
            Some("WL-1A2B3C4D5E6F")
        );
        assert_eq!(water_level_sensor_id("abc"), None);
    }

    #[test]
    fn moisture_ids_are_zero_padded_decimal() {
        assert_eq!(
            moisture_sensor_id("3", "13").as_deref(),
            Some("MS-00003-00013")
        );
        assert_eq!(
            moisture_sensor_id("016", "007").as_deref(),
            Some("MS-00016-00007")
        );
        assert_eq!(gateway_sensor_id("3").as_deref(), Some("GW-00003"));
        assert_eq!(moisture_sensor_id("", "1"), None);
        assert_eq!(moisture_sensor_id("x", "1"), None);
    }

    #[test]
    fn id_derivation_is_deterministic() {
        let a = moisture_sensor_id("00042", "9").unwrap();
        let b = moisture_sensor_id("42", "00009").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn family_is_recovered_from_the_id_prefix() {
        assert_eq!(
            family_of_sensor_id("WL-1A2B3C4D5E6F"),
            Some(SensorFamily::WaterLevel)
        );
        assert_eq!(
            family_of_sensor_id("MS-00003-00013"),
            Some(SensorFamily::Moisture)
        );
        assert_eq!(family_of_sensor_id("GW-00003"), Some(SensorFamily::Gateway));
        assert_eq!(family_of_sensor_id("AOS-12"), Some(SensorFamily::Weather));
        assert_eq!(family_of_sensor_id("bogus"), None);
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = RawEnvelope {
            received_at: Utc.with_ymd_and_hms(2025, 6, 2, 7, 55, 46).unwrap(),
            transport: Transport::EdgeHttp,
            token: "munbon-ridr-water-level".to_string(),
            source_ip: Some("10.0.0.7".to_string()),
            content_type: "application/json".to_string(),
            vendor_payload: br#"{"level":15}"#.to_vec(),
        };
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: RawEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.vendor_payload, envelope.vendor_payload);
        assert_eq!(decoded.transport, Transport::EdgeHttp);
        assert_eq!(decoded.token, envelope.token);
    }
}
