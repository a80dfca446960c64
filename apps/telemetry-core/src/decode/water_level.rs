use super::{quality, Decoded};
use crate::error::{DecodeError, DecodeReason};
use crate::model::{
    water_level_sensor_id, LatLng, Reading, SensorFacts, SensorFamily, WaterLevelReading,
};
use crate::time::from_epoch_ms;
use serde::Deserialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Deserialize)]
struct WaterLevelWire {
    #[serde(rename = "deviceID", default)]
    device_id: Option<String>,
    #[serde(rename = "macAddress", default)]
    mac_address: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(rename = "RSSI", default)]
    rssi: Option<i64>,
    /// Centivolts on the wire.
    #[serde(default)]
    voltage: Option<f64>,
    #[serde(default)]
    level: Option<f64>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    temperature: Option<f64>,
}

pub(super) fn decode(value: &JsonValue) -> Result<Decoded, DecodeError> {
    let wire: WaterLevelWire = serde_json::from_value(value.clone())
        .map_err(|err| DecodeError::new(DecodeReason::ShapeMismatch, err.to_string()))?;

    let mac = wire
        .mac_address
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DecodeError::new(DecodeReason::MissingIdentity, "macAddress missing"))?;
    let sensor_id = water_level_sensor_id(mac).ok_or_else(|| {
        DecodeError::new(
            DecodeReason::MissingIdentity,
            format!("macAddress '{mac}' has fewer than 12 hex digits"),
        )
    })?;

    let timestamp_ms = wire
        .timestamp
        .ok_or_else(|| DecodeError::new(DecodeReason::BadTimestamp, "timestamp missing"))?;
    let time = from_epoch_ms(timestamp_ms).ok_or_else(|| {
        DecodeError::new(
            DecodeReason::BadTimestamp,
            format!("timestamp {timestamp_ms} out of range"),
        )
    })?;

    let level_cm = wire
        .level
        .ok_or_else(|| DecodeError::new(DecodeReason::ShapeMismatch, "level missing"))?;
    let voltage_v = wire.voltage.unwrap_or(0.0) / 100.0;
    let rssi_dbm = wire.rssi.unwrap_or(0) as i32;
    let location = match (wire.latitude, wire.longitude) {
        (Some(lat), Some(lng)) if lat != 0.0 || lng != 0.0 => Some(LatLng { lat, lng }),
        _ => None,
    };

    let reading = WaterLevelReading {
        time,
        sensor_id: sensor_id.clone(),
        level_cm,
        voltage_v,
        rssi_dbm,
        temperature_c: wire.temperature,
        quality: quality::water_level_quality(voltage_v, wire.temperature),
        location,
    };

    let mut metadata = serde_json::Map::new();
    if let Some(device_id) = wire
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        metadata.insert("device_id".to_string(), JsonValue::from(device_id));
    }
    metadata.insert("mac_address".to_string(), JsonValue::from(mac.to_uppercase()));

    let facts = SensorFacts {
        id: sensor_id,
        family: SensorFamily::WaterLevel,
        manufacturer: "RID-R".to_string(),
        seen_at: time,
        location,
        metadata,
    };

    Ok(Decoded {
        family: SensorFamily::WaterLevel,
        readings: vec![Reading::WaterLevel(reading)],
        sensor_facts: vec![facts],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> JsonValue {
        json!({
            "deviceID": "abc",
            "macAddress": "1A2B3C4D5E6F",
            "latitude": 13.75,
            "longitude": 100.50,
            "RSSI": -65,
            "voltage": 420,
            "level": 15,
            "timestamp": 1748841346551i64
        })
    }

    #[test]
    fn happy_path_maps_vendor_fields() {
        let decoded = decode(&sample()).unwrap();
        let Reading::WaterLevel(reading) = &decoded.readings[0] else {
            panic!("expected water-level reading");
        };
        assert_eq!(reading.sensor_id, "WL-1A2B3C4D5E6F");
        assert_eq!(reading.level_cm, 15.0);
        assert!((reading.voltage_v - 4.20).abs() < 1e-9, "centivolts to volts");
        assert_eq!(reading.rssi_dbm, -65);
        assert_eq!(
            reading
                .time
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "2025-06-02T07:55:46.551Z"
        );
        assert_eq!(reading.quality, 1.0);
        assert_eq!(
            reading.location,
            Some(LatLng {
                lat: 13.75,
                lng: 100.50
            })
        );
    }

    #[test]
    fn missing_mac_is_missing_identity() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("macAddress");
        let err = decode(&value).unwrap_err();
        assert_eq!(err.reason, DecodeReason::MissingIdentity);
    }

    #[test]
    fn missing_timestamp_is_bad_timestamp() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("timestamp");
        let err = decode(&value).unwrap_err();
        assert_eq!(err.reason, DecodeReason::BadTimestamp);
    }

    #[test]
    fn low_supply_voltage_degrades_quality() {
        let mut value = sample();
        value
            .as_object_mut()
            .unwrap()
            .insert("voltage".to_string(), json!(310));
        let decoded = decode(&value).unwrap();
        assert!((decoded.readings[0].quality() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn zero_coordinates_do_not_become_a_location() {
        let mut value = sample();
        let obj = value.as_object_mut().unwrap();
        obj.insert("latitude".to_string(), json!(0.0));
        obj.insert("longitude".to_string(), json!(0.0));
        let decoded = decode(&value).unwrap();
        assert!(decoded.readings[0].location().is_none());
    }
}
