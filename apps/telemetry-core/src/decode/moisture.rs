use super::{parse_vendor_number, quality, Decoded};
use crate::error::{DecodeError, DecodeReason};
use crate::model::{
    gateway_sensor_id, moisture_sensor_id, LatLng, MoistureReading, Reading, SensorFacts,
    SensorFamily,
};
use crate::time::from_vendor_date_time;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Vendor moisture payload v2: gateway header plus a `sensor` array. All
/// numeric fields arrive as strings, possibly zero-padded, possibly empty.
#[derive(Debug, Deserialize)]
struct MoistureWire {
    #[serde(default)]
    gw_id: Option<String>,
    #[serde(default)]
    gps_lat: Option<String>,
    #[serde(default)]
    gps_lng: Option<String>,
    #[serde(default)]
    gw_batt: Option<String>,
    #[serde(default)]
    amb_humid: Option<String>,
    #[serde(default)]
    amb_temp: Option<String>,
    /// Gateway clock, Asia/Bangkok local.
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    sensor: Vec<MoistureSensorWire>,
}

#[derive(Debug, Deserialize)]
struct MoistureSensorWire {
    #[serde(default)]
    sensor_id: Option<String>,
    /// Per-sensor clock, UTC, overrides the gateway clock when present.
    #[serde(default)]
    sensor_utc: Option<String>,
    #[serde(default)]
    sensor_date: Option<String>,
    #[serde(default)]
    humid_hi: Option<String>,
    #[serde(default)]
    humid_low: Option<String>,
    #[serde(default)]
    temp_hi: Option<String>,
    #[serde(default)]
    temp_low: Option<String>,
    #[serde(default)]
    amb_humid: Option<String>,
    #[serde(default)]
    amb_temp: Option<String>,
    #[serde(default)]
    flood: Option<String>,
    #[serde(default)]
    sensor_batt: Option<String>,
}

pub(super) fn decode(value: &JsonValue) -> Result<Decoded, DecodeError> {
    let wire: MoistureWire = serde_json::from_value(value.clone())
        .map_err(|err| DecodeError::new(DecodeReason::ShapeMismatch, err.to_string()))?;

    let gw_raw = wire
        .gw_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DecodeError::new(DecodeReason::MissingIdentity, "gw_id missing"))?;
    let gateway_id = gateway_sensor_id(gw_raw).ok_or_else(|| {
        DecodeError::new(
            DecodeReason::MissingIdentity,
            format!("gw_id '{gw_raw}' is not numeric"),
        )
    })?;

    let location = match (
        parse_vendor_number(wire.gps_lat.as_deref()),
        parse_vendor_number(wire.gps_lng.as_deref()),
    ) {
        (Some(lat), Some(lng)) if lat != 0.0 || lng != 0.0 => Some(LatLng { lat, lng }),
        _ => None,
    };

    let gateway_time = match (wire.date.as_deref(), wire.time.as_deref()) {
        (Some(date), Some(time)) => from_vendor_date_time(date, time, false),
        _ => None,
    };

    let mut readings = Vec::with_capacity(wire.sensor.len());
    let mut sensor_facts = Vec::with_capacity(wire.sensor.len() + 1);

    for (index, sensor) in wire.sensor.iter().enumerate() {
        let sid_raw = sensor
            .sensor_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                DecodeError::new(
                    DecodeReason::MissingIdentity,
                    format!("sensor[{index}].sensor_id missing"),
                )
            })?;
        let sensor_id = moisture_sensor_id(gw_raw, sid_raw).ok_or_else(|| {
            DecodeError::new(
                DecodeReason::MissingIdentity,
                format!("sensor[{index}].sensor_id '{sid_raw}' is not numeric"),
            )
        })?;

        let time = sensor_time(sensor, gateway_time).ok_or_else(|| {
            DecodeError::new(
                DecodeReason::BadTimestamp,
                format!("sensor[{index}] carries no usable timestamp"),
            )
        })?;

        let moisture_surface_pct = parse_vendor_number(sensor.humid_hi.as_deref());
        let moisture_deep_pct = parse_vendor_number(sensor.humid_low.as_deref());
        let temp_surface_c = parse_vendor_number(sensor.temp_hi.as_deref());
        let temp_deep_c = parse_vendor_number(sensor.temp_low.as_deref());
        let ambient_humidity_pct = parse_vendor_number(sensor.amb_humid.as_deref())
            .or_else(|| parse_vendor_number(wire.amb_humid.as_deref()));
        let ambient_temp_c = parse_vendor_number(sensor.amb_temp.as_deref())
            .or_else(|| parse_vendor_number(wire.amb_temp.as_deref()));
        let voltage_v = parse_vendor_number(sensor.sensor_batt.as_deref());
        let flood = sensor
            .flood
            .as_deref()
            .map(|v| v.trim().eq_ignore_ascii_case("yes"))
            .unwrap_or(false);

        let reading = MoistureReading {
            time,
            sensor_id: sensor_id.clone(),
            moisture_surface_pct,
            moisture_deep_pct,
            temp_surface_c,
            temp_deep_c,
            ambient_humidity_pct,
            ambient_temp_c,
            flood,
            voltage_v,
            quality: quality::moisture_quality(
                moisture_surface_pct,
                moisture_deep_pct,
                temp_surface_c,
                temp_deep_c,
                ambient_temp_c,
                voltage_v,
            ),
            location,
        };
        readings.push(Reading::Moisture(reading));

        let mut metadata = serde_json::Map::new();
        metadata.insert("gateway_id".to_string(), JsonValue::from(gateway_id.clone()));
        sensor_facts.push(SensorFacts {
            id: sensor_id,
            family: SensorFamily::Moisture,
            manufacturer: "M2M".to_string(),
            seen_at: time,
            location,
            metadata,
        });
    }

    // The gateway row is refreshed on every payload, including the
    // sensor-less keep-alive variant, carrying the ambient header fields.
    let gateway_seen_at = readings
        .iter()
        .map(Reading::time)
        .max()
        .or(gateway_time)
        .ok_or_else(|| {
            DecodeError::new(DecodeReason::BadTimestamp, "gateway carries no timestamp")
        })?;

    let mut gw_metadata = serde_json::Map::new();
    if let Some(batt) = parse_vendor_number(wire.gw_batt.as_deref()) {
        gw_metadata.insert("battery_v".to_string(), JsonValue::from(batt));
    }
    if let Some(humid) = parse_vendor_number(wire.amb_humid.as_deref()) {
        gw_metadata.insert("ambient_humidity_pct".to_string(), JsonValue::from(humid));
    }
    if let Some(temp) = parse_vendor_number(wire.amb_temp.as_deref()) {
        gw_metadata.insert("ambient_temp_c".to_string(), JsonValue::from(temp));
    }
    sensor_facts.push(SensorFacts {
        id: gateway_id,
        family: SensorFamily::Gateway,
        manufacturer: "M2M".to_string(),
        seen_at: gateway_seen_at,
        location,
        metadata: gw_metadata,
    });

    Ok(Decoded {
        family: SensorFamily::Moisture,
        readings,
        sensor_facts,
    })
}

fn sensor_time(
    sensor: &MoistureSensorWire,
    gateway_time: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    if let (Some(date), Some(time)) = (sensor.sensor_date.as_deref(), sensor.sensor_utc.as_deref())
    {
        if let Some(ts) = from_vendor_date_time(date, time, true) {
            return Some(ts);
        }
    }
    gateway_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> JsonValue {
        json!({
            "gw_id": "3",
            "gps_lat": "13.94551",
            "gps_lng": "100.73405",
            "gw_batt": "12.22",
            "amb_humid": "65",
            "amb_temp": "31.5",
            "date": "2025/08/01",
            "time": "22:40:00",
            "sensor": [
                {
                    "sensor_id": "13",
                    "sensor_utc": "15:36:34",
                    "sensor_date": "2025/08/01",
                    "humid_hi": "018",
                    "humid_low": "018",
                    "temp_hi": "29.5",
                    "temp_low": "27.0",
                    "amb_humid": "",
                    "amb_temp": "",
                    "flood": "no",
                    "sensor_batt": "3.95"
                },
                {
                    "sensor_id": "13",
                    "sensor_utc": "15:37:41",
                    "sensor_date": "2025/08/01",
                    "humid_hi": "017",
                    "humid_low": "018",
                    "flood": "no",
                    "sensor_batt": "3.95"
                }
            ]
        })
    }

    #[test]
    fn fans_out_one_reading_per_array_entry() {
        let decoded = decode(&sample()).unwrap();
        assert_eq!(decoded.readings.len(), 2);
        assert!(decoded
            .readings
            .iter()
            .all(|r| r.sensor_id() == "MS-00003-00013"));
        let times: Vec<String> = decoded
            .readings
            .iter()
            .map(|r| r.time().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            .collect();
        assert_eq!(times, ["2025-08-01T15:36:34Z", "2025-08-01T15:37:41Z"]);
    }

    #[test]
    fn leading_zero_fields_parse_as_decimal() {
        let decoded = decode(&sample()).unwrap();
        let Reading::Moisture(reading) = &decoded.readings[0] else {
            panic!("expected moisture reading");
        };
        assert_eq!(reading.moisture_surface_pct, Some(18.0));
        assert_eq!(reading.moisture_deep_pct, Some(18.0));
    }

    #[test]
    fn sensor_ambient_falls_back_to_gateway_header() {
        let decoded = decode(&sample()).unwrap();
        let Reading::Moisture(reading) = &decoded.readings[0] else {
            panic!("expected moisture reading");
        };
        assert_eq!(reading.ambient_humidity_pct, Some(65.0));
        assert_eq!(reading.ambient_temp_c, Some(31.5));
    }

    #[test]
    fn gateway_registry_row_is_always_emitted() {
        let decoded = decode(&sample()).unwrap();
        let gateway = decoded
            .sensor_facts
            .iter()
            .find(|f| f.family == SensorFamily::Gateway)
            .expect("gateway facts");
        assert_eq!(gateway.id, "GW-00003");
        assert_eq!(gateway.metadata.get("battery_v"), Some(&json!(12.22)));
    }

    #[test]
    fn sensorless_payload_is_registry_only() {
        let mut value = sample();
        value
            .as_object_mut()
            .unwrap()
            .insert("sensor".to_string(), json!([]));
        let decoded = decode(&value).unwrap();
        assert!(decoded.readings.is_empty());
        assert_eq!(decoded.sensor_facts.len(), 1);
        assert_eq!(decoded.sensor_facts[0].id, "GW-00003");
    }

    #[test]
    fn gateway_clock_is_bangkok_local() {
        let mut value = sample();
        {
            let sensors = value
                .as_object_mut()
                .unwrap()
                .get_mut("sensor")
                .unwrap()
                .as_array_mut()
                .unwrap();
            let entry = sensors[0].as_object_mut().unwrap();
            entry.remove("sensor_utc");
            entry.remove("sensor_date");
            sensors.truncate(1);
        }
        let decoded = decode(&value).unwrap();
        // 22:40 Bangkok == 15:40 UTC.
        assert_eq!(
            decoded.readings[0]
                .time()
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "2025-08-01T15:40:00Z"
        );
    }

    #[test]
    fn flood_flag_is_yes_only() {
        let mut value = sample();
        {
            let sensors = value
                .as_object_mut()
                .unwrap()
                .get_mut("sensor")
                .unwrap()
                .as_array_mut()
                .unwrap();
            sensors[0]
                .as_object_mut()
                .unwrap()
                .insert("flood".to_string(), json!("YES"));
            sensors[1]
                .as_object_mut()
                .unwrap()
                .insert("flood".to_string(), json!("maybe"));
        }
        let decoded = decode(&value).unwrap();
        let floods: Vec<bool> = decoded
            .readings
            .iter()
            .map(|r| match r {
                Reading::Moisture(m) => m.flood,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(floods, [true, false]);
    }

    #[test]
    fn missing_gateway_id_is_missing_identity() {
        let err = decode(&json!({"sensor": []})).unwrap_err();
        assert_eq!(err.reason, DecodeReason::MissingIdentity);
    }
}
