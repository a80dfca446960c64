use super::{quality, Decoded};
use crate::error::{DecodeError, DecodeReason};
use crate::model::{weather_sensor_id, Reading, SensorFacts, SensorFamily, WeatherReading};
use crate::time::from_vendor_date_time;
use serde_json::Value as JsonValue;

/// SCADA row feed: one JSON object per station row, numeric columns keyed
/// by the historian's tag names. The mapping is static; unknown columns
/// are ignored.
#[derive(Debug, Clone, Copy)]
enum Column {
    Rainfall,
    Temperature,
    Humidity,
    WindSpeed,
    WindMax,
    WindDir,
    Solar,
    Battery,
    Pressure,
}

const COLUMN_MAP: &[(&str, Column)] = &[
    ("Rain_mm", Column::Rainfall),
    ("Temp_C", Column::Temperature),
    ("RH_pct", Column::Humidity),
    ("WS_ms", Column::WindSpeed),
    ("WS_max_ms", Column::WindMax),
    ("WD_deg", Column::WindDir),
    ("Solar_Wm2", Column::Solar),
    ("Batt_V", Column::Battery),
    ("Press_hPa", Column::Pressure),
];

pub(super) fn decode(value: &JsonValue) -> Result<Decoded, DecodeError> {
    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::new(DecodeReason::ShapeMismatch, "expected a row object"))?;

    let station = obj
        .get("station")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| DecodeError::new(DecodeReason::MissingIdentity, "station missing"))?;
    let sensor_id = weather_sensor_id(station as u32);

    let (date, time_of_day) = obj
        .get("datetime")
        .and_then(|v| v.as_str())
        .and_then(|v| v.trim().split_once(' '))
        .ok_or_else(|| DecodeError::new(DecodeReason::BadTimestamp, "datetime missing"))?;
    let time = from_vendor_date_time(date, time_of_day, false).ok_or_else(|| {
        DecodeError::new(
            DecodeReason::BadTimestamp,
            format!("unparseable datetime '{date} {time_of_day}'"),
        )
    })?;

    let mut reading = WeatherReading {
        time,
        sensor_id: sensor_id.clone(),
        rainfall_mm: None,
        temperature_c: None,
        humidity_pct: None,
        wind_speed_ms: None,
        wind_max_ms: None,
        wind_dir_deg: None,
        solar_radiation_wm2: None,
        battery_v: None,
        pressure_hpa: None,
        quality: 1.0,
    };

    for (key, column) in COLUMN_MAP {
        let value = obj.get(*key).and_then(JsonValue::as_f64);
        match column {
            Column::Rainfall => reading.rainfall_mm = value,
            Column::Temperature => reading.temperature_c = value,
            Column::Humidity => reading.humidity_pct = value,
            Column::WindSpeed => reading.wind_speed_ms = value,
            Column::WindMax => reading.wind_max_ms = value,
            Column::WindDir => reading.wind_dir_deg = value,
            Column::Solar => reading.solar_radiation_wm2 = value,
            Column::Battery => reading.battery_v = value,
            Column::Pressure => reading.pressure_hpa = value,
        }
    }
    reading.quality = quality::weather_quality(reading.temperature_c, reading.battery_v);

    let mut metadata = serde_json::Map::new();
    metadata.insert("station".to_string(), JsonValue::from(station));
    let facts = SensorFacts {
        id: sensor_id,
        family: SensorFamily::Weather,
        manufacturer: "AOS".to_string(),
        seen_at: time,
        location: None,
        metadata,
    };

    Ok(Decoded {
        family: SensorFamily::Weather,
        readings: vec![Reading::Weather(reading)],
        sensor_facts: vec![facts],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> JsonValue {
        json!({
            "station": 12,
            "datetime": "2025/08/01 15:00:00",
            "Rain_mm": 0.4,
            "Temp_C": 31.2,
            "RH_pct": 68.0,
            "WS_ms": 2.1,
            "WS_max_ms": 4.8,
            "WD_deg": 230.0,
            "Solar_Wm2": 812.0,
            "Batt_V": 12.6,
            "Press_hPa": 1008.2
        })
    }

    #[test]
    fn maps_the_static_column_set() {
        let decoded = decode(&sample()).unwrap();
        let Reading::Weather(reading) = &decoded.readings[0] else {
            panic!("expected weather reading");
        };
        assert_eq!(reading.sensor_id, "AOS-12");
        assert_eq!(reading.rainfall_mm, Some(0.4));
        assert_eq!(reading.wind_dir_deg, Some(230.0));
        assert_eq!(reading.pressure_hpa, Some(1008.2));
        // Station clocks are Bangkok local.
        assert_eq!(
            reading
                .time
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "2025-08-01T08:00:00Z"
        );
        assert_eq!(reading.quality, 1.0);
    }

    #[test]
    fn absent_columns_stay_null() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("Press_hPa");
        let decoded = decode(&value).unwrap();
        let Reading::Weather(reading) = &decoded.readings[0] else {
            panic!("expected weather reading");
        };
        assert_eq!(reading.pressure_hpa, None);
    }

    #[test]
    fn missing_station_is_missing_identity() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("station");
        let err = decode(&value).unwrap_err();
        assert_eq!(err.reason, DecodeReason::MissingIdentity);
    }
}
