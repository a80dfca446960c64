use crate::model::Reading;
use serde_json::{json, Value as JsonValue};

const WATER_HIGH_CM: f64 = 25.0;
const WATER_LOW_CM: f64 = 5.0;
const MOISTURE_LOW_PCT: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub severity: &'static str,
    pub kind: &'static str,
    pub payload: JsonValue,
}

impl Alert {
    pub fn topic(&self) -> String {
        format!("alerts/{}/{}", self.severity, self.kind)
    }
}

/// Threshold alerts derived synchronously from a freshly written reading,
/// ahead of the real-time publish.
pub fn derive(reading: &Reading) -> Vec<Alert> {
    let mut alerts = Vec::new();
    match reading {
        Reading::WaterLevel(r) => {
            if r.level_cm > WATER_HIGH_CM {
                alerts.push(Alert {
                    severity: "critical",
                    kind: "water_high",
                    payload: json!({
                        "sensor_id": r.sensor_id,
                        "level_cm": r.level_cm,
                        "threshold_cm": WATER_HIGH_CM,
                        "time": r.time.to_rfc3339(),
                    }),
                });
            } else if r.level_cm < WATER_LOW_CM {
                alerts.push(Alert {
                    severity: "warning",
                    kind: "water_low",
                    payload: json!({
                        "sensor_id": r.sensor_id,
                        "level_cm": r.level_cm,
                        "threshold_cm": WATER_LOW_CM,
                        "time": r.time.to_rfc3339(),
                    }),
                });
            }
        }
        Reading::Moisture(r) => {
            if matches!(r.moisture_surface_pct, Some(pct) if pct < MOISTURE_LOW_PCT) {
                alerts.push(Alert {
                    severity: "warning",
                    kind: "moisture_low",
                    payload: json!({
                        "sensor_id": r.sensor_id,
                        "moisture_surface_pct": r.moisture_surface_pct,
                        "threshold_pct": MOISTURE_LOW_PCT,
                        "time": r.time.to_rfc3339(),
                    }),
                });
            }
            if r.flood {
                alerts.push(Alert {
                    severity: "critical",
                    kind: "flood",
                    payload: json!({
                        "sensor_id": r.sensor_id,
                        "time": r.time.to_rfc3339(),
                    }),
                });
            }
        }
        Reading::Weather(_) => {}
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::model::{MoistureReading, WaterLevelReading};

    fn water_level(level_cm: f64) -> Reading {
        Reading::WaterLevel(WaterLevelReading {
            time: Utc::now(),
            sensor_id: "WL-1A2B3C4D5E6F".to_string(),
            level_cm,
            voltage_v: 4.2,
            rssi_dbm: -60,
            temperature_c: None,
            quality: 1.0,
            location: None,
        })
    }

    fn moisture(surface: Option<f64>, flood: bool) -> Reading {
        Reading::Moisture(MoistureReading {
            time: Utc::now(),
            sensor_id: "MS-00003-00013".to_string(),
            moisture_surface_pct: surface,
            moisture_deep_pct: None,
            temp_surface_c: None,
            temp_deep_c: None,
            ambient_humidity_pct: None,
            ambient_temp_c: None,
            flood,
            voltage_v: None,
            quality: 1.0,
            location: None,
        })
    }

    #[test]
    fn high_water_is_critical() {
        let alerts = derive(&water_level(31.0));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].topic(), "alerts/critical/water_high");
    }

    #[test]
    fn low_water_is_a_warning() {
        let alerts = derive(&water_level(2.5));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].topic(), "alerts/warning/water_low");
    }

    #[test]
    fn nominal_water_raises_nothing() {
        assert!(derive(&water_level(15.0)).is_empty());
    }

    #[test]
    fn flood_and_dry_soil_can_coexist() {
        let alerts = derive(&moisture(Some(12.0), true));
        let topics: Vec<String> = alerts.iter().map(Alert::topic).collect();
        assert_eq!(
            topics,
            vec!["alerts/warning/moisture_low", "alerts/critical/flood"]
        );
    }

    #[test]
    fn absent_moisture_value_is_not_a_low_alert() {
        assert!(derive(&moisture(None, false)).is_empty());
    }
}
