/// Quality scoring: start from 1.0, subtract per failed sanity check,
/// clamp to [0, 1]. Deterministic over the reading's own fields.
const MOISTURE_RANGE_PENALTY: f64 = 0.2;
const TEMPERATURE_RANGE_PENALTY: f64 = 0.1;
const LOW_BATTERY_PENALTY: f64 = 0.2;

const MOISTURE_PCT_RANGE: (f64, f64) = (0.0, 100.0);
const TEMPERATURE_C_RANGE: (f64, f64) = (-10.0, 60.0);

/// Sensor supply thresholds under which readings are suspect.
const WATER_LEVEL_MIN_VOLTAGE_V: f64 = 3.3;
const MOISTURE_MIN_BATTERY_V: f64 = 3.0;
const WEATHER_MIN_BATTERY_V: f64 = 11.0;

fn clamp01(q: f64) -> f64 {
    q.clamp(0.0, 1.0)
}

fn out_of_range(value: Option<f64>, range: (f64, f64)) -> bool {
    matches!(value, Some(v) if v < range.0 || v > range.1)
}

pub fn water_level_quality(voltage_v: f64, temperature_c: Option<f64>) -> f64 {
    let mut q = 1.0;
    if voltage_v < WATER_LEVEL_MIN_VOLTAGE_V {
        q -= LOW_BATTERY_PENALTY;
    }
    if out_of_range(temperature_c, TEMPERATURE_C_RANGE) {
        q -= TEMPERATURE_RANGE_PENALTY;
    }
    clamp01(q)
}

#[allow(clippy::too_many_arguments)]
pub fn moisture_quality(
    moisture_surface_pct: Option<f64>,
    moisture_deep_pct: Option<f64>,
    temp_surface_c: Option<f64>,
    temp_deep_c: Option<f64>,
    ambient_temp_c: Option<f64>,
    voltage_v: Option<f64>,
) -> f64 {
    let mut q = 1.0;
    for moisture in [moisture_surface_pct, moisture_deep_pct] {
        if out_of_range(moisture, MOISTURE_PCT_RANGE) {
            q -= MOISTURE_RANGE_PENALTY;
        }
    }
    for temp in [temp_surface_c, temp_deep_c, ambient_temp_c] {
        if out_of_range(temp, TEMPERATURE_C_RANGE) {
            q -= TEMPERATURE_RANGE_PENALTY;
        }
    }
    if matches!(voltage_v, Some(v) if v < MOISTURE_MIN_BATTERY_V) {
        q -= LOW_BATTERY_PENALTY;
    }
    clamp01(q)
}

pub fn weather_quality(temperature_c: Option<f64>, battery_v: Option<f64>) -> f64 {
    let mut q = 1.0;
    if out_of_range(temperature_c, TEMPERATURE_C_RANGE) {
        q -= TEMPERATURE_RANGE_PENALTY;
    }
    if matches!(battery_v, Some(v) if v < WEATHER_MIN_BATTERY_V) {
        q -= LOW_BATTERY_PENALTY;
    }
    clamp01(q)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pristine_moisture_reading_scores_one() {
        let q = moisture_quality(
            Some(18.0),
            Some(18.0),
            Some(29.5),
            Some(27.0),
            Some(31.0),
            Some(3.95),
        );
        assert_eq!(q, 1.0);
    }

    #[test]
    fn each_out_of_range_moisture_field_costs_two_tenths() {
        let q = moisture_quality(Some(140.0), Some(-3.0), None, None, None, None);
        assert!((q - 0.6).abs() < 1e-9);
    }

    #[test]
    fn temperature_excursions_cost_one_tenth_each() {
        let q = moisture_quality(None, None, Some(75.0), Some(-20.0), Some(30.0), None);
        assert!((q - 0.8).abs() < 1e-9);
    }

    #[test]
    fn quality_never_leaves_the_unit_interval() {
        let q = moisture_quality(
            Some(500.0),
            Some(-500.0),
            Some(500.0),
            Some(-500.0),
            Some(500.0),
            Some(0.1),
        );
        assert_eq!(q, 0.0);
        assert_eq!(water_level_quality(12.0, None), 1.0);
    }

    #[test]
    fn absent_fields_are_not_penalized() {
        assert_eq!(moisture_quality(None, None, None, None, None, None), 1.0);
        assert_eq!(weather_quality(None, None), 1.0);
    }

    #[test]
    fn weather_battery_threshold_applies() {
        assert!((weather_quality(Some(30.0), Some(10.2)) - 0.8).abs() < 1e-9);
    }
}
