use super::TsStore;
use crate::model::{
    LatLng, MoistureReading, Reading, SensorFamily, WaterLevelReading, WeatherReading,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

pub const MAX_SERIES_ROWS: usize = 10_000;

/// Non-error outcome of a reading insert. A `Duplicate` means the
/// `(sensor_id, time)` key already exists; the caller counts it and moves
/// on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct SeriesPage {
    pub readings: Vec<Reading>,
    pub truncated: bool,
    pub next_cursor: Option<String>,
}

#[derive(sqlx::FromRow)]
struct WaterLevelRow {
    time: DateTime<Utc>,
    sensor_id: String,
    level_cm: f64,
    voltage_v: f64,
    rssi_dbm: i32,
    temperature_c: Option<f64>,
    quality: f64,
    lat: Option<f64>,
    lng: Option<f64>,
}

impl From<WaterLevelRow> for Reading {
    fn from(row: WaterLevelRow) -> Self {
        Reading::WaterLevel(WaterLevelReading {
            time: row.time,
            sensor_id: row.sensor_id,
            level_cm: row.level_cm,
            voltage_v: row.voltage_v,
            rssi_dbm: row.rssi_dbm,
            temperature_c: row.temperature_c,
            quality: row.quality,
            location: latlng(row.lat, row.lng),
        })
    }
}

#[derive(sqlx::FromRow)]
struct MoistureRow {
    time: DateTime<Utc>,
    sensor_id: String,
    moisture_surface_pct: Option<f64>,
    moisture_deep_pct: Option<f64>,
    temp_surface_c: Option<f64>,
    temp_deep_c: Option<f64>,
    ambient_humidity_pct: Option<f64>,
    ambient_temp_c: Option<f64>,
    flood: bool,
    voltage_v: Option<f64>,
    quality: f64,
    lat: Option<f64>,
    lng: Option<f64>,
}

impl From<MoistureRow> for Reading {
    fn from(row: MoistureRow) -> Self {
        Reading::Moisture(MoistureReading {
            time: row.time,
            sensor_id: row.sensor_id,
            moisture_surface_pct: row.moisture_surface_pct,
            moisture_deep_pct: row.moisture_deep_pct,
            temp_surface_c: row.temp_surface_c,
            temp_deep_c: row.temp_deep_c,
            ambient_humidity_pct: row.ambient_humidity_pct,
            ambient_temp_c: row.ambient_temp_c,
            flood: row.flood,
            voltage_v: row.voltage_v,
            quality: row.quality,
            location: latlng(row.lat, row.lng),
        })
    }
}

#[derive(sqlx::FromRow)]
struct WeatherRow {
    time: DateTime<Utc>,
    sensor_id: String,
    rainfall_mm: Option<f64>,
    temperature_c: Option<f64>,
    humidity_pct: Option<f64>,
    wind_speed_ms: Option<f64>,
    wind_max_ms: Option<f64>,
    wind_dir_deg: Option<f64>,
    solar_radiation_wm2: Option<f64>,
    battery_v: Option<f64>,
    pressure_hpa: Option<f64>,
    quality: f64,
}

impl From<WeatherRow> for Reading {
    fn from(row: WeatherRow) -> Self {
        Reading::Weather(WeatherReading {
            time: row.time,
            sensor_id: row.sensor_id,
            rainfall_mm: row.rainfall_mm,
            temperature_c: row.temperature_c,
            humidity_pct: row.humidity_pct,
            wind_speed_ms: row.wind_speed_ms,
            wind_max_ms: row.wind_max_ms,
            wind_dir_deg: row.wind_dir_deg,
            solar_radiation_wm2: row.solar_radiation_wm2,
            battery_v: row.battery_v,
            pressure_hpa: row.pressure_hpa,
            quality: row.quality,
        })
    }
}

fn latlng(lat: Option<f64>, lng: Option<f64>) -> Option<LatLng> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(LatLng { lat, lng }),
        _ => None,
    }
}

const WATER_LEVEL_COLS: &str =
    "time, sensor_id, level_cm, voltage_v, rssi_dbm, temperature_c, quality, lat, lng";
const MOISTURE_COLS: &str = "time, sensor_id, moisture_surface_pct, moisture_deep_pct, \
     temp_surface_c, temp_deep_c, ambient_humidity_pct, ambient_temp_c, flood, voltage_v, \
     quality, lat, lng";
const WEATHER_COLS: &str = "time, sensor_id, rainfall_mm, temperature_c, humidity_pct, \
     wind_speed_ms, wind_max_ms, wind_dir_deg, solar_radiation_wm2, battery_v, pressure_hpa, \
     quality";

pub(super) fn readings_table(family: SensorFamily) -> Option<&'static str> {
    match family {
        SensorFamily::WaterLevel => Some("water_level_readings"),
        SensorFamily::Moisture => Some("moisture_readings"),
        SensorFamily::Weather => Some("weather_readings"),
        SensorFamily::Gateway => None,
    }
}

impl TsStore {
    /// Writes one canonical reading. The registry row is touched inside
    /// the same transaction so readers never observe an orphan reading.
    pub async fn write_reading(&self, reading: &Reading) -> Result<WriteOutcome, sqlx::Error> {
        let mut tx = self.write_pool().begin().await?;
        touch_sensor(&mut tx, reading).await?;
        let outcome = insert_reading(&mut tx, reading).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// One newest reading per matching sensor, newest first.
    pub async fn latest(
        &self,
        family: SensorFamily,
        sensor_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Reading>, sqlx::Error> {
        let Some(table) = readings_table(family) else {
            return Ok(Vec::new());
        };
        let cols = family_cols(family);
        let sql = format!(
            "SELECT DISTINCT ON (sensor_id) {cols} FROM {table} \
             WHERE ($1::text[] IS NULL OR sensor_id = ANY($1)) \
             ORDER BY sensor_id, time DESC"
        );
        let ids = sensor_ids.map(|ids| ids.to_vec());
        let mut readings = fetch_family(self.read_pool(), family, &sql, ids, None, None, None).await?;
        readings.sort_by(|a, b| b.time().cmp(&a.time()));
        readings.truncate(limit);
        Ok(readings)
    }

    /// Ascending time window, capped at [`MAX_SERIES_ROWS`]; a cursor is
    /// returned when the cap truncates the window.
    pub async fn series(
        &self,
        family: SensorFamily,
        sensor_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<SeriesPage, sqlx::Error> {
        let Some(table) = readings_table(family) else {
            return Ok(SeriesPage {
                readings: Vec::new(),
                truncated: false,
                next_cursor: None,
            });
        };
        let capped = limit.clamp(1, MAX_SERIES_ROWS);
        let cols = family_cols(family);
        let sql = format!(
            "SELECT {cols} FROM {table} \
             WHERE sensor_id = ANY($1) AND time >= $2 AND time < $3 \
             ORDER BY time ASC LIMIT $4"
        );
        // Fetch one extra row to detect truncation without a second query.
        let mut readings = fetch_family(
            self.read_pool(),
            family,
            &sql,
            Some(sensor_ids.to_vec()),
            Some(from),
            Some(to),
            Some((capped + 1) as i64),
        )
        .await?;

        let truncated = readings.len() > capped;
        readings.truncate(capped);
        let next_cursor = if truncated {
            readings.last().map(|r| r.time().to_rfc3339())
        } else {
            None
        };
        Ok(SeriesPage {
            readings,
            truncated,
            next_cursor,
        })
    }

    /// Batched conflict-tolerant insert used by the dual-write path.
    /// Returns the number of rows actually written.
    pub async fn write_readings_batch(&self, readings: &[Reading]) -> Result<u64, sqlx::Error> {
        let mut written = 0;
        for family in [
            SensorFamily::WaterLevel,
            SensorFamily::Moisture,
            SensorFamily::Weather,
        ] {
            let batch: Vec<&Reading> = readings
                .iter()
                .filter(|r| r.family() == family)
                .collect();
            if batch.is_empty() {
                continue;
            }
            written += insert_batch(self.write_pool(), family, &batch).await?;
        }
        Ok(written)
    }
}

fn family_cols(family: SensorFamily) -> &'static str {
    match family {
        SensorFamily::WaterLevel => WATER_LEVEL_COLS,
        SensorFamily::Moisture => MOISTURE_COLS,
        SensorFamily::Weather => WEATHER_COLS,
        SensorFamily::Gateway => "",
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_family(
    pool: &PgPool,
    family: SensorFamily,
    sql: &str,
    sensor_ids: Option<Vec<String>>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<i64>,
) -> Result<Vec<Reading>, sqlx::Error> {
    macro_rules! run {
        ($row:ty) => {{
            let mut query = sqlx::query_as::<_, $row>(sql).bind(sensor_ids);
            if let Some(from) = from {
                query = query.bind(from);
            }
            if let Some(to) = to {
                query = query.bind(to);
            }
            if let Some(limit) = limit {
                query = query.bind(limit);
            }
            query
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(Reading::from)
                .collect()
        }};
    }

    let readings: Vec<Reading> = match family {
        SensorFamily::WaterLevel => run!(WaterLevelRow),
        SensorFamily::Moisture => run!(MoistureRow),
        SensorFamily::Weather => run!(WeatherRow),
        SensorFamily::Gateway => Vec::new(),
    };
    Ok(readings)
}

async fn touch_sensor(
    tx: &mut Transaction<'_, Postgres>,
    reading: &Reading,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sensors (id, family, first_seen, last_seen)
        VALUES ($1, $2, $3, $3)
        ON CONFLICT (id) DO UPDATE
        SET last_seen = GREATEST(sensors.last_seen, EXCLUDED.last_seen)
        "#,
    )
    .bind(reading.sensor_id())
    .bind(reading.family().as_str())
    .bind(reading.time())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_reading(
    tx: &mut Transaction<'_, Postgres>,
    reading: &Reading,
) -> Result<WriteOutcome, sqlx::Error> {
    let result = match reading {
        Reading::WaterLevel(r) => {
            sqlx::query(
                r#"
                INSERT INTO water_level_readings
                    (time, sensor_id, level_cm, voltage_v, rssi_dbm, temperature_c, quality, lat, lng)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (sensor_id, time) DO NOTHING
                "#,
            )
            .bind(r.time)
            .bind(&r.sensor_id)
            .bind(r.level_cm)
            .bind(r.voltage_v)
            .bind(r.rssi_dbm)
            .bind(r.temperature_c)
            .bind(r.quality)
            .bind(r.location.map(|l| l.lat))
            .bind(r.location.map(|l| l.lng))
            .execute(&mut **tx)
            .await?
        }
        Reading::Moisture(r) => {
            sqlx::query(
                r#"
                INSERT INTO moisture_readings
                    (time, sensor_id, moisture_surface_pct, moisture_deep_pct, temp_surface_c,
                     temp_deep_c, ambient_humidity_pct, ambient_temp_c, flood, voltage_v,
                     quality, lat, lng)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (sensor_id, time) DO NOTHING
                "#,
            )
            .bind(r.time)
            .bind(&r.sensor_id)
            .bind(r.moisture_surface_pct)
            .bind(r.moisture_deep_pct)
            .bind(r.temp_surface_c)
            .bind(r.temp_deep_c)
            .bind(r.ambient_humidity_pct)
            .bind(r.ambient_temp_c)
            .bind(r.flood)
            .bind(r.voltage_v)
            .bind(r.quality)
            .bind(r.location.map(|l| l.lat))
            .bind(r.location.map(|l| l.lng))
            .execute(&mut **tx)
            .await?
        }
        Reading::Weather(r) => {
            sqlx::query(
                r#"
                INSERT INTO weather_readings
                    (time, sensor_id, rainfall_mm, temperature_c, humidity_pct, wind_speed_ms,
                     wind_max_ms, wind_dir_deg, solar_radiation_wm2, battery_v, pressure_hpa,
                     quality)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (sensor_id, time) DO NOTHING
                "#,
            )
            .bind(r.time)
            .bind(&r.sensor_id)
            .bind(r.rainfall_mm)
            .bind(r.temperature_c)
            .bind(r.humidity_pct)
            .bind(r.wind_speed_ms)
            .bind(r.wind_max_ms)
            .bind(r.wind_dir_deg)
            .bind(r.solar_radiation_wm2)
            .bind(r.battery_v)
            .bind(r.pressure_hpa)
            .bind(r.quality)
            .execute(&mut **tx)
            .await?
        }
    };

    if result.rows_affected() == 0 {
        Ok(WriteOutcome::Duplicate)
    } else {
        Ok(WriteOutcome::Written)
    }
}

async fn insert_batch(
    pool: &PgPool,
    family: SensorFamily,
    batch: &[&Reading],
) -> Result<u64, sqlx::Error> {
    let mut builder: QueryBuilder<Postgres> = match family {
        SensorFamily::WaterLevel => {
            let mut b = QueryBuilder::new(
                "INSERT INTO water_level_readings \
                 (time, sensor_id, level_cm, voltage_v, rssi_dbm, temperature_c, quality, lat, lng) ",
            );
            b.push_values(batch.iter(), |mut row, reading| {
                let Reading::WaterLevel(r) = reading else {
                    return;
                };
                row.push_bind(r.time)
                    .push_bind(&r.sensor_id)
                    .push_bind(r.level_cm)
                    .push_bind(r.voltage_v)
                    .push_bind(r.rssi_dbm)
                    .push_bind(r.temperature_c)
                    .push_bind(r.quality)
                    .push_bind(r.location.map(|l| l.lat))
                    .push_bind(r.location.map(|l| l.lng));
            });
            b
        }
        SensorFamily::Moisture => {
            let mut b = QueryBuilder::new(
                "INSERT INTO moisture_readings \
                 (time, sensor_id, moisture_surface_pct, moisture_deep_pct, temp_surface_c, \
                  temp_deep_c, ambient_humidity_pct, ambient_temp_c, flood, voltage_v, quality, \
                  lat, lng) ",
            );
            b.push_values(batch.iter(), |mut row, reading| {
                let Reading::Moisture(r) = reading else {
                    return;
                };
                row.push_bind(r.time)
                    .push_bind(&r.sensor_id)
                    .push_bind(r.moisture_surface_pct)
                    .push_bind(r.moisture_deep_pct)
                    .push_bind(r.temp_surface_c)
                    .push_bind(r.temp_deep_c)
                    .push_bind(r.ambient_humidity_pct)
                    .push_bind(r.ambient_temp_c)
                    .push_bind(r.flood)
                    .push_bind(r.voltage_v)
                    .push_bind(r.quality)
                    .push_bind(r.location.map(|l| l.lat))
                    .push_bind(r.location.map(|l| l.lng));
            });
            b
        }
        SensorFamily::Weather => {
            let mut b = QueryBuilder::new(
                "INSERT INTO weather_readings \
                 (time, sensor_id, rainfall_mm, temperature_c, humidity_pct, wind_speed_ms, \
                  wind_max_ms, wind_dir_deg, solar_radiation_wm2, battery_v, pressure_hpa, \
                  quality) ",
            );
            b.push_values(batch.iter(), |mut row, reading| {
                let Reading::Weather(r) = reading else {
                    return;
                };
                row.push_bind(r.time)
                    .push_bind(&r.sensor_id)
                    .push_bind(r.rainfall_mm)
                    .push_bind(r.temperature_c)
                    .push_bind(r.humidity_pct)
                    .push_bind(r.wind_speed_ms)
                    .push_bind(r.wind_max_ms)
                    .push_bind(r.wind_dir_deg)
                    .push_bind(r.solar_radiation_wm2)
                    .push_bind(r.battery_v)
                    .push_bind(r.pressure_hpa)
                    .push_bind(r.quality);
            });
            b
        }
        SensorFamily::Gateway => return Ok(0),
    };
    builder.push(" ON CONFLICT (sensor_id, time) DO NOTHING");
    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}
