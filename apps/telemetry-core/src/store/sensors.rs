use super::TsStore;
use crate::model::{LatLng, Sensor, SensorFacts, SensorFamily};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::types::Json as SqlJson;

/// Sensors never cease to exist; staleness is computed at read time.
const STALE_AFTER_HOURS: i64 = 24;

pub fn sensor_active(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - last_seen <= Duration::hours(STALE_AFTER_HOURS)
}

#[derive(Debug, Clone)]
pub struct SensorPage {
    pub sensors: Vec<Sensor>,
    pub total: i64,
}

#[derive(Debug, Clone)]
pub struct NearbySensor {
    pub sensor: Sensor,
    pub distance_km: f64,
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    id: String,
    family: String,
    manufacturer: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    lat: Option<f64>,
    lng: Option<f64>,
    metadata: SqlJson<JsonValue>,
}

impl SensorRow {
    fn into_sensor(self) -> Option<Sensor> {
        let Some(family) = SensorFamily::parse(&self.family) else {
            tracing::warn!(sensor_id = %self.id, family = %self.family, "unknown sensor family in registry");
            return None;
        };
        let location = match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(LatLng { lat, lng }),
            _ => None,
        };
        let metadata = match self.metadata.0 {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        Some(Sensor {
            id: self.id,
            family,
            manufacturer: self.manufacturer,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            location,
            metadata,
        })
    }
}

const SENSOR_COLS: &str = "id, family, manufacturer, first_seen, last_seen, lat, lng, metadata";

impl TsStore {
    /// Idempotent registry upsert. Metadata merge is a shallow map merge
    /// where incoming keys win; `last_seen` is monotone; coordinates are
    /// only seeded here, never moved (drift handling owns movement).
    pub async fn upsert_sensor(&self, facts: &SensorFacts) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO sensors (id, family, manufacturer, first_seen, last_seen, lat, lng, metadata)
            VALUES ($1, $2, $3, $4, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                manufacturer = CASE
                    WHEN EXCLUDED.manufacturer <> '' THEN EXCLUDED.manufacturer
                    ELSE sensors.manufacturer
                END,
                last_seen = GREATEST(sensors.last_seen, EXCLUDED.last_seen),
                lat = COALESCE(sensors.lat, EXCLUDED.lat),
                lng = COALESCE(sensors.lng, EXCLUDED.lng),
                metadata = sensors.metadata || EXCLUDED.metadata
            "#,
        )
        .bind(&facts.id)
        .bind(facts.family.as_str())
        .bind(&facts.manufacturer)
        .bind(facts.seen_at)
        .bind(facts.location.map(|l| l.lat))
        .bind(facts.location.map(|l| l.lng))
        .bind(SqlJson(JsonValue::Object(facts.metadata.clone())))
        .execute(self.write_pool())
        .await?;
        Ok(())
    }

    pub async fn get_sensor(&self, id: &str) -> Result<Option<Sensor>, sqlx::Error> {
        let row: Option<SensorRow> =
            sqlx::query_as(&format!("SELECT {SENSOR_COLS} FROM sensors WHERE id = $1"))
                .bind(id.trim())
                .fetch_optional(self.read_pool())
                .await?;
        Ok(row.and_then(SensorRow::into_sensor))
    }

    pub async fn list_sensors(
        &self,
        families: Option<&[SensorFamily]>,
        zones: Option<&[String]>,
        page: usize,
        limit: usize,
    ) -> Result<SensorPage, sqlx::Error> {
        let families: Option<Vec<String>> =
            families.map(|fs| fs.iter().map(|f| f.as_str().to_string()).collect());
        let zones = zones.map(|z| z.to_vec());
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sensors
            WHERE ($1::text[] IS NULL OR family = ANY($1))
              AND ($2::text[] IS NULL OR metadata->>'zone' = ANY($2))
            "#,
        )
        .bind(families.clone())
        .bind(zones.clone())
        .fetch_one(self.read_pool())
        .await?;

        let offset = page.saturating_sub(1).saturating_mul(limit) as i64;
        let rows: Vec<SensorRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SENSOR_COLS} FROM sensors
            WHERE ($1::text[] IS NULL OR family = ANY($1))
              AND ($2::text[] IS NULL OR metadata->>'zone' = ANY($2))
            ORDER BY id ASC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(families)
        .bind(zones)
        .bind(limit as i64)
        .bind(offset)
        .fetch_all(self.read_pool())
        .await?;

        Ok(SensorPage {
            sensors: rows.into_iter().filter_map(SensorRow::into_sensor).collect(),
            total,
        })
    }

    pub async fn patch_sensor_metadata(
        &self,
        id: &str,
        delta: &Map<String, JsonValue>,
    ) -> Result<Option<Sensor>, sqlx::Error> {
        let row: Option<SensorRow> = sqlx::query_as(&format!(
            r#"
            UPDATE sensors
            SET metadata = metadata || $2
            WHERE id = $1
            RETURNING {SENSOR_COLS}
            "#
        ))
        .bind(id.trim())
        .bind(SqlJson(JsonValue::Object(delta.clone())))
        .fetch_optional(self.write_pool())
        .await?;
        Ok(row.and_then(SensorRow::into_sensor))
    }

    /// Applies a confirmed location movement: history row plus in-place
    /// update, atomically.
    pub async fn record_sensor_location(
        &self,
        id: &str,
        location: LatLng,
        observed_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.write_pool().begin().await?;
        sqlx::query(
            "INSERT INTO sensor_location_history (sensor_id, ts, lat, lng) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(observed_at)
        .bind(location.lat)
        .bind(location.lng)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE sensors SET lat = $2, lng = $3 WHERE id = $1")
            .bind(id)
            .bind(location.lat)
            .bind(location.lng)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Haversine radius query, distance in kilometers.
    pub async fn nearby_sensors(
        &self,
        center: LatLng,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<NearbySensor>, sqlx::Error> {
        #[derive(sqlx::FromRow)]
        struct NearbyRow {
            #[sqlx(flatten)]
            sensor: SensorRow,
            distance_km: f64,
        }

        let rows: Vec<NearbyRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SENSOR_COLS}, distance_km FROM (
                SELECT *,
                    6371.0 * 2.0 * asin(sqrt(
                        pow(sin(radians(lat - $1) / 2), 2) +
                        cos(radians($1)) * cos(radians(lat)) *
                        pow(sin(radians(lng - $2) / 2), 2)
                    )) AS distance_km
                FROM sensors
                WHERE lat IS NOT NULL AND lng IS NOT NULL
            ) candidates
            WHERE distance_km <= $3
            ORDER BY distance_km ASC
            LIMIT $4
            "#
        ))
        .bind(center.lat)
        .bind(center.lng)
        .bind(radius_km)
        .bind(limit as i64)
        .fetch_all(self.read_pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let distance_km = row.distance_km;
                row.sensor
                    .into_sensor()
                    .map(|sensor| NearbySensor {
                        sensor,
                        distance_km,
                    })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_is_a_view_over_last_seen() {
        let now = Utc::now();
        assert!(sensor_active(now - Duration::hours(23), now));
        assert!(!sensor_active(now - Duration::hours(25), now));
    }
}
