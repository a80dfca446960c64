use super::readings::readings_table;
use super::TsStore;
use crate::model::SensorFamily;
use chrono::{DateTime, Utc};

/// Bucket widths offered by the aggregate API. Buckets are aligned to UTC
/// hour/midnight boundaries (weeks start on the ISO Monday).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Hour,
    Day,
    Week,
}

impl Bucket {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1h" => Some(Bucket::Hour),
            "1d" => Some(Bucket::Day),
            "1w" => Some(Bucket::Week),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Hour => "1h",
            Bucket::Day => "1d",
            Bucket::Week => "1w",
        }
    }

    fn trunc_unit(&self) -> &'static str {
        match self {
            Bucket::Hour => "hour",
            Bucket::Day => "day",
            Bucket::Week => "week",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Agg {
    Min,
    Max,
    Avg,
    Sum,
    Count,
    Stddev,
}

impl Agg {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "min" => Some(Agg::Min),
            "max" => Some(Agg::Max),
            "avg" | "mean" => Some(Agg::Avg),
            "sum" => Some(Agg::Sum),
            "count" => Some(Agg::Count),
            "stddev" => Some(Agg::Stddev),
            _ => None,
        }
    }

    /// Comma-separated multi-agg parameter (`avg,max`).
    pub fn parse_set(raw: &str) -> Result<Vec<Agg>, String> {
        let mut out = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let agg =
                Agg::parse(part).ok_or_else(|| format!("unknown aggregation '{part}'"))?;
            if !out.contains(&agg) {
                out.push(agg);
            }
        }
        if out.is_empty() {
            return Err("no aggregation requested".to_string());
        }
        Ok(out)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Agg::Min => "min",
            Agg::Max => "max",
            Agg::Avg => "avg",
            Agg::Sum => "sum",
            Agg::Count => "count",
            Agg::Stddev => "stddev",
        }
    }
}

/// All supported aggregates are computed per bucket; callers serialize the
/// subset the request asked for.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AggregateBucket {
    pub bucket_start: DateTime<Utc>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub sum: Option<f64>,
    pub stddev: Option<f64>,
    pub count: i64,
}

impl AggregateBucket {
    pub fn value_of(&self, agg: Agg) -> Option<f64> {
        match agg {
            Agg::Min => self.min,
            Agg::Max => self.max,
            Agg::Avg => self.avg,
            Agg::Sum => self.sum,
            Agg::Stddev => self.stddev,
            Agg::Count => Some(self.count as f64),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatsRow {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub sum: Option<f64>,
    pub stddev: Option<f64>,
    pub count: i64,
}

/// Primary measure aggregated for each family.
fn measure_column(family: SensorFamily) -> Option<&'static str> {
    match family {
        SensorFamily::WaterLevel => Some("level_cm"),
        SensorFamily::Moisture => Some("moisture_surface_pct"),
        SensorFamily::Weather => Some("temperature_c"),
        SensorFamily::Gateway => None,
    }
}

impl TsStore {
    pub async fn aggregate(
        &self,
        family: SensorFamily,
        sensor_ids: Option<&[String]>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bucket: Bucket,
    ) -> Result<Vec<AggregateBucket>, sqlx::Error> {
        let (Some(table), Some(column)) = (readings_table(family), measure_column(family)) else {
            return Ok(Vec::new());
        };
        // date_trunc over the UTC projection keeps bucket edges on UTC
        // boundaries regardless of the session time zone.
        let sql = format!(
            r#"
            SELECT
                (date_trunc($4, time AT TIME ZONE 'UTC') AT TIME ZONE 'UTC') AS bucket_start,
                MIN({column}) AS min,
                MAX({column}) AS max,
                AVG({column}) AS avg,
                SUM({column}) AS sum,
                STDDEV({column}) AS stddev,
                COUNT({column}) AS count
            FROM {table}
            WHERE ($1::text[] IS NULL OR sensor_id = ANY($1))
              AND time >= $2 AND time < $3
            GROUP BY bucket_start
            ORDER BY bucket_start ASC
            "#
        );
        sqlx::query_as(&sql)
            .bind(sensor_ids.map(|ids| ids.to_vec()))
            .bind(from)
            .bind(to)
            .bind(bucket.trunc_unit())
            .fetch_all(self.read_pool())
            .await
    }

    pub async fn statistics(
        &self,
        family: SensorFamily,
        sensor_ids: Option<&[String]>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<StatsRow, sqlx::Error> {
        let (Some(table), Some(column)) = (readings_table(family), measure_column(family)) else {
            return Ok(StatsRow {
                min: None,
                max: None,
                avg: None,
                sum: None,
                stddev: None,
                count: 0,
            });
        };
        let sql = format!(
            r#"
            SELECT
                MIN({column}) AS min,
                MAX({column}) AS max,
                AVG({column}) AS avg,
                SUM({column}) AS sum,
                STDDEV({column}) AS stddev,
                COUNT({column}) AS count
            FROM {table}
            WHERE ($1::text[] IS NULL OR sensor_id = ANY($1))
              AND time >= $2 AND time < $3
            "#
        );
        sqlx::query_as(&sql)
            .bind(sensor_ids.map(|ids| ids.to_vec()))
            .bind(from)
            .bind(to)
            .fetch_one(self.read_pool())
            .await
    }

    /// Per-sensor statistics for side-by-side comparison views.
    pub async fn statistics_per_sensor(
        &self,
        family: SensorFamily,
        sensor_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(String, StatsRow)>, sqlx::Error> {
        let (Some(table), Some(column)) = (readings_table(family), measure_column(family)) else {
            return Ok(Vec::new());
        };

        #[derive(sqlx::FromRow)]
        struct PerSensorRow {
            sensor_id: String,
            #[sqlx(flatten)]
            stats: StatsRow,
        }

        let sql = format!(
            r#"
            SELECT
                sensor_id,
                MIN({column}) AS min,
                MAX({column}) AS max,
                AVG({column}) AS avg,
                SUM({column}) AS sum,
                STDDEV({column}) AS stddev,
                COUNT({column}) AS count
            FROM {table}
            WHERE sensor_id = ANY($1) AND time >= $2 AND time < $3
            GROUP BY sensor_id
            ORDER BY sensor_id ASC
            "#
        );
        let rows: Vec<PerSensorRow> = sqlx::query_as(&sql)
            .bind(sensor_ids.to_vec())
            .bind(from)
            .bind(to)
            .fetch_all(self.read_pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.sensor_id, row.stats))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_and_agg_parsing() {
        assert_eq!(Bucket::parse("1h"), Some(Bucket::Hour));
        assert_eq!(Bucket::parse("1w"), Some(Bucket::Week));
        assert_eq!(Bucket::parse("5m"), None);
        assert_eq!(Agg::parse("stddev"), Some(Agg::Stddev));
        assert_eq!(Agg::parse("median"), None);
    }

    #[test]
    fn multi_agg_sets_dedupe_and_validate() {
        let set = Agg::parse_set("avg,max,avg").unwrap();
        assert_eq!(set, vec![Agg::Avg, Agg::Max]);
        assert!(Agg::parse_set("avg,percentile").is_err());
        assert!(Agg::parse_set("").is_err());
    }
}
