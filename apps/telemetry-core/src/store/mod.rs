mod aggregate;
mod readings;
mod schema;
mod sensors;

pub use aggregate::{Agg, AggregateBucket, Bucket, StatsRow};
pub use readings::{SeriesPage, WriteOutcome, MAX_SERIES_ROWS};
pub use schema::{ensure_schema, SCHEMA_VERSION};
pub use sensors::{sensor_active, NearbySensor, SensorPage};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Hypertable-backed time-series store. Reads and writes go through
/// separate pools so query load cannot starve the ingest path.
#[derive(Clone)]
pub struct TsStore {
    read: PgPool,
    write: PgPool,
}

impl TsStore {
    pub async fn connect(
        database_url: &str,
        read_pool_size: u32,
        write_pool_size: u32,
    ) -> Result<Self, sqlx::Error> {
        let write = PgPoolOptions::new()
            .max_connections(write_pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        let read = PgPoolOptions::new()
            .max_connections(read_pool_size)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { read, write })
    }

    pub fn from_pools(read: PgPool, write: PgPool) -> Self {
        Self { read, write }
    }

    pub fn read_pool(&self) -> &PgPool {
        &self.read
    }

    pub fn write_pool(&self) -> &PgPool {
        &self.write
    }
}
