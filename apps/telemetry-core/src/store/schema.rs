use super::TsStore;
use anyhow::{bail, Context, Result};

pub const SCHEMA_VERSION: i32 = 1;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS schema_meta (
        version INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensors (
        id TEXT PRIMARY KEY,
        family TEXT NOT NULL,
        manufacturer TEXT NOT NULL DEFAULT '',
        first_seen TIMESTAMPTZ NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL,
        lat DOUBLE PRECISION,
        lng DOUBLE PRECISION,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensor_location_history (
        sensor_id TEXT NOT NULL,
        ts TIMESTAMPTZ NOT NULL,
        lat DOUBLE PRECISION NOT NULL,
        lng DOUBLE PRECISION NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS water_level_readings (
        time TIMESTAMPTZ NOT NULL,
        sensor_id TEXT NOT NULL,
        level_cm DOUBLE PRECISION NOT NULL,
        voltage_v DOUBLE PRECISION NOT NULL,
        rssi_dbm INTEGER NOT NULL,
        temperature_c DOUBLE PRECISION,
        quality DOUBLE PRECISION NOT NULL,
        lat DOUBLE PRECISION,
        lng DOUBLE PRECISION,
        PRIMARY KEY (sensor_id, time)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS moisture_readings (
        time TIMESTAMPTZ NOT NULL,
        sensor_id TEXT NOT NULL,
        moisture_surface_pct DOUBLE PRECISION,
        moisture_deep_pct DOUBLE PRECISION,
        temp_surface_c DOUBLE PRECISION,
        temp_deep_c DOUBLE PRECISION,
        ambient_humidity_pct DOUBLE PRECISION,
        ambient_temp_c DOUBLE PRECISION,
        flood BOOLEAN NOT NULL DEFAULT FALSE,
        voltage_v DOUBLE PRECISION,
        quality DOUBLE PRECISION NOT NULL,
        lat DOUBLE PRECISION,
        lng DOUBLE PRECISION,
        PRIMARY KEY (sensor_id, time)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS weather_readings (
        time TIMESTAMPTZ NOT NULL,
        sensor_id TEXT NOT NULL,
        rainfall_mm DOUBLE PRECISION,
        temperature_c DOUBLE PRECISION,
        humidity_pct DOUBLE PRECISION,
        wind_speed_ms DOUBLE PRECISION,
        wind_max_ms DOUBLE PRECISION,
        wind_dir_deg DOUBLE PRECISION,
        solar_radiation_wm2 DOUBLE PRECISION,
        battery_v DOUBLE PRECISION,
        pressure_hpa DOUBLE PRECISION,
        quality DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (sensor_id, time)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_keys (
        id UUID PRIMARY KEY,
        key_hash TEXT NOT NULL UNIQUE,
        tenant TEXT NOT NULL,
        tier TEXT NOT NULL,
        allowed_families TEXT[] NOT NULL DEFAULT '{}',
        allowed_zones TEXT[],
        expires_at TIMESTAMPTZ,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_used_at TIMESTAMPTZ,
        usage_count BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensors_family ON sensors (family)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_location_history_sensor
        ON sensor_location_history (sensor_id, ts)
    "#,
];

const READING_TABLES: &[&str] = &["water_level_readings", "moisture_readings", "weather_readings"];

/// Bootstraps the schema and fail-fasts on drift. Hypertable conversion,
/// compression and retention policies are best-effort: the adapter works
/// on plain PostgreSQL, just without chunked storage.
pub async fn ensure_schema(store: &TsStore) -> Result<()> {
    let pool = store.write_pool();

    for ddl in TABLES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .context("schema bootstrap failed")?;
    }

    let version: Option<i32> = sqlx::query_scalar("SELECT version FROM schema_meta LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("schema version check failed")?;
    match version {
        None => {
            sqlx::query("INSERT INTO schema_meta (version) VALUES ($1)")
                .bind(SCHEMA_VERSION)
                .execute(pool)
                .await?;
        }
        Some(found) if found == SCHEMA_VERSION => {}
        Some(found) => {
            bail!("schema version mismatch: store has {found}, binary expects {SCHEMA_VERSION}");
        }
    }

    for table in READING_TABLES {
        let hypertable = format!(
            "SELECT create_hypertable('{table}', 'time', if_not_exists => TRUE, \
             chunk_time_interval => INTERVAL '7 days', migrate_data => TRUE)"
        );
        if let Err(err) = sqlx::query(&hypertable).execute(pool).await {
            tracing::warn!(table, error = %err, "hypertable conversion unavailable");
            continue;
        }
        let compression = format!(
            "ALTER TABLE {table} SET (timescaledb.compress, \
             timescaledb.compress_segmentby = 'sensor_id')"
        );
        if let Err(err) = sqlx::query(&compression).execute(pool).await {
            tracing::debug!(table, error = %err, "compression settings not applied");
            continue;
        }
        let policy = format!(
            "SELECT add_compression_policy('{table}', INTERVAL '30 days', if_not_exists => TRUE)"
        );
        if let Err(err) = sqlx::query(&policy).execute(pool).await {
            tracing::debug!(table, error = %err, "compression policy not applied");
        }
        let retention = format!(
            "SELECT add_retention_policy('{table}', INTERVAL '2 years', if_not_exists => TRUE)"
        );
        if let Err(err) = sqlx::query(&retention).execute(pool).await {
            tracing::debug!(table, error = %err, "retention policy not applied");
        }
    }

    Ok(())
}
