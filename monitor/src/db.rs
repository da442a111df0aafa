use crate::errors::{Error, Result};
use crate::model::HistoricalRecord;
use crate::source::QuerySource;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Most recent history rows of one device, newest first.
pub async fn recent_readings(
    pool: &PgPool,
    device_id: &str,
    limit: usize,
) -> Result<Vec<HistoricalRecord>> {
    let query = r#"
        SELECT id, device_id, ts AS timestamp, ph, bod, cod, tss, flow,
               temperature, dissolved_oxygen, conductivity, turbidity
        FROM sensor_readings
        WHERE device_id = $1
        ORDER BY ts DESC
        LIMIT $2
        "#;

    let rows = sqlx::query_as::<_, HistoricalRecord>(query)
        .bind(device_id)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// History fallback backed by the `sensor_readings` table.
#[derive(Debug, Clone)]
pub struct PgQuerySource {
    pool: PgPool,
}

impl PgQuerySource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuerySource for PgQuerySource {
    async fn query_recent(&self, device_id: &str, limit: usize) -> Result<Vec<HistoricalRecord>> {
        recent_readings(&self.pool, device_id, limit)
            .await
            .map_err(|e| Error::Query(e.to_string()))
    }
}

/// Writes one batch in a single statement. Rows already stored for the same
/// device and capture time are skipped; returns the number of new rows.
pub async fn insert_batch(pool: &PgPool, batch: &[HistoricalRecord]) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }

    let ids: Vec<uuid::Uuid> = batch.iter().map(|r| r.id).collect();
    let device_ids: Vec<&str> = batch.iter().map(|r| r.device_id.as_str()).collect();
    let timestamps: Vec<chrono::DateTime<chrono::Utc>> = batch.iter().map(|r| r.timestamp).collect();
    let column = |f: fn(&HistoricalRecord) -> Option<f64>| -> Vec<Option<f64>> {
        batch.iter().map(f).collect()
    };

    let query = r#"
        INSERT INTO sensor_readings
            (id, device_id, ts, ph, bod, cod, tss, flow,
             temperature, dissolved_oxygen, conductivity, turbidity)
        SELECT * FROM UNNEST(
            $1::uuid[], $2::text[], $3::timestamptz[], $4::float8[], $5::float8[], $6::float8[],
            $7::float8[], $8::float8[], $9::float8[], $10::float8[], $11::float8[], $12::float8[]
        )
        ON CONFLICT (device_id, ts) DO NOTHING
        "#;

    let result = sqlx::query(query)
        .bind(&ids)
        .bind(&device_ids)
        .bind(&timestamps)
        .bind(column(|r| r.ph))
        .bind(column(|r| r.bod))
        .bind(column(|r| r.cod))
        .bind(column(|r| r.tss))
        .bind(column(|r| r.flow))
        .bind(column(|r| r.temperature))
        .bind(column(|r| r.dissolved_oxygen))
        .bind(column(|r| r.conductivity))
        .bind(column(|r| r.turbidity))
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Connection-level failures worth another attempt.
pub fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }
}
