use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{CustomerId, Rover, RoverStatus, SensorData};
use crate::store::RoverStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 5;

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

/// Postgres-backed rover store
#[derive(Debug, Clone)]
pub struct PgRoverStore {
    pool: PgPool,
}

impl PgRoverStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ROVER_COLUMNS: &str = "id, name, identifier, customer_id, status, last_seen, ip_address, \
                             telemetry, created_at, updated_at";

fn rover_from_row(row: &PgRow) -> Result<Rover> {
    let status: String = row.try_get("status")?;
    let status = RoverStatus::parse(&status)
        .ok_or_else(|| Error::Validation(format!("Unknown stored status '{}'", status)))?;
    let telemetry: Option<Json<SensorData>> = row.try_get("telemetry")?;

    Ok(Rover {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        identifier: row.try_get("identifier")?,
        customer_id: row.try_get("customer_id")?,
        status,
        last_seen: row.try_get("last_seen")?,
        ip_address: row.try_get("ip_address")?,
        telemetry: telemetry.map(|t| t.0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts
async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => match &e {
                Error::Database(db_err) => {
                    if attempts >= MAX_ATTEMPTS || !is_transient_error(db_err) {
                        error!(
                            "Database {} failed permanently after {} attempts: {}",
                            what, attempts, e
                        );
                        return Err(e);
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Database {} failed (attempt {}/{}), retrying in {}ms: {}",
                        what, attempts, MAX_ATTEMPTS, wait_ms, db_err
                    );
                    DB_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                _ => {
                    error!("Database {} failed with non-database error: {}", what, e);
                    return Err(e);
                }
            },
        }
    }
}

#[async_trait]
impl RoverStore for PgRoverStore {
    async fn load_all(&self) -> Result<Vec<Rover>> {
        let query = format!("SELECT {} FROM rovers ORDER BY id", ROVER_COLUMNS);
        let (query, pool) = (query.as_str(), &self.pool);
        let rows = with_retry("load", || async move {
            sqlx::query(query).fetch_all(pool).await.map_err(Error::from)
        })
        .await?;

        rows.iter().map(rover_from_row).collect()
    }

    async fn create_or_get(
        &self,
        customer_id: CustomerId,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<Rover> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let query = format!(
            r#"
            INSERT INTO rovers (name, identifier, customer_id, status, created_at, updated_at)
            VALUES ($1, $1, $2, 'REGISTERED', $3, $3)
            ON CONFLICT (customer_id, identifier) DO UPDATE SET identifier = EXCLUDED.identifier
            RETURNING {}
            "#,
            ROVER_COLUMNS
        );

        let (query, pool) = (query.as_str(), &self.pool);
        let row = with_retry("create", || async move {
            sqlx::query(query)
                .bind(identifier)
                .bind(customer_id)
                .bind(now)
                .fetch_one(pool)
                .await
                .map_err(Error::from)
        })
        .await?;

        rover_from_row(&row)
    }

    async fn save_states(&self, rovers: &[Rover]) -> Result<()> {
        if rovers.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = rovers.iter().map(|r| r.id).collect();
        let statuses: Vec<&str> = rovers.iter().map(|r| r.status.as_str()).collect();
        let last_seen: Vec<Option<DateTime<Utc>>> = rovers.iter().map(|r| r.last_seen).collect();
        let ips: Vec<Option<String>> = rovers.iter().map(|r| r.ip_address.clone()).collect();
        let telemetry = telemetry_values(rovers)?;
        let updated_at: Vec<DateTime<Utc>> = rovers.iter().map(|r| r.updated_at).collect();

        let query = r#"
            UPDATE rovers AS r SET
                status = u.status,
                last_seen = u.last_seen,
                ip_address = u.ip_address,
                telemetry = u.telemetry,
                updated_at = u.updated_at
            FROM UNNEST($1::int8[], $2::text[], $3::timestamptz[], $4::text[], $5::jsonb[], $6::timestamptz[])
                AS u(id, status, last_seen, ip_address, telemetry, updated_at)
            WHERE r.id = u.id AND r.updated_at <= u.updated_at
            "#;

        let pool = &self.pool;
        let (ids, statuses, last_seen) = (&ids, &statuses, &last_seen);
        let (ips, telemetry, updated_at) = (&ips, &telemetry, &updated_at);
        with_retry("save", || async move {
            sqlx::query(query)
                .bind(ids)
                .bind(statuses)
                .bind(last_seen)
                .bind(ips)
                .bind(telemetry)
                .bind(updated_at)
                .execute(pool)
                .await
                .map(|_| ())
                .map_err(Error::from)
        })
        .await
    }
}

fn telemetry_values(rovers: &[Rover]) -> Result<Vec<Option<serde_json::Value>>> {
    rovers
        .iter()
        .map(|r| {
            r.telemetry
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(Error::from)
        })
        .collect()
}

fn is_transient_error(err: &sqlx::Error) -> bool {
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

    #[test]
    fn test_telemetry_values_keep_camel_case_keys() {
        let now = Utc::now();
        let mut with_data = Rover::new(1, 1, "R1", now);
        with_data.telemetry = Some(SensorData {
            battery_level: Some(88.0),
            ..SensorData::default()
        });
        let without = Rover::new(2, 1, "R2", now);

        let values = telemetry_values(&[with_data, without]).unwrap();
        assert_eq!(values[0].as_ref().unwrap()["batteryLevel"], 88.0);
        assert!(values[1].is_none());
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_permanent_error() {
        let mut calls = 0;
        let result: Result<()> = with_retry("test", || {
            calls += 1;
            async { Err(Error::Database(sqlx::Error::RowNotFound)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_with_retry_passes_non_database_errors_through() {
        let result: Result<()> =
            with_retry("test", || async { Err(Error::Validation("bad".to_string())) }).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
