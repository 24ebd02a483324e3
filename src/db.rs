use crate::errors::Result;
use crate::model::{Device, DeviceSnapshot, Severity, TelemetrySample};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(make_pool(database_url).await?))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn devices_for_user(&self, user_id: i64) -> Result<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            "SELECT id, user_id, external_id, token FROM devices WHERE user_id = $1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    async fn device(&self, device_id: i64) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, user_id, external_id, token FROM devices WHERE id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = sqlx::query(
                "INSERT INTO telemetry (device_id, metric, value, unit, time) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(sample.device_id)
            .bind(&sample.metric)
            .bind(sample.value)
            .bind(&sample.unit)
            .bind(sample.time)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempts < 3 && is_transient_error(&e) => {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1);
                    warn!(
                        "sample insert failed (attempt {}/3), retrying in {}ms: {}",
                        attempts, wait_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn latest_snapshot(&self, user_id: i64) -> Result<Vec<DeviceSnapshot>> {
        let samples = sqlx::query_as::<_, TelemetrySample>(
            "SELECT DISTINCT ON (t.device_id, t.metric) \
                    t.device_id, t.metric, t.value, t.unit, t.time \
             FROM telemetry t \
             JOIN devices d ON d.id = t.device_id \
             WHERE d.user_id = $1 \
             ORDER BY t.device_id, t.metric, t.time DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots: Vec<DeviceSnapshot> = Vec::new();
        for sample in samples {
            match snapshots.last_mut() {
                Some(snapshot) if snapshot.device_id == sample.device_id => {
                    snapshot.samples.push(sample);
                }
                _ => snapshots.push(DeviceSnapshot {
                    device_id: sample.device_id,
                    samples: vec![sample],
                }),
            }
        }
        Ok(snapshots)
    }

    async fn insert_alert(
        &self,
        user_id: i64,
        severity: Severity,
        metric: &str,
        message: &str,
        time: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO alerts (user_id, severity, metric, message, time) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user_id)
        .bind(severity)
        .bind(metric)
        .bind(message)
        .bind(time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_alert_time(
        &self,
        user_id: i64,
        metric: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let time = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT time FROM alerts WHERE user_id = $1 AND metric = $2 \
             ORDER BY time DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(metric)
        .fetch_optional(&self.pool)
        .await?;
        Ok(time)
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}
