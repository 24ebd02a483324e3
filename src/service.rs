use crate::alerts::AlertEngine;
use crate::config::EngineConfig;
use crate::errors::{Error, Result};
use crate::model::DeviceSnapshot;
use crate::normalize::normalize_push;
use crate::pipeline::Pipeline;
use crate::poller::PollScheduler;
use crate::pool::ConnectionPool;
use crate::store::Store;
use crate::upstream::UpstreamClient;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

/// The ingestion facade: the only surface external collaborators call.
///
/// Owns the connection pool, the poll scheduler, and the alert pipeline.
/// Construct one per process, activate users as they sign in, and call
/// [`IngestionEngine::shutdown`] once at teardown.
pub struct IngestionEngine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    pipeline: Arc<Pipeline>,
    pool: ConnectionPool,
    scheduler: PollScheduler,
}

impl IngestionEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn Store>) -> Result<Self> {
        let alerts = AlertEngine::new(Arc::clone(&store), config.suppression_window);
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&store), alerts));
        let pool = ConnectionPool::new(&config, Arc::clone(&store), Arc::clone(&pipeline));
        let upstream = UpstreamClient::new(&config.upstream_base_url, config.request_timeout)?;
        let scheduler = PollScheduler::new(Arc::clone(&store), upstream, Arc::clone(&pipeline));
        Ok(Self {
            config,
            store,
            pipeline,
            pool,
            scheduler,
        })
    }

    /// Starts both ingestion paths for a user: one pooled subscription per
    /// device and one repeating poll timer. Idempotent under repeated calls.
    pub async fn activate(&self, user_id: i64, upstream_token: &str) -> Result<()> {
        info!("activating ingestion for user {}", user_id);
        self.pool.activate(user_id).await?;
        self.scheduler
            .start(user_id, upstream_token.to_string(), self.config.poll_interval)
            .await;
        Ok(())
    }

    /// Ingests one externally supplied batch through the push-path
    /// normalization rules.
    pub async fn ingest_batch(
        &self,
        device_id: i64,
        payload: &Map<String, Value>,
    ) -> Result<()> {
        let device = self
            .store
            .device(device_id)
            .await?
            .ok_or(Error::DeviceNotFound(device_id))?;
        let samples = normalize_push(device.id, payload, Utc::now());
        self.pipeline.ingest(&device, samples).await;
        Ok(())
    }

    /// Publishes a value outbound to a device over a transient connection.
    pub async fn publish(&self, device_id: i64, payload: &Map<String, Value>) -> Result<()> {
        self.pool.publish(device_id, payload).await
    }

    /// Last-known samples per device, one per metric.
    pub async fn latest_snapshot(&self, user_id: i64) -> Result<Vec<DeviceSnapshot>> {
        self.store.latest_snapshot(user_id).await
    }

    /// Tears down every poll timer and pooled subscription. Called once at
    /// process exit.
    pub async fn shutdown(&self) {
        self.scheduler.stop_all().await;
        self.pool.shutdown_all().await;
        info!("ingestion engine shut down");
    }
}
