use crate::alerts::AlertEngine;
use crate::metrics::{PERSIST_FAILURES_TOTAL, SAMPLES_WRITTEN_TOTAL};
use crate::model::{Device, TelemetrySample};
use crate::store::Store;
use std::sync::Arc;
use tracing::{debug, error};

/// The persist-then-evaluate stage both ingestion paths feed.
pub struct Pipeline {
    store: Arc<dyn Store>,
    alerts: AlertEngine,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, alerts: AlertEngine) -> Self {
        Self { store, alerts }
    }

    /// Writes each sample and evaluates it against the thresholds. A store
    /// failure drops that one sample without alert evaluation; the rest of
    /// the batch proceeds.
    pub async fn ingest(&self, device: &Device, samples: Vec<TelemetrySample>) {
        for sample in samples {
            if let Err(e) = self.store.insert_sample(&sample).await {
                PERSIST_FAILURES_TOTAL.inc();
                error!(
                    "device {}: failed to persist {} sample: {}",
                    device.id, sample.metric, e
                );
                continue;
            }
            SAMPLES_WRITTEN_TOTAL.inc();
            debug!(
                "device {}: wrote {} = {} {}",
                device.id, sample.metric, sample.value, sample.unit
            );

            if let Err(e) = self
                .alerts
                .evaluate(device.user_id, &sample.metric, sample.value, sample.time)
                .await
            {
                error!(
                    "user {}: alert evaluation failed for {}: {}",
                    device.user_id, sample.metric, e
                );
            }
        }
    }
}
