use crate::errors::Result;
use crate::metrics::{ALERTS_CREATED_TOTAL, ALERTS_SUPPRESSED_TOTAL};
use crate::model::Severity;
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Static safety thresholds: metric to (warning max, critical max). Metrics
/// absent from this table are persisted but never alerted on.
const THRESHOLDS: [(&str, f64, f64); 3] = [
    ("CO2", 1500.0, 3000.0),
    ("PM25", 100.0, 150.0),
    ("temperature", 38.0, 40.0),
];

fn thresholds_for(metric: &str) -> Option<(f64, f64)> {
    THRESHOLDS
        .iter()
        .find(|(m, _, _)| *m == metric)
        .map(|(_, warning, critical)| (*warning, *critical))
}

/// Evaluates samples against the threshold table and writes rate-limited
/// alerts. Duplicate alerts are debounced against the single most recent
/// alert for the same (user, metric), looked up through an in-memory index
/// seeded from the store's `metric` column.
pub struct AlertEngine {
    store: Arc<dyn Store>,
    window: Duration,
    /// (user, metric) -> time of the most recent alert, with `None` recording
    /// that the store was checked and holds no prior alert. Populated on
    /// first miss, then kept current locally.
    last_alert: Mutex<HashMap<(i64, String), Option<DateTime<Utc>>>>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn Store>, window: Duration) -> Self {
        Self {
            store,
            window,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluates one sample value, timed at `at` (the sample's own
    /// timestamp, so replayed telemetry debounces deterministically).
    pub async fn evaluate(
        &self,
        user_id: i64,
        metric: &str,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let Some((warning_max, critical_max)) = thresholds_for(metric) else {
            return Ok(());
        };
        if value <= warning_max {
            return Ok(());
        }

        // Check-then-insert on the index must stay atomic across concurrent
        // device handlers, so the lock is held through the store write.
        let mut last_alert = self.last_alert.lock().await;
        let key = (user_id, metric.to_string());
        let last = match last_alert.get(&key) {
            Some(cached) => *cached,
            None => {
                let time = self.store.last_alert_time(user_id, metric).await?;
                last_alert.insert(key.clone(), time);
                time
            }
        };

        if let Some(last) = last {
            let elapsed = at - last;
            if elapsed < self.window {
                ALERTS_SUPPRESSED_TOTAL.inc();
                debug!(
                    "suppressing {} alert for user {}: last one {}min ago",
                    metric,
                    user_id,
                    elapsed.num_minutes()
                );
                return Ok(());
            }
        }

        let severity = if value > critical_max {
            Severity::Danger
        } else {
            Severity::Warning
        };
        let message = format!("{} reading {} exceeds the safe limit of {}", metric, value, warning_max);
        self.store
            .insert_alert(user_id, severity, metric, &message, at)
            .await?;
        last_alert.insert(key, Some(at));
        ALERTS_CREATED_TOTAL.inc();
        info!(
            "created {:?} alert for user {}: {} = {}",
            severity, user_id, metric, value
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::model::{Device, DeviceSnapshot, TelemetrySample};
    use crate::store::MemStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn engine(store: &Arc<MemStore>) -> AlertEngine {
        let store: Arc<dyn Store> = store.clone();
        AlertEngine::new(store, Duration::minutes(30))
    }

    /// Counts prior-alert lookups and can fail the next alert write.
    #[derive(Default)]
    struct CountingStore {
        inner: MemStore,
        lookups: AtomicUsize,
        fail_next_insert: AtomicBool,
    }

    #[async_trait]
    impl Store for CountingStore {
        async fn devices_for_user(&self, user_id: i64) -> crate::errors::Result<Vec<Device>> {
            self.inner.devices_for_user(user_id).await
        }

        async fn device(&self, device_id: i64) -> crate::errors::Result<Option<Device>> {
            self.inner.device(device_id).await
        }

        async fn insert_sample(&self, sample: &TelemetrySample) -> crate::errors::Result<()> {
            self.inner.insert_sample(sample).await
        }

        async fn latest_snapshot(
            &self,
            user_id: i64,
        ) -> crate::errors::Result<Vec<DeviceSnapshot>> {
            self.inner.latest_snapshot(user_id).await
        }

        async fn insert_alert(
            &self,
            user_id: i64,
            severity: Severity,
            metric: &str,
            message: &str,
            time: DateTime<Utc>,
        ) -> crate::errors::Result<()> {
            if self.fail_next_insert.swap(false, Ordering::SeqCst) {
                return Err(Error::Database(sqlx::Error::PoolClosed));
            }
            self.inner
                .insert_alert(user_id, severity, metric, message, time)
                .await
        }

        async fn last_alert_time(
            &self,
            user_id: i64,
            metric: &str,
        ) -> crate::errors::Result<Option<DateTime<Utc>>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.last_alert_time(user_id, metric).await
        }
    }

    #[tokio::test]
    async fn test_unlisted_metric_never_alerts() {
        let store = Arc::new(MemStore::new());
        let alerts = engine(&store);
        alerts.evaluate(7, "light", 1e9, Utc::now()).await.unwrap();
        alerts.evaluate(7, "radon", 1e9, Utc::now()).await.unwrap();
        assert!(store.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_value_at_or_below_warning_never_alerts() {
        let store = Arc::new(MemStore::new());
        let alerts = engine(&store);
        alerts.evaluate(7, "CO2", 1500.0, Utc::now()).await.unwrap();
        alerts.evaluate(7, "CO2", 400.0, Utc::now()).await.unwrap();
        assert!(store.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_warning_and_danger_tiers() {
        let store = Arc::new(MemStore::new());
        let alerts = engine(&store);
        let t0 = Utc::now();

        alerts.evaluate(7, "CO2", 1800.0, t0).await.unwrap();
        alerts
            .evaluate(7, "temperature", 41.0, t0)
            .await
            .unwrap();

        let created = store.alerts().await;
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].severity, Severity::Warning);
        assert!(created[0].message.contains("CO2"));
        assert!(created[0].message.contains("1800"));
        assert_eq!(created[1].severity, Severity::Danger);
    }

    #[tokio::test]
    async fn test_suppression_window_boundary() {
        let store = Arc::new(MemStore::new());
        let alerts = engine(&store);
        let t0 = Utc::now();

        alerts.evaluate(7, "PM25", 120.0, t0).await.unwrap();
        alerts
            .evaluate(7, "PM25", 130.0, t0 + Duration::minutes(29))
            .await
            .unwrap();
        assert_eq!(store.alerts().await.len(), 1);

        alerts
            .evaluate(7, "PM25", 130.0, t0 + Duration::minutes(31))
            .await
            .unwrap();
        assert_eq!(store.alerts().await.len(), 2);
    }

    #[tokio::test]
    async fn test_co2_scenario() {
        let store = Arc::new(MemStore::new());
        let alerts = engine(&store);
        let t0 = Utc::now();

        alerts.evaluate(7, "CO2", 1800.0, t0).await.unwrap();
        alerts
            .evaluate(7, "CO2", 3500.0, t0 + Duration::minutes(10))
            .await
            .unwrap();
        alerts
            .evaluate(7, "CO2", 3500.0, t0 + Duration::minutes(35))
            .await
            .unwrap();

        let created = store.alerts().await;
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].severity, Severity::Warning);
        assert_eq!(created[1].severity, Severity::Danger);
        assert_eq!(created[1].time, t0 + Duration::minutes(35));
    }

    #[tokio::test]
    async fn test_suppression_is_keyed_per_metric_and_user() {
        let store = Arc::new(MemStore::new());
        let alerts = engine(&store);
        let t0 = Utc::now();

        alerts.evaluate(7, "CO2", 1800.0, t0).await.unwrap();
        // A different metric or user is never debounced by the CO2 alert.
        alerts
            .evaluate(7, "temperature", 39.0, t0 + Duration::minutes(1))
            .await
            .unwrap();
        alerts
            .evaluate(8, "CO2", 1800.0, t0 + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(store.alerts().await.len(), 3);
    }

    #[tokio::test]
    async fn test_prior_alert_lookup_is_memoized() {
        let store = Arc::new(CountingStore::default());
        let dyn_store: Arc<dyn Store> = store.clone();
        let alerts = AlertEngine::new(dyn_store, Duration::minutes(30));
        let t0 = Utc::now();

        // First breach asks the store once; the write fails.
        store.fail_next_insert.store(true, Ordering::SeqCst);
        assert!(alerts.evaluate(7, "CO2", 1600.0, t0).await.is_err());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

        // The no-prior-alert answer was remembered: the retry creates the
        // alert without asking the store again.
        alerts.evaluate(7, "CO2", 1600.0, t0).await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

        // Suppression runs off the cache too.
        alerts
            .evaluate(7, "CO2", 1700.0, t0 + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_index_seeded_from_store() {
        let store = Arc::new(MemStore::new());
        let t0 = Utc::now();
        store
            .insert_alert(7, Severity::Warning, "CO2", "pre-existing", t0)
            .await
            .unwrap();

        // A fresh engine must pick the prior alert up from the store.
        let alerts = engine(&store);
        alerts
            .evaluate(7, "CO2", 2000.0, t0 + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(store.alerts().await.len(), 1);
    }
}
