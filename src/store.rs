use crate::errors::Result;
use crate::model::{Alert, Device, DeviceSnapshot, Severity, TelemetrySample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The engine's view of the relational collaborator. Devices are read-only;
/// samples and alerts are append-only.
#[async_trait]
pub trait Store: Send + Sync {
    async fn devices_for_user(&self, user_id: i64) -> Result<Vec<Device>>;

    async fn device(&self, device_id: i64) -> Result<Option<Device>>;

    /// Appends one sample. Called concurrently from independent device
    /// handlers; no uniqueness is enforced.
    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<()>;

    /// Latest sample per (device, metric) across all of a user's devices.
    /// Devices that have no telemetry yet are omitted.
    async fn latest_snapshot(&self, user_id: i64) -> Result<Vec<DeviceSnapshot>>;

    async fn insert_alert(
        &self,
        user_id: i64,
        severity: Severity,
        metric: &str,
        message: &str,
        time: DateTime<Utc>,
    ) -> Result<()>;

    /// Time of the most recent alert for (user, metric), if any.
    async fn last_alert_time(&self, user_id: i64, metric: &str)
        -> Result<Option<DateTime<Utc>>>;
}

/// In-memory store. Lets tests (and embedded hosts) construct fully isolated
/// engine instances without a database.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: RwLock<MemInner>,
}

#[derive(Debug, Default)]
struct MemInner {
    devices: Vec<Device>,
    samples: Vec<TelemetrySample>,
    alerts: Vec<Alert>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_device(&self, device: Device) {
        self.inner.write().await.devices.push(device);
    }

    pub async fn samples(&self) -> Vec<TelemetrySample> {
        self.inner.read().await.samples.clone()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.inner.read().await.alerts.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn devices_for_user(&self, user_id: i64) -> Result<Vec<Device>> {
        let inner = self.inner.read().await;
        Ok(inner
            .devices
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn device(&self, device_id: i64) -> Result<Option<Device>> {
        let inner = self.inner.read().await;
        Ok(inner.devices.iter().find(|d| d.id == device_id).cloned())
    }

    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<()> {
        self.inner.write().await.samples.push(sample.clone());
        Ok(())
    }

    async fn latest_snapshot(&self, user_id: i64) -> Result<Vec<DeviceSnapshot>> {
        let inner = self.inner.read().await;
        let mut snapshots = Vec::new();
        for device in inner.devices.iter().filter(|d| d.user_id == user_id) {
            let mut latest: HashMap<&str, &TelemetrySample> = HashMap::new();
            for sample in inner.samples.iter().filter(|s| s.device_id == device.id) {
                match latest.get(sample.metric.as_str()) {
                    Some(current) if current.time >= sample.time => {}
                    _ => {
                        latest.insert(sample.metric.as_str(), sample);
                    }
                }
            }
            // Devices without telemetry are omitted, matching the Postgres
            // query shape.
            if latest.is_empty() {
                continue;
            }
            let mut samples: Vec<TelemetrySample> =
                latest.into_values().cloned().collect();
            samples.sort_by(|a, b| a.metric.cmp(&b.metric));
            snapshots.push(DeviceSnapshot {
                device_id: device.id,
                samples,
            });
        }
        snapshots.sort_by_key(|s| s.device_id);
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
        let mut inner = self.inner.write().await;
        let id = inner.alerts.len() as i64 + 1;
        inner.alerts.push(Alert {
            id,
            user_id,
            severity,
            metric: metric.to_string(),
            message: message.to_string(),
            time,
        });
        Ok(())
    }

    async fn last_alert_time(
        &self,
        user_id: i64,
        metric: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .alerts
            .iter()
            .filter(|a| a.user_id == user_id && a.metric == metric)
            .map(|a| a.time)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(device_id: i64, metric: &str, value: f64, time: DateTime<Utc>) -> TelemetrySample {
        TelemetrySample {
            device_id,
            metric: metric.to_string(),
            value,
            unit: String::new(),
            time,
        }
    }

    #[test]
    fn test_snapshot_keeps_latest_per_metric() {
        tokio_test::block_on(async {
            let store = MemStore::new();
            store
                .add_device(Device {
                    id: 1,
                    user_id: 7,
                    external_id: "ext-1".to_string(),
                    token: "t".to_string(),
                })
                .await;

            let t0 = Utc::now();
            store.insert_sample(&sample(1, "CO2", 800.0, t0)).await.unwrap();
            store
                .insert_sample(&sample(1, "CO2", 950.0, t0 + Duration::minutes(5)))
                .await
                .unwrap();
            store
                .insert_sample(&sample(1, "temperature", 22.0, t0))
                .await
                .unwrap();

            let snapshots = store.latest_snapshot(7).await.unwrap();
            assert_eq!(snapshots.len(), 1);
            assert_eq!(snapshots[0].device_id, 1);
            assert_eq!(snapshots[0].samples.len(), 2);
            assert_eq!(snapshots[0].samples[0].metric, "CO2");
            assert_eq!(snapshots[0].samples[0].value, 950.0);
        });
    }

    #[test]
    fn test_snapshot_omits_devices_without_samples() {
        tokio_test::block_on(async {
            let store = MemStore::new();
            for id in [1, 2] {
                store
                    .add_device(Device {
                        id,
                        user_id: 7,
                        external_id: format!("ext-{}", id),
                        token: "t".to_string(),
                    })
                    .await;
            }
            store
                .insert_sample(&sample(1, "humidity", 55.0, Utc::now()))
                .await
                .unwrap();

            let snapshots = store.latest_snapshot(7).await.unwrap();
            assert_eq!(snapshots.len(), 1);
            assert_eq!(snapshots[0].device_id, 1);
        });
    }

    #[test]
    fn test_duplicate_samples_are_tolerated() {
        tokio_test::block_on(async {
            let store = MemStore::new();
            let t0 = Utc::now();
            store.insert_sample(&sample(1, "CO2", 800.0, t0)).await.unwrap();
            store.insert_sample(&sample(1, "CO2", 800.0, t0)).await.unwrap();
            assert_eq!(store.samples().await.len(), 2);
        });
    }

    #[test]
    fn test_last_alert_time_is_per_user_and_metric() {
        tokio_test::block_on(async {
            let store = MemStore::new();
            let t0 = Utc::now();
            store
                .insert_alert(7, Severity::Warning, "CO2", "msg", t0)
                .await
                .unwrap();
            store
                .insert_alert(7, Severity::Danger, "CO2", "msg", t0 + Duration::minutes(40))
                .await
                .unwrap();

            let latest = store.last_alert_time(7, "CO2").await.unwrap();
            assert_eq!(latest, Some(t0 + Duration::minutes(40)));
            assert_eq!(store.last_alert_time(7, "PM25").await.unwrap(), None);
            assert_eq!(store.last_alert_time(8, "CO2").await.unwrap(), None);
        });
    }
}
