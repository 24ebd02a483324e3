use crate::config::EngineConfig;
use crate::errors::{Error, Result};
use crate::metrics::{CONNECT_FAILURES_TOTAL, PARSE_FAILURES_TOTAL};
use crate::model::Device;
use crate::normalize::normalize_push;
use crate::pipeline::Pipeline;
use crate::store::Store;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SUBSCRIBE_TOPIC: &str = "v1/devices/me/attributes";
const PUBLISH_TOPIC: &str = "v1/devices/me/telemetry";

/// A standing subscription for one device. Owned exclusively by the pool.
struct PooledSubscription {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

/// Owns one persistent broker subscription per device. Subscriptions are
/// opened on user activation, survive across requests, and are torn down at
/// process shutdown.
pub struct ConnectionPool {
    broker_host: String,
    broker_port: u16,
    connect_timeout: Duration,
    store: Arc<dyn Store>,
    pipeline: Arc<Pipeline>,
    subs: Mutex<HashMap<i64, PooledSubscription>>,
}

impl ConnectionPool {
    pub fn new(config: &EngineConfig, store: Arc<dyn Store>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            broker_host: config.broker_host.clone(),
            broker_port: config.broker_port,
            connect_timeout: config.connect_timeout,
            store,
            pipeline,
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a subscription for each of the user's devices not already
    /// pooled. Idempotent; a failure on one device never prevents the others
    /// from being pooled.
    pub async fn activate(&self, user_id: i64) -> Result<()> {
        let devices = self.store.devices_for_user(user_id).await?;
        let mut subs = self.subs.lock().await;
        for device in devices {
            if subs.contains_key(&device.id) {
                debug!("device {} already pooled", device.id);
                continue;
            }
            let (client, eventloop) = self.open_client(&device, 10);
            if let Err(e) = client.subscribe(SUBSCRIBE_TOPIC, QoS::AtLeastOnce).await {
                CONNECT_FAILURES_TOTAL.inc();
                error!("device {}: subscribe failed: {}", device.id, e);
                continue;
            }
            let device_id = device.id;
            let driver = tokio::spawn(drive_subscription(
                device,
                eventloop,
                Arc::clone(&self.pipeline),
            ));
            subs.insert(device_id, PooledSubscription { client, driver });
            info!("pooled subscription for device {}", device_id);
        }
        Ok(())
    }

    /// Publishes one payload to a device over a transient connection scoped
    /// to this call. The connection is released on every exit path. An
    /// unknown device id fails before any connection is made.
    pub async fn publish(&self, device_id: i64, payload: &Map<String, Value>) -> Result<()> {
        let device = self
            .store
            .device(device_id)
            .await?
            .ok_or(Error::DeviceNotFound(device_id))?;

        let body =
            serde_json::to_vec(payload).map_err(|e| Error::Parse(e.to_string()))?;

        let (client, mut eventloop) = self.open_client(&device, 10);
        client
            .publish(PUBLISH_TOPIC, QoS::AtLeastOnce, false, body)
            .await?;

        // Drive the transient connection until the broker acks, the
        // connection fails, or the bound expires.
        let acked = tokio::time::timeout(self.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(Error::Connect(e)),
                }
            }
        })
        .await;

        let result = match acked {
            Ok(result) => result,
            Err(_) => Err(Error::PublishTimeout(device_id)),
        };
        // Release the scoped connection regardless of outcome.
        let _ = client.disconnect().await;
        result
    }

    /// Closes every pooled subscription. Called once at process teardown;
    /// safe even while some handles are mid-setup.
    pub async fn shutdown_all(&self) {
        let mut subs = self.subs.lock().await;
        for (device_id, sub) in subs.drain() {
            let _ = sub.client.disconnect().await;
            sub.driver.abort();
            debug!("closed subscription for device {}", device_id);
        }
        info!("connection pool shut down");
    }

    pub async fn pooled_count(&self) -> usize {
        self.subs.lock().await.len()
    }

    fn open_client(&self, device: &Device, cap: usize) -> (AsyncClient, EventLoop) {
        let client_id = format!("envmon-{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, &self.broker_host, self.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        // The device credential is the MQTT username.
        options.set_credentials(&device.token, "");
        AsyncClient::new(options, cap)
    }
}

/// Event loop for one pooled subscription. Errors are logged against this
/// device only; rumqttc reconnects on its own, so the loop just backs off
/// and keeps polling.
async fn drive_subscription(device: Device, mut eventloop: EventLoop, pipeline: Arc<Pipeline>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_message(&device, &publish.payload, &pipeline).await;
            }
            Ok(_) => {}
            Err(e) => {
                CONNECT_FAILURES_TOTAL.inc();
                error!("device {}: MQTT error: {}", device.id, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_message(device: &Device, payload: &[u8], pipeline: &Pipeline) {
    let fields = match serde_json::from_slice::<Map<String, Value>>(payload) {
        Ok(fields) => fields,
        Err(e) => {
            PARSE_FAILURES_TOTAL.inc();
            warn!("device {}: unparseable payload: {}", device.id, e);
            return;
        }
    };
    let samples = normalize_push(device.id, &fields, Utc::now());
    pipeline.ingest(device, samples).await;
}
