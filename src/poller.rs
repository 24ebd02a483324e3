use crate::metrics::{POLL_CYCLE_SECONDS, UPSTREAM_FAILURES_TOTAL};
use crate::normalize::normalize_poll;
use crate::pipeline::Pipeline;
use crate::store::Store;
use crate::upstream::UpstreamClient;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// The repeating fetch timer for one user. Owned exclusively by the
/// scheduler.
struct PollTimer {
    task: JoinHandle<()>,
}

/// Periodically pulls latest values from the upstream API for all of a
/// user's devices, complementing the standing subscriptions.
pub struct PollScheduler {
    store: Arc<dyn Store>,
    upstream: UpstreamClient,
    pipeline: Arc<Pipeline>,
    timers: Mutex<HashMap<i64, PollTimer>>,
}

impl PollScheduler {
    pub fn new(store: Arc<dyn Store>, upstream: UpstreamClient, pipeline: Arc<Pipeline>) -> Self {
        Self {
            store,
            upstream,
            pipeline,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the repeating fetch for a user; a second call for the same
    /// user is a no-op. The first cycle runs immediately.
    pub async fn start(&self, user_id: i64, token: String, every: Duration) {
        let mut timers = self.timers.lock().await;
        if timers.contains_key(&user_id) {
            debug!("poll timer already running for user {}", user_id);
            return;
        }

        let store = Arc::clone(&self.store);
        let upstream = self.upstream.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            // Overlap policy: skip. The cycle runs inline in this task, so a
            // tick that fires while the previous cycle is still in flight is
            // dropped, never queued.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                run_cycle(user_id, &token, &store, &upstream, &pipeline).await;
            }
        });
        timers.insert(user_id, PollTimer { task });
        info!("started poll timer for user {} every {:?}", user_id, every);
    }

    /// Cancels the user's timer; a no-op when none exists.
    pub async fn stop(&self, user_id: i64) {
        if let Some(timer) = self.timers.lock().await.remove(&user_id) {
            timer.task.abort();
            info!("stopped poll timer for user {}", user_id);
        }
    }

    /// Cancels every timer, including any with a cycle in flight.
    pub async fn stop_all(&self) {
        let mut timers = self.timers.lock().await;
        for (user_id, timer) in timers.drain() {
            timer.task.abort();
            debug!("stopped poll timer for user {}", user_id);
        }
        info!("poll scheduler shut down");
    }

    pub async fn timer_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

/// One fetch-and-persist cycle across a user's devices. Each device is
/// fetched independently; a failure is logged and the cycle moves on.
async fn run_cycle(
    user_id: i64,
    token: &str,
    store: &Arc<dyn Store>,
    upstream: &UpstreamClient,
    pipeline: &Pipeline,
) {
    let start = Instant::now();
    let devices = match store.devices_for_user(user_id).await {
        Ok(devices) => devices,
        Err(e) => {
            warn!("poll cycle for user {}: device lookup failed: {}", user_id, e);
            return;
        }
    };

    for device in devices {
        match upstream.fetch_latest(&device.external_id, token).await {
            Ok(latest) => {
                let samples = normalize_poll(device.id, &latest);
                pipeline.ingest(&device, samples).await;
            }
            Err(e) => {
                UPSTREAM_FAILURES_TOTAL.inc();
                warn!("device {}: upstream fetch failed: {}", device.id, e);
            }
        }
    }

    POLL_CYCLE_SECONDS.observe(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertEngine;
    use crate::store::MemStore;
    use chrono::Duration as ChronoDuration;

    fn scheduler() -> PollScheduler {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let upstream =
            UpstreamClient::new("http://127.0.0.1:1", Duration::from_millis(100)).unwrap();
        let alerts = AlertEngine::new(Arc::clone(&store), ChronoDuration::minutes(30));
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&store), alerts));
        PollScheduler::new(store, upstream, pipeline)
    }

    #[tokio::test]
    async fn test_start_is_idempotent_per_user() {
        let scheduler = scheduler();
        scheduler
            .start(7, "tok".to_string(), Duration::from_secs(60))
            .await;
        scheduler
            .start(7, "tok".to_string(), Duration::from_secs(60))
            .await;
        scheduler
            .start(8, "tok".to_string(), Duration::from_secs(60))
            .await;
        assert_eq!(scheduler.timer_count().await, 2);
        scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_is_safe_when_absent() {
        let scheduler = scheduler();
        scheduler.stop(7).await;

        scheduler
            .start(7, "tok".to_string(), Duration::from_secs(60))
            .await;
        scheduler.stop(7).await;
        assert_eq!(scheduler.timer_count().await, 0);
        scheduler.stop(7).await;
    }
}
