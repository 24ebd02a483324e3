use crate::errors::Result;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// One entry of an upstream time series. Providers send values as numbers or
/// numeric strings and timestamps as epoch milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesPoint {
    pub value: Value,
    pub ts: i64,
}

/// Response shape of the latest-values endpoint: metric name to a
/// (one-element) time series.
pub type LatestTelemetry = HashMap<String, Vec<SeriesPoint>>;

/// Client for the upstream telemetry HTTP API.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetches the latest values for one device. No retry here: a failed
    /// fetch is simply skipped until the scheduler's next tick.
    pub async fn fetch_latest(&self, external_id: &str, token: &str) -> Result<LatestTelemetry> {
        let url = format!("{}/telemetry/{}/latest", self.base_url, external_id);
        debug!("fetching {}", url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
