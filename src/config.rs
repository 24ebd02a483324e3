use chrono::Duration as ChronoDuration;
use std::env;
use std::time::Duration;

/// Engine configuration. Constructed directly in tests; hosts typically use
/// [`EngineConfig::from_env`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// Base URL of the upstream telemetry API, without a trailing slash.
    pub upstream_base_url: String,
    /// How often the poll path fetches latest values per user.
    pub poll_interval: Duration,
    /// Bound on outbound publish connect-and-ack.
    pub connect_timeout: Duration,
    /// Bound on a single upstream HTTP request.
    pub request_timeout: Duration,
    /// Minimum elapsed time between two alerts for the same (user, metric).
    pub suppression_window: ChronoDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broker_host: "app.coreiot.io".to_string(),
            broker_port: 1883,
            upstream_base_url: "https://app.coreiot.io/api/v1".to_string(),
            poll_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            suppression_window: ChronoDuration::minutes(30),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let broker_host = env::var("MQTT_BROKER").unwrap_or(defaults.broker_host);
        let broker_port: u16 = env::var("MQTT_PORT")
            .unwrap_or_else(|_| "1883".to_string())
            .parse()
            .unwrap_or(1883);
        let upstream_base_url =
            env::var("UPSTREAM_BASE_URL").unwrap_or(defaults.upstream_base_url);
        let poll_interval_secs: u64 = env::var("POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);
        let suppression_minutes: i64 = env::var("ALERT_SUPPRESSION_MINUTES")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        Self {
            broker_host,
            broker_port,
            upstream_base_url,
            poll_interval: Duration::from_secs(poll_interval_secs),
            suppression_window: ChronoDuration::minutes(suppression_minutes),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.suppression_window, ChronoDuration::minutes(30));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
    }
}
