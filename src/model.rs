use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered sensor unit. Rows are created by the host backend's device
/// management surface; the engine only reads them.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub user_id: i64,
    /// Provider-side identifier, used in upstream telemetry URLs.
    pub external_id: String,
    /// Connection credential; doubles as the MQTT username.
    pub token: String,
}

/// One normalized measurement for a device. Append-only; duplicates for the
/// same (device, metric, time) are possible when the push and poll paths
/// overlap, and readers must tolerate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetrySample {
    pub device_id: i64,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub time: DateTime<Utc>,
}

/// Alert severity tier. The engine only ever creates `Warning` and `Danger`;
/// `Info` exists for manually created notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Danger,
}

/// A user-visible notice created when a sample breaches a safety threshold.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    pub id: i64,
    pub user_id: i64,
    pub severity: Severity,
    /// The metric that triggered the alert; also the suppression key.
    pub metric: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Latest known samples for one device, one per metric.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: i64,
    pub samples: Vec<TelemetrySample>,
}
