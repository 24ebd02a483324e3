use crate::metrics::PARSE_FAILURES_TOTAL;
use crate::model::TelemetrySample;
use crate::upstream::LatestTelemetry;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Metrics the poll path ingests. Anything else in an upstream response is
/// dropped; the push path has no such allowlist.
pub const POLL_FIELDS: [&str; 5] = ["temperature", "humidity", "CO2", "PM25", "light"];

/// Display unit for the known metrics; unknown metrics carry an empty unit.
pub fn unit_for(metric: &str) -> &'static str {
    match metric {
        "temperature" => "°C",
        "humidity" => "%",
        "CO2" => "ppm",
        "PM25" => "µg/m³",
        "light" => "lux",
        _ => "",
    }
}

fn as_number(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Push-path normalization: arbitrary metric keys with bare numeric values,
/// stamped at time of receipt. Unknown metrics pass through with an empty
/// unit. A field that fails to parse is skipped; the rest of the batch
/// proceeds.
pub fn normalize_push(
    device_id: i64,
    payload: &Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Vec<TelemetrySample> {
    let mut samples = Vec::with_capacity(payload.len());
    for (metric, raw) in payload {
        let Some(value) = as_number(raw) else {
            PARSE_FAILURES_TOTAL.inc();
            warn!(
                "device {}: skipping non-numeric field {:?} = {}",
                device_id, metric, raw
            );
            continue;
        };
        samples.push(TelemetrySample {
            device_id,
            metric: metric.clone(),
            value,
            unit: unit_for(metric).to_string(),
            time: received_at,
        });
    }
    samples
}

/// Poll-path normalization: only the fixed field list is accepted, each as a
/// one-element `{value, ts}` series. Unknown metrics are silently dropped;
/// malformed values or timestamps skip the field only.
pub fn normalize_poll(device_id: i64, latest: &LatestTelemetry) -> Vec<TelemetrySample> {
    let mut samples = Vec::with_capacity(POLL_FIELDS.len());
    for (metric, series) in latest {
        if !POLL_FIELDS.contains(&metric.as_str()) {
            debug!("device {}: dropping unlisted metric {:?}", device_id, metric);
            continue;
        }
        let Some(point) = series.first() else {
            continue;
        };
        let Some(value) = as_number(&point.value) else {
            PARSE_FAILURES_TOTAL.inc();
            warn!(
                "device {}: skipping non-numeric value for {:?}",
                device_id, metric
            );
            continue;
        };
        let Some(time) = Utc.timestamp_millis_opt(point.ts).single() else {
            PARSE_FAILURES_TOTAL.inc();
            warn!(
                "device {}: skipping {:?} sample with invalid timestamp {}",
                device_id, metric, point.ts
            );
            continue;
        };
        samples.push(TelemetrySample {
            device_id,
            metric: metric.clone(),
            value,
            unit: unit_for(metric).to_string(),
            time,
        });
    }
    samples
}
