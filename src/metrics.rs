use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SAMPLES_WRITTEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "engine_samples_written_total",
        "Total normalized samples appended to the store"
    ))
    .unwrap();
    pub static ref PARSE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "engine_parse_failures_total",
        "Total payload fields skipped as malformed"
    ))
    .unwrap();
    pub static ref CONNECT_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "engine_connect_failures_total",
        "Total per-device MQTT connection errors"
    ))
    .unwrap();
    pub static ref UPSTREAM_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "engine_upstream_failures_total",
        "Total per-device upstream fetch failures"
    ))
    .unwrap();
    pub static ref PERSIST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "engine_persist_failures_total",
        "Total samples dropped due to store errors"
    ))
    .unwrap();
    pub static ref ALERTS_CREATED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "engine_alerts_created_total",
        "Total alerts written by the alert engine"
    ))
    .unwrap();
    pub static ref ALERTS_SUPPRESSED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "engine_alerts_suppressed_total",
        "Total threshold breaches suppressed by the debounce window"
    ))
    .unwrap();
    pub static ref POLL_CYCLE_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "engine_poll_cycle_seconds",
            "Duration of one fetch-and-persist cycle across a user's devices"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(SAMPLES_WRITTEN_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PARSE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CONNECT_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(UPSTREAM_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PERSIST_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALERTS_CREATED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALERTS_SUPPRESSED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(POLL_CYCLE_SECONDS.clone()))
        .unwrap();
}

/// Text-format dump for the host to serve from its own metrics endpoint.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
