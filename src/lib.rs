//! Environmental telemetry ingestion and alerting engine.
//!
//! The engine maintains one standing MQTT subscription per registered device
//! (push path) and one repeating upstream fetch timer per user (poll path).
//! Both paths feed the same pipeline: provider payloads are normalized into
//! canonical samples, appended to the store, and each written sample is
//! evaluated against static safety thresholds. Threshold breaches raise
//! WARNING/DANGER alerts, debounced per (user, metric) by a suppression
//! window.
//!
//! The engine has no surface of its own; the host backend constructs an
//! [`IngestionEngine`] at startup, calls [`IngestionEngine::activate`] when a
//! user signs in, and calls [`IngestionEngine::shutdown`] at process exit.

pub mod alerts;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod poller;
pub mod pool;
pub mod service;
pub mod store;
pub mod upstream;

pub use config::EngineConfig;
pub use errors::{Error, Result};
pub use service::IngestionEngine;
