use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connect(#[from] rumqttc::ConnectionError),

    #[error("upstream fetch error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("device {0} not found")]
    DeviceNotFound(i64),

    #[error("publish to device {0} timed out")]
    PublishTimeout(i64),
}

pub type Result<T> = std::result::Result<T, Error>;
