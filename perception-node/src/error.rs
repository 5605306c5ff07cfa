use thiserror::Error;

#[derive(Error, Debug)]
pub enum PerceptionError {
    #[error("Camera error: {0}")]
    CameraError(String),

    #[error("Inference error: {0}")]
    InferenceError(String),

    #[error("Messaging error: {0}")]
    MessagingError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<redis::RedisError> for PerceptionError {
    fn from(error: redis::RedisError) -> Self {
        PerceptionError::MessagingError(error.to_string())
    }
}

impl From<reqwest::Error> for PerceptionError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            PerceptionError::Timeout(error.to_string())
        } else {
            PerceptionError::RegistryError(error.to_string())
        }
    }
}

impl From<config::ConfigError> for PerceptionError {
    fn from(error: config::ConfigError) -> Self {
        PerceptionError::ConfigError(error.to_string())
    }
}

impl From<serde_json::Error> for PerceptionError {
    fn from(error: serde_json::Error) -> Self {
        PerceptionError::SerializationError(error.to_string())
    }
}

impl From<image::ImageError> for PerceptionError {
    fn from(error: image::ImageError) -> Self {
        PerceptionError::InferenceError(error.to_string())
    }
}

impl From<prometheus::Error> for PerceptionError {
    fn from(error: prometheus::Error) -> Self {
        PerceptionError::ConfigError(format!("metrics: {}", error))
    }
}

impl From<tokio::time::error::Elapsed> for PerceptionError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        PerceptionError::Timeout(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PerceptionError>;
