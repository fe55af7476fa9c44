use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Hardware fault: {0}")]
    HardwareFault(String),
    #[error("Timed out waiting for {operation} after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<std::io::Error> for ScanError {
    fn from(source: std::io::Error) -> Self {
        ScanError::Io {
            source,
            context: "I/O operation failed".to_string(),
        }
    }
}
