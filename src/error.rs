use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),

    #[error("Playback not supported: {0}")]
    NotSupported(String),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend rejected request [{status}]: {body}")]
    Backend { status: u16, body: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
