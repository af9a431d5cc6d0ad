/// Error types for the sync client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not authenticated: {0}")]
    Unauthorized(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return SyncError::Timeout(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                SyncError::Unauthorized(e.to_string())
            }
            Some(status) => SyncError::Api {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => SyncError::Http(e.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Connection(e.to_string())
    }
}

impl SyncError {
    /// Whether this error ends the authenticated session
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
