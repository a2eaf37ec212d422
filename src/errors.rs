use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Unsupported TLD: {0}")]
    UnsupportedTld(String),

    #[error("Network timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited by registry (HTTP 429)")]
    RateLimited,

    #[error("Registry returned HTTP {status}")]
    TransportStatus { status: u16, body: String },

    #[error("Empty WHOIS response")]
    EmptyResponse,

    #[error("Malformed RDAP body: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Notifier error: {0}")]
    Notifier(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::time::error::Elapsed> for MonitorError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MonitorError::Timeout
    }
}
