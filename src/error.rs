//! Error types for the scoring pipeline

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the scoring pipeline
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing weights for scoring model '{0}'")]
    MissingWeights(String),

    #[error("Invalid mint address: {0}")]
    InvalidMint(String),

    // Upstream errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream timeout after {0}ms")]
    UpstreamTimeout(u64),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnection(String),

    #[error("Upstream returned no data for {0}")]
    NoData(String),

    #[error("Circuit open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },

    // Pipeline errors
    #[error("Token not found: {0}")]
    TokenNotFound(String),

    #[error("Token already archived: {0}")]
    TokenArchived(String),

    #[error("Token already in flight: {0}")]
    AlreadyInFlight(String),

    #[error("Illegal status transition for {mint}: {from} -> {to}")]
    IllegalTransition {
        mint: String,
        from: String,
        to: String,
    },

    #[error("Cycle skipped for {mint}: {reason}")]
    CycleSkipped { mint: String, reason: String },

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    // Persistence errors
    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Out-of-order snapshot for {mint}")]
    OutOfOrderSnapshot { mint: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::UpstreamTimeout(_) | Error::UpstreamConnection(_)
        )
    }

    /// Check if this error counts against the circuit breaker
    pub fn is_upstream_failure(&self) -> bool {
        self.is_retryable() || matches!(self, Error::Serialization(_))
    }
}

// The URL is dropped first: request URLs can carry API keys
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let e = e.without_url();
        if e.is_timeout() {
            Error::UpstreamTimeout(0)
        } else if e.is_connect() {
            Error::UpstreamConnection(e.to_string())
        } else if e.is_decode() {
            Error::Serialization(e.to_string())
        } else {
            Error::Upstream(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
