//! Error types shared by the ingestion control plane.
//!
//! Every failure carries an explicit [`ErrorKind`]. The retry executor and the
//! orchestrator branch on the kind only, never on messages.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification used for retry decisions, metrics labels and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimited,
    Server,
    Client,
    Validation,
    QuotaExceeded,
    StorageConflict,
    Storage,
    CircuitOpen,
    Cache,
    Config,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed if the same call is repeated.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network
                | ErrorKind::RateLimited
                | ErrorKind::Server
                | ErrorKind::StorageConflict
                | ErrorKind::Storage
        )
    }

    /// Failures that never reached the provider (local budget or gate refusals).
    pub fn is_local_refusal(self) -> bool {
        matches!(self, ErrorKind::QuotaExceeded | ErrorKind::CircuitOpen)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Validation => "validation",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::StorageConflict => "storage_conflict",
            ErrorKind::Storage => "storage",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Cache => "cache",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a raw provider payload is rejected before it can be stored.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("no schema registered for data type '{0}'")]
    UnknownDataType(String),

    #[error("missing required field '{field}'")]
    MissingField { field: String },

    #[error("field '{field}' is empty")]
    EmptyField { field: String },

    #[error("field '{field}' has wrong type: expected {expected}")]
    WrongType { field: String, expected: &'static str },

    #[error("field '{field}' = {value} is outside [{min:?}, {max:?}]")]
    OutOfBounds {
        field: String,
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    },

    #[error("field '{field}' ({value}) is in the future")]
    FutureDate { field: String, value: String },

    #[error("field '{field}' ({value}) predates provider epoch {epoch}")]
    BeforeEpoch {
        field: String,
        value: String,
        epoch: String,
    },

    #[error("quality score {score:.2} below minimum {min:.2}")]
    LowQuality { score: f64, min: f64 },
}

/// Main error type for the ingestion pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("server error {status} from {provider}")]
    Server { provider: String, status: u16 },

    #[error("client error {status} from {provider}: {message}")]
    Client {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("daily quota of {limit} calls exhausted for provider {provider}")]
    QuotaExceeded { provider: String, limit: u32 },

    #[error("storage conflict on {key}")]
    StorageConflict { key: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("circuit open for provider {provider} (retry in {retry_in:?})")]
    CircuitOpen { provider: String, retry_in: Duration },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Network(_) => ErrorKind::Network,
            IngestError::RateLimited { .. } => ErrorKind::RateLimited,
            IngestError::Server { .. } => ErrorKind::Server,
            IngestError::Client { .. } => ErrorKind::Client,
            IngestError::Validation(_) => ErrorKind::Validation,
            IngestError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            IngestError::StorageConflict { .. } => ErrorKind::StorageConflict,
            IngestError::Storage(_) => ErrorKind::Storage,
            IngestError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            IngestError::Cache(_) => ErrorKind::Cache,
            IngestError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Provider-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            IngestError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Terminal failure of one logical operation after the retry policy gave up.
#[derive(Debug, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct FinalError {
    pub error: IngestError,
    pub attempts: u32,
    /// True when retries ran out; false when the error was fatal on sight.
    pub exhausted: bool,
}

impl FinalError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
