use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Failure reported by a single upstream client call.
///
/// Providers map their own failures into these variants; the engine only ever
/// distinguishes success from failure.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream rejected the call: {0}")]
    Rejected(String),

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("payload of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("attempt abandoned, the race was already decided")]
    Cancelled,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        // Request URLs carry the bot credential
        ClientError::Request(e.without_url().to_string())
    }
}

/// Failure reported by an object store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur while serving resources
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown scope: {0}")]
    UnknownScope(String),

    #[error("no clients available in scope {scope}")]
    NoClientsAvailable { scope: String },

    #[error("all {attempts} clients failed {operation}, last error from {client}: {sample}")]
    ExhaustedAllClients {
        operation: &'static str,
        attempts: usize,
        client: String,
        #[source]
        sample: ClientError,
    },

    #[error("{operation} race timed out after {elapsed:?} with {pending} attempts pending")]
    RaceTimeout {
        operation: &'static str,
        elapsed: Duration,
        pending: usize,
    },

    #[error("client {client} failed {operation}: {source}")]
    ClientFailed {
        operation: &'static str,
        client: String,
        #[source]
        source: ClientError,
    },

    #[error("scope {scope} has no upload destination configured")]
    NoStoreDestination { scope: String },

    #[error("cache read failed: {0}")]
    CacheRead(#[source] StoreError),

    #[error("cache write failed: {0}")]
    CacheWrite(#[source] StoreError),

    #[error("archive job has no items")]
    NoItems,

    #[error("archive job has {count} items, the maximum is {max}")]
    TooManyItems { count: usize, max: usize },

    #[error("archive aborted, {resource_id} in scope {scope} failed: {source}")]
    ArchiveAborted {
        scope: String,
        resource_id: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("archive job exceeded its deadline of {0:?}")]
    ArchiveTimeout(Duration),

    #[error("archive write failed: {0}")]
    ArchiveWrite(String),
}

impl EngineError {
    /// Whether repeating the same origin fetch could succeed.
    ///
    /// Request-shape and configuration errors are final; upstream failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ExhaustedAllClients { .. }
                | EngineError::RaceTimeout { .. }
                | EngineError::ClientFailed { .. }
        )
    }
}
