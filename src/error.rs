use thiserror::Error;

/// Errors surfaced by the metering engine and its collaborators.
#[derive(Debug, Error)]
pub enum MeterError {
    /// The counter dump could not be fetched; the cycle is skipped.
    #[error("counter source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// A peer gate primitive (`remove` / `resync_all`) failed.
    #[error("peer gate {op} failed: {message}")]
    GateFailed { op: &'static str, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The writer thread is gone or its queue is full.
    #[error("store writer unavailable: {0}")]
    WriterUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MeterError>;
