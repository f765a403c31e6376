use miette::Diagnostic;
use thiserror::Error;

/// Failure modes of a single retrieval. Cloneable so a completed outcome can
/// be shared among every caller waiting on the same transfer.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum RetrievalError {
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server returned status {status}: {message}")]
    Protocol { status: u16, message: String },

    #[error("i/o error: {0}")]
    Io(String),

    #[error("retrieval cancelled: {0}")]
    Cancelled(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(String),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}

/// Cache failures are kept as their own type so they can never be confused
/// with a fetch failure. Callers collapse them to "no cache entry".
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);
