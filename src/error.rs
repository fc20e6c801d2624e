// Error taxonomy shared by the job scheduler and all pipeline handlers.
//
// Every failure that crosses a component boundary is classified into one
// of these kinds; the scheduler uses the classification to decide between
// retry, drop and defer.

use thiserror::Error;

/// Errors produced by jobs, pipelines and persisted-state handling.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input. Permanent: the job is dropped and logged.
    #[error("bad job: {0}")]
    BadJob(String),

    /// Network, timeout or temporary storage failure. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// HTTP 429, unsupported content type, download limit exceeded.
    /// The attempt is aborted and never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Queue or buffer saturation. The caller is notified; the item may
    /// be dropped.
    #[error("overflow: {0}")]
    Overflow(String),

    /// Persisted-state schema mismatch or impossible timestamps. The
    /// corrupted state is dropped and reinitialized.
    #[error("corrupted state: {0}")]
    Corruption(String),

    /// Operation refused because a rate limit or TTL has not elapsed.
    #[error("cooldown: {0}")]
    Cooldown(String),
}

impl Error {
    /// Whether the scheduler should retry a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Cooldown(_))
    }

    /// Shorthand for wrapping a storage or I/O failure.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Error::Transient(err.to_string())
    }

    /// Shorthand for wrapping a persisted-state decode failure.
    pub fn corruption(err: impl std::fmt::Display) -> Self {
        Error::Corruption(err.to_string())
    }
}

/// Result alias used by job handlers and pipelines.
pub type Result<T, E = Error> = std::result::Result<T, E>;
