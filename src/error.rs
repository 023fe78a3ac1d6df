//! Error types for limitkit.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for limiter operations.
///
/// Some variants travel with an implicit admission decision. Always inspect
/// the error before trusting the boolean a limiter would otherwise return;
/// [`LimiterError::implies_limited`] recovers that pairing.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// `decr` drove an active counter below zero. The counter is left negative.
    #[error("{limiter}.decr called without a matching successful limit")]
    Misuse {
        /// Name of the limiter that detected the underflow
        limiter: &'static str,
    },

    /// The bucket limiter has been closed and no longer admits traffic
    #[error("limiter has been closed")]
    Closed,

    /// The caller's deadline lapsed while waiting for admission
    #[error("deadline elapsed while waiting for a token")]
    Cancelled,

    /// The replenishment task for a bucket was already started
    #[error("replenishment task already started")]
    AlreadyStarted,

    /// The replenishment task panicked or was aborted
    #[error("replenishment task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Failure talking to the shared store, passed through untouched
    #[error(transparent)]
    Backend(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// The `limited` flag that accompanies this error.
    ///
    /// A lapsed deadline means the caller was held back, so it reports
    /// limited. Everything else (closed, misuse, backend failure) reports
    /// not limited, which callers must read as "decision unknown".
    pub fn implies_limited(&self) -> bool {
        matches!(self, LimiterError::Cancelled)
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
