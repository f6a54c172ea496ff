//! Execution layer error types.

use stockroom_domain::DomainError;
use stockroom_store::StoreError;
use thiserror::Error;

/// Errors that can occur while coordinating an idempotent mutation.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The dedupe key was already used with a different payload
    #[error("Idempotency key {dedupe_key} was reused with a different payload")]
    ConflictingPayload {
        /// Offending key
        dedupe_key: String,
    },

    /// Another attempt owns the dedupe key and has not finished
    #[error("Request with idempotency key {dedupe_key} is already processing")]
    InProgress {
        /// Key being processed
        dedupe_key: String,
    },

    /// Transient conflicts persisted past the retry budget
    #[error("Transaction failed after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Attempts made (`max_retries + 1`)
        attempts: u32,
        /// Last transient failure
        #[source]
        source: StoreError,
    },

    /// Storage failure (non-transient once it leaves the engine)
    #[error("Store error: {0}")]
    Transport(#[from] StoreError),

    /// Domain validation failure inside the unit of work
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The storage layer contradicted itself (e.g. reported a duplicate that
    /// cannot be read back)
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
