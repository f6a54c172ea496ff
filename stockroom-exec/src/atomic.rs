//! Atomic Execution Engine.
//!
//! Runs a unit of work inside one storage transaction. Transient conflicts
//! (serialization failure, deadlock, lock timeout) discard the transaction
//! and re-run the whole unit from scratch, up to `max_retries` extra times.
//!
//! # Flow
//!
//! ```text
//! BEGIN → unit of work → COMMIT
//!   ↑          │            │
//!   └─ retry ←─┴─ conflict ─┘
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use stockroom_store::{IsolationLevel, StoreError, Transactional, TxOptions};

use crate::error::{ExecError, ExecResult};

// =============================================================================
// Options
// =============================================================================

/// Transaction and retry settings for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicOptions {
    /// Isolation level of every attempt
    pub isolation: IsolationLevel,
    /// Open read-only transactions
    pub read_only: bool,
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Base delay between attempts; attempt `n` waits `n * retry_backoff`
    pub retry_backoff: Duration,
}

impl Default for AtomicOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Default,
            read_only: false,
            max_retries: 0,
            retry_backoff: Duration::ZERO,
        }
    }
}

impl AtomicOptions {
    /// Serializable read-write transaction with a retry budget
    pub fn serializable(max_retries: u32) -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            max_retries,
            ..Default::default()
        }
    }

    /// Single-attempt read-only transaction
    pub fn read_only() -> Self {
        Self { read_only: true, ..Default::default() }
    }

    /// Set the base backoff between attempts
    pub fn with_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    fn tx_options(&self) -> TxOptions {
        TxOptions { isolation: self.isolation, read_only: self.read_only }
    }
}

// =============================================================================
// Unit of work
// =============================================================================

/// Work executed inside a transaction.
///
/// Must be safe to re-run from scratch: every effect goes through `tx`, which
/// is discarded on failure.
#[async_trait]
pub trait UnitOfWork<Tx: Send>: Send + Sync {
    /// Value produced on success
    type Output: Send;

    /// Run against an open transaction
    async fn run(&self, tx: &mut Tx) -> ExecResult<Self::Output>;
}

// =============================================================================
// Executor
// =============================================================================

/// Why one attempt failed
enum AttemptError {
    /// Worth re-running the whole transaction
    Transient(StoreError),
    /// Give up immediately
    Fatal(ExecError),
}

/// Runs units of work atomically against a transactional store.
pub struct AtomicExecutor<S> {
    store: Arc<S>,
}

impl<S> Clone for AtomicExecutor<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<S: Transactional> AtomicExecutor<S> {
    /// Create an executor over a store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Execute `work` in a transaction, retrying on transient conflicts.
    ///
    /// # Errors
    ///
    /// - `RetryExhausted` after `max_retries + 1` conflicting attempts
    /// - `Transport` for any non-transient storage failure
    /// - whatever non-storage error the unit of work returns
    pub async fn execute<W>(&self, options: AtomicOptions, work: &W) -> ExecResult<W::Output>
    where
        W: UnitOfWork<S::Tx> + ?Sized,
    {
        let max_attempts = options.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.attempt(options, work).await {
                Ok(output) => {
                    if attempt > 1 {
                        debug!(attempt, "Transaction succeeded after retry");
                    }
                    return Ok(output);
                },
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(err)) => {
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %err, "Transaction retries exhausted");
                        return Err(ExecError::RetryExhausted { attempts: attempt, source: err });
                    }

                    debug!(attempt, max_attempts, error = %err, "Transient conflict, retrying");

                    let delay = options.retry_backoff * attempt;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
    }

    async fn attempt<W>(&self, options: AtomicOptions, work: &W) -> Result<W::Output, AttemptError>
    where
        W: UnitOfWork<S::Tx> + ?Sized,
    {
        let mut tx = self.store.begin(options.tx_options()).await.map_err(|e| self.classify(e))?;

        match work.run(&mut tx).await {
            Ok(output) => {
                self.store.commit(tx).await.map_err(|e| self.classify(e))?;
                Ok(output)
            },
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    debug!(error = %rollback_err, "Rollback failed");
                }
                match err {
                    ExecError::Transport(store_err) => Err(self.classify(store_err)),
                    other => Err(AttemptError::Fatal(other)),
                }
            },
        }
    }

    fn classify(&self, err: StoreError) -> AttemptError {
        if self.store.is_serialization_conflict(&err) {
            AttemptError::Transient(err)
        } else {
            AttemptError::Fatal(ExecError::Transport(err))
        }
    }
}
