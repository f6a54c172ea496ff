//! Stockroom Execution Layer
//!
//! Runs side-effecting writes at most once per logical request.
//!
//! # Architecture
//!
//! ```text
//! Caller → IdempotencyCoordinator → AtomicExecutor → Store (transaction)
//!                 │                        │
//!           dedupe ledger            retry on conflict
//! ```
//!
//! # Components
//!
//! - **Fingerprint**: Stable digest of a request payload
//! - **Atomic Execution Engine**: Transaction + bounded retry on transient conflicts
//! - **Coordinator**: Race resolution over the dedupe ledger (`run_idempotent`)
//! - **Natural key**: Lock/insert/update convergence (`upsert_by_natural_key`)
//! - **Stub**: Fault-injecting store for tests
//!
//! # Example
//!
//! ```rust,ignore
//! use stockroom_exec::{AtomicOptions, IdempotencyCoordinator, MutationDescriptor};
//! use stockroom_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let coordinator = IdempotencyCoordinator::new(Arc::new(MemoryStore::new()));
//! let descriptor = MutationDescriptor::for_key(business_id, &key, fingerprint);
//!
//! let outcome = coordinator
//!     .run_idempotent(&descriptor, AtomicOptions::serializable(2), &create_order)
//!     .await?;
//! let order_id = outcome.into_result(&descriptor)?;
//! ```

#![warn(clippy::all)]

pub mod atomic;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod natural_key;
pub mod stub;

// Re-exports for convenience
pub use atomic::{AtomicExecutor, AtomicOptions, UnitOfWork};
pub use coordinator::{IdempotencyCoordinator, MutationDescriptor, Outcome};
pub use error::{ExecError, ExecResult};
pub use fingerprint::{canonical_json, fingerprint, stable_json, FingerprintBuilder};
pub use natural_key::NaturalKeyUpsert;
pub use stub::FaultInjectingStore;
