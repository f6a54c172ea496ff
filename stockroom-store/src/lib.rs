//! Stockroom Storage Layer
//!
//! Transactional persistence for the dedupe ledger and the tenant-scoped
//! entities idempotent mutations touch.
//!
//! # Architecture
//!
//! - **Repository traits**: Define the storage interface (ports)
//! - **In-memory store**: Fast implementation for testing
//! - **PostgreSQL store**: Production implementation (feature `postgres`)
//!
//! # Usage
//!
//! ```rust
//! use stockroom_store::{MemoryStore, LedgerRepository, Transactional, TxOptions};
//! use stockroom_domain::Fingerprint;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     let scope = Uuid::now_v7();
//!
//!     let mut tx = store.begin(TxOptions::default()).await.unwrap();
//!     let record = store
//!         .create_record(&mut tx, scope, "checkout-42", Fingerprint::from_bytes([0; 32]))
//!         .await
//!         .unwrap();
//!     store.commit(tx).await.unwrap();
//!
//!     println!("In-flight record: {}", record.id);
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

// Re-exports
pub use error::StoreError;
pub use memory::{MemoryStore, MemoryTx};
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use repository::{
    BusinessRepository, CustomerRepository, ExpenseRepository, InventoryRepository,
    IsolationLevel, LedgerRepository, OrderRepository, Store, Transactional, TxOptions,
};
