//! Stockroom Daemon Library
//!
//! Call sites of the idempotent mutation coordinator.
//!
//! # Architecture
//!
//! ```text
//! Storefront request → StorefrontService → IdempotencyCoordinator → Store
//!                          ↑ RateLimiter
//!
//! Payment event → EventBus → FeeReconciler → natural-key upsert → Store
//! ```
//!
//! # Components
//!
//! - **StorefrontService**: public order intake keyed by `Idempotency-Key`
//! - **FeeReconciler**: transaction-fee expenses keyed by order
//! - **Event Bus**: in-process delivery of payment events
//! - **Daemon**: wires the services and runs the workers
//! - **Config**: environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stockroom_store::MemoryStore;
//! use stockroomd::{Config, Daemon};
//!
//! let daemon = Daemon::new(Config::test(), Arc::new(MemoryStore::new()));
//! let response = daemon
//!     .storefront()
//!     .create_pending_order("demo-shop", Some("abc"), "10.0.0.1", &request)
//!     .await?;
//! ```

#![warn(clippy::all)]

pub mod accounting;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod event_bus;
pub mod storefront;
pub mod throttle;

// Re-exports for convenience
pub use accounting::FeeReconciler;
pub use config::{Config, DatabaseConfig, Environment, FeeConfig, RateLimitConfig, StorefrontConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult, ServiceError, ServiceResult};
pub use event_bus::{DaemonEvent, EventBus, EventReceiver, OrderPaymentSucceeded};
pub use storefront::{
    CreateOrderRequest, CreateOrderResponse, OrderCustomer, OrderLine, ShippingAddress,
    StorefrontService,
};
pub use throttle::{RateLimiter, TokenBucketLimiter, Unlimited};
