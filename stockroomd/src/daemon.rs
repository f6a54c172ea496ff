//! Main daemon runtime.
//!
//! Wires the store into the services and runs the background workers:
//!
//! 1. Build the storefront service (rate limiter + coordinator)
//! 2. Subscribe the fee reconciler to the event bus
//! 3. Prune idle throttle keys in the background
//! 4. Wait for SIGINT or a cancelled token
//! 5. Stop the workers and wait for them

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stockroom_store::Store;

use crate::accounting::FeeReconciler;
use crate::config::Config;
use crate::error::DaemonResult;
use crate::event_bus::{DaemonEvent, EventBus};
use crate::storefront::StorefrontService;
use crate::throttle::{RateLimiter, TokenBucketLimiter};

/// Main daemon orchestrator.
pub struct Daemon<S> {
    config: Config,
    store: Arc<S>,
    event_bus: Arc<EventBus>,
    limiter: Arc<TokenBucketLimiter>,
    storefront: StorefrontService<S>,
}

impl<S: Store + 'static> Daemon<S> {
    /// Create a daemon over a store.
    pub fn new(config: Config, store: Arc<S>) -> Self {
        let limiter = Arc::new(TokenBucketLimiter::new(config.storefront.rate_limit));
        let shared: Arc<dyn RateLimiter> = Arc::<TokenBucketLimiter>::clone(&limiter);
        let storefront = StorefrontService::new(Arc::clone(&store), shared, config.storefront.clone());
        let event_bus = Arc::new(EventBus::new(config.event_bus_capacity));

        Self { config, store, event_bus, limiter, storefront }
    }

    /// Storefront order intake.
    pub fn storefront(&self) -> &StorefrontService<S> {
        &self.storefront
    }

    /// Event bus shared with the workers.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Storefront rate limiter.
    pub fn rate_limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    /// Run until SIGINT.
    pub async fn run(self) -> DaemonResult<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Received shutdown signal");
            signal.cancel();
        });

        self.run_until(shutdown).await
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run_until(self, shutdown: CancellationToken) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            "Starting Stockroom daemon"
        );

        let reconciler = FeeReconciler::new(Arc::clone(&self.store), self.config.fees.clone());
        let worker = tokio::spawn(reconciler.run(self.event_bus.subscribe(), shutdown.clone()));
        let pruner = tokio::spawn(Arc::clone(&self.limiter).run_pruner(shutdown.clone()));

        shutdown.cancelled().await;

        info!("Initiating graceful shutdown");
        self.event_bus.send(DaemonEvent::Shutdown);
        if let Err(e) = worker.await {
            error!(error = %e, "Fee reconciler task failed");
        }
        if let Err(e) = pruner.await {
            error!(error = %e, "Throttle pruner task failed");
        }

        info!("Daemon stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::OrderPaymentSucceeded;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use stockroom_domain::PaymentMethodFee;
    use stockroom_store::{BusinessRepository, MemoryStore, Transactional, TxOptions};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_daemon_records_fees_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let biz = Uuid::now_v7();
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        store
            .save_payment_method(
                &mut tx,
                &PaymentMethodFee {
                    business_id: biz,
                    descriptor: "card".into(),
                    enabled: true,
                    fee_percent: dec!(0.01),
                    fee_fixed: dec!(0),
                },
            )
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let daemon = Daemon::new(Config::test(), Arc::clone(&store));
        let bus = Arc::clone(daemon.event_bus());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run_until(shutdown.clone()));

        // Wait for the worker to subscribe
        while bus.receiver_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bus.send(DaemonEvent::OrderPaymentSucceeded(OrderPaymentSucceeded {
            business_id: biz,
            order_id: Uuid::now_v7(),
            order_total: dec!(250),
            currency: "USD".into(),
            payment_method: "card".into(),
            paid_at: Utc::now(),
        }));

        while store.expense_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(store.expense_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_prunes_idle_throttle_keys() {
        let mut config = Config::test();
        config.storefront.rate_limit.window = Duration::from_secs(5);
        let daemon = Daemon::new(config, Arc::new(MemoryStore::new()));
        let limiter = Arc::clone(daemon.rate_limiter());
        for n in 0..50 {
            limiter.allow(&format!("storefront:biz:order:10.0.0.{}", n)).await;
        }
        assert_eq!(limiter.tracked_keys(), 50);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run_until(shutdown.clone()));

        for _ in 0..30 {
            if limiter.tracked_keys() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(limiter.tracked_keys(), 0);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
