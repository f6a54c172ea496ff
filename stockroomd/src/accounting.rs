//! Transaction-fee reconciliation.
//!
//! When an order is paid, the payment method's fee is recorded as a
//! `transaction_fee` expense linked to the order. The expense is addressed by
//! `(business, order, category)`, so redelivered or raced payment events
//! update one row instead of adding another.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stockroom_domain::{Expense, ExpenseKey, FeeExpenseValues};
use stockroom_exec::{AtomicOptions, ExecResult, IdempotencyCoordinator, NaturalKeyUpsert};
use stockroom_store::{Store, TxOptions};

use crate::config::FeeConfig;
use crate::error::DaemonResult;
use crate::event_bus::{DaemonEvent, EventReceiver, OrderPaymentSucceeded};

/// Upsert of the fee expense of one order
struct FeeExpenseUpsert<'a, S> {
    store: &'a S,
    key: ExpenseKey,
    values: FeeExpenseValues,
}

#[async_trait]
impl<'a, S: Store> NaturalKeyUpsert<S::Tx> for FeeExpenseUpsert<'a, S> {
    type Row = Expense;

    fn natural_key(&self) -> String {
        self.key.to_string()
    }

    async fn lock_existing(&self, tx: &mut S::Tx) -> ExecResult<Option<Expense>> {
        Ok(self.store.find_for_update(tx, &self.key).await?)
    }

    async fn insert(&self, tx: &mut S::Tx) -> ExecResult<Expense> {
        let expense = Expense::for_key(&self.key, &self.values);
        self.store.insert_expense(tx, &expense).await?;
        Ok(expense)
    }

    async fn update(&self, tx: &mut S::Tx, mut existing: Expense) -> ExecResult<Expense> {
        existing.apply(&self.values);
        self.store.update_expense(tx, &existing).await?;
        Ok(existing)
    }
}

/// Records transaction fees for paid orders.
pub struct FeeReconciler<S> {
    coordinator: IdempotencyCoordinator<S>,
    config: FeeConfig,
}

impl<S> Clone for FeeReconciler<S> {
    fn clone(&self) -> Self {
        Self { coordinator: self.coordinator.clone(), config: self.config.clone() }
    }
}

impl<S: Store> FeeReconciler<S> {
    pub fn new(store: Arc<S>, config: FeeConfig) -> Self {
        Self { coordinator: IdempotencyCoordinator::new(store), config }
    }

    /// Record (or refresh) the fee expense for a paid order.
    ///
    /// Returns `None` when no fee is owed: unknown or disabled payment
    /// method, or a fee that rounds to nothing.
    pub async fn reconcile(&self, event: &OrderPaymentSucceeded) -> DaemonResult<Option<Expense>> {
        let store = self.coordinator.store();

        let mut tx = store.begin(TxOptions { read_only: true, ..Default::default() }).await?;
        let method = store.find_payment_method(&mut tx, event.business_id, &event.payment_method).await;
        store.rollback(tx).await?;

        let Some(method) = method? else {
            debug!(
                business_id = %event.business_id,
                payment_method = %event.payment_method,
                "No fee configuration for payment method"
            );
            return Ok(None);
        };

        let Some(amount) = method.fee_for(event.order_total) else {
            debug!(order_id = %event.order_id, "No transaction fee owed");
            return Ok(None);
        };

        let values =
            FeeExpenseValues::new(amount, event.currency.clone(), event.paid_at, &event.payment_method)?;
        let op = FeeExpenseUpsert {
            store: store.as_ref(),
            key: ExpenseKey::transaction_fee(event.business_id, event.order_id),
            values,
        };
        let options =
            AtomicOptions::serializable(self.config.max_retries).with_backoff(self.config.retry_backoff);
        let expense = self.coordinator.upsert_by_natural_key(options, &op).await?;

        info!(
            business_id = %event.business_id,
            order_id = %event.order_id,
            expense_id = %expense.id,
            amount = %expense.amount,
            "Transaction fee recorded"
        );
        Ok(Some(expense))
    }

    /// Consume payment events until the bus closes, a `Shutdown` event
    /// arrives, or `shutdown` is cancelled.
    ///
    /// Failures are logged per event; the loop keeps going.
    pub async fn run(self, mut events: EventReceiver, shutdown: CancellationToken) {
        info!("Fee reconciler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Fee reconciler shutdown requested");
                    break;
                }
                next = events.recv() => match next {
                    Some(Ok(DaemonEvent::OrderPaymentSucceeded(event))) => {
                        if let Err(e) = self.reconcile(&event).await {
                            error!(
                                error = %e,
                                business_id = %event.business_id,
                                order_id = %event.order_id,
                                "Failed to record transaction fee"
                            );
                        }
                    },
                    Some(Ok(DaemonEvent::Shutdown)) | None => break,
                    Some(Err(lag)) => warn!(%lag, "Fee reconciler lagged"),
                },
            }
        }
        info!("Fee reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stockroom_domain::PaymentMethodFee;
    use stockroom_store::{BusinessRepository, ExpenseRepository, MemoryStore, Transactional};
    use uuid::Uuid;

    use crate::config::Config;
    use crate::event_bus::EventBus;

    async fn store_with_method(fee: PaymentMethodFee) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        store.save_payment_method(&mut tx, &fee).await.unwrap();
        store.commit(tx).await.unwrap();
        store
    }

    fn card(business_id: Uuid, enabled: bool) -> PaymentMethodFee {
        PaymentMethodFee {
            business_id,
            descriptor: "card".to_string(),
            enabled,
            fee_percent: dec!(0.029),
            fee_fixed: dec!(0.30),
        }
    }

    fn paid(business_id: Uuid, order_id: Uuid, total: rust_decimal::Decimal) -> OrderPaymentSucceeded {
        OrderPaymentSucceeded {
            business_id,
            order_id,
            order_total: total,
            currency: "USD".to_string(),
            payment_method: "card".to_string(),
            paid_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reconcile_records_fee() {
        let biz = Uuid::now_v7();
        let store = store_with_method(card(biz, true)).await;
        let reconciler = FeeReconciler::new(Arc::clone(&store), Config::test().fees);

        let expense = reconciler.reconcile(&paid(biz, Uuid::now_v7(), dec!(100))).await.unwrap().unwrap();

        assert_eq!(expense.amount, dec!(3.20));
        assert_eq!(expense.note.as_deref(), Some("Transaction fee (card)"));
        assert_eq!(store.expense_count().await, 1);
    }

    #[tokio::test]
    async fn test_redelivered_event_updates_same_expense() {
        let biz = Uuid::now_v7();
        let order = Uuid::now_v7();
        let store = store_with_method(card(biz, true)).await;
        let reconciler = FeeReconciler::new(Arc::clone(&store), Config::test().fees);

        let first = reconciler.reconcile(&paid(biz, order, dec!(100))).await.unwrap().unwrap();
        let second = reconciler.reconcile(&paid(biz, order, dec!(200))).await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.amount, dec!(6.10));

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        let rows = store.find_expenses_by_order(&mut tx, biz, order).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, dec!(6.10));
    }

    #[tokio::test]
    async fn test_no_expense_without_fee() {
        let biz = Uuid::now_v7();
        let store = store_with_method(card(biz, false)).await;
        let reconciler = FeeReconciler::new(Arc::clone(&store), Config::test().fees);

        // Disabled method
        assert!(reconciler.reconcile(&paid(biz, Uuid::now_v7(), dec!(100))).await.unwrap().is_none());

        // Unknown method
        let mut event = paid(biz, Uuid::now_v7(), dec!(100));
        event.payment_method = "cash".to_string();
        assert!(reconciler.reconcile(&event).await.unwrap().is_none());

        assert_eq!(store.expense_count().await, 0);
    }

    #[tokio::test]
    async fn test_sub_cent_fee_records_nothing() {
        let biz = Uuid::now_v7();
        let mut method = card(biz, true);
        method.fee_fixed = dec!(0);
        let store = store_with_method(method).await;
        let reconciler = FeeReconciler::new(Arc::clone(&store), Config::test().fees);

        let result = reconciler.reconcile(&paid(biz, Uuid::now_v7(), dec!(0.10))).await.unwrap();

        assert!(result.is_none());
        assert_eq!(store.expense_count().await, 0);
    }

    #[tokio::test]
    async fn test_worker_consumes_bus_until_shutdown() {
        let biz = Uuid::now_v7();
        let store = store_with_method(card(biz, true)).await;
        let reconciler = FeeReconciler::new(Arc::clone(&store), Config::test().fees);
        let bus = EventBus::new(16);
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn(reconciler.run(bus.subscribe(), shutdown.clone()));

        bus.send(DaemonEvent::OrderPaymentSucceeded(paid(biz, Uuid::now_v7(), dec!(50))));
        bus.send(DaemonEvent::OrderPaymentSucceeded(paid(biz, Uuid::now_v7(), dec!(80))));
        bus.send(DaemonEvent::Shutdown);

        worker.await.unwrap();
        assert_eq!(store.expense_count().await, 2);
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = FeeReconciler::new(store, Config::test().fees);
        let bus = EventBus::new(4);
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn(reconciler.run(bus.subscribe(), shutdown.clone()));
        shutdown.cancel();

        worker.await.unwrap();
    }
}
