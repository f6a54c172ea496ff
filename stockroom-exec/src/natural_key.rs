//! Natural-key upsert.
//!
//! For mutations whose identity is a business tuple rather than a client
//! token, the domain row itself is the dedupe record:
//!
//! 1. locking read by natural key
//! 2. found → update it
//! 3. not found → insert
//! 4. insert lost a race (unique violation) → locking read again, update
//!
//! Concurrent callers converge on one row; the last committed writer's
//! values win.

use async_trait::async_trait;
use tracing::debug;

use stockroom_store::Transactional;

use crate::atomic::{AtomicOptions, UnitOfWork};
use crate::coordinator::IdempotencyCoordinator;
use crate::error::{ExecError, ExecResult};

/// A row addressed by a natural key, with its insert and update paths.
#[async_trait]
pub trait NaturalKeyUpsert<Tx: Send>: Send + Sync {
    /// Row type returned to the caller
    type Row: Send;

    /// Printable natural key (for logs and errors)
    fn natural_key(&self) -> String;

    /// Read the row under a row lock (`SELECT ... FOR UPDATE`)
    async fn lock_existing(&self, tx: &mut Tx) -> ExecResult<Option<Self::Row>>;

    /// Insert a fresh row; a taken key must surface as a unique violation
    async fn insert(&self, tx: &mut Tx) -> ExecResult<Self::Row>;

    /// Overwrite the mutable fields of `existing`
    async fn update(&self, tx: &mut Tx, existing: Self::Row) -> ExecResult<Self::Row>;
}

struct Upsert<'a, S: ?Sized, O: ?Sized> {
    store: &'a S,
    op: &'a O,
}

#[async_trait]
impl<'a, S, O> UnitOfWork<S::Tx> for Upsert<'a, S, O>
where
    S: Transactional + ?Sized,
    O: NaturalKeyUpsert<S::Tx> + ?Sized,
{
    type Output = O::Row;

    async fn run(&self, tx: &mut S::Tx) -> ExecResult<O::Row> {
        if let Some(existing) = self.op.lock_existing(tx).await? {
            return self.op.update(tx, existing).await;
        }

        match self.op.insert(tx).await {
            Ok(row) => Ok(row),
            Err(ExecError::Transport(err)) if self.store.is_unique_violation(&err) => {
                let key = self.op.natural_key();
                debug!(natural_key = %key, "Insert lost race, updating winner's row");
                let existing = self.op.lock_existing(tx).await?.ok_or_else(|| {
                    ExecError::Invariant(format!(
                        "natural key {} reported as duplicate but not found",
                        key
                    ))
                })?;
                self.op.update(tx, existing).await
            },
            Err(err) => Err(err),
        }
    }
}

impl<S: Transactional> IdempotencyCoordinator<S> {
    /// Insert-or-update the row addressed by `op`'s natural key.
    ///
    /// Runs in one transaction of the engine with `options` (callers use
    /// `Serializable` with a retry budget).
    pub async fn upsert_by_natural_key<O>(&self, options: AtomicOptions, op: &O) -> ExecResult<O::Row>
    where
        O: NaturalKeyUpsert<S::Tx> + ?Sized,
    {
        let upsert = Upsert { store: self.executor().store().as_ref(), op };
        self.executor().execute(options, &upsert).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::FaultInjectingStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use stockroom_domain::{Expense, ExpenseKey, FeeExpenseValues};
    use stockroom_store::{ExpenseRepository, MemoryStore, MemoryTx, TxOptions};
    use uuid::Uuid;

    /// Fee expense upsert against the in-memory store
    struct FeeUpsert {
        store: Arc<MemoryStore>,
        key: ExpenseKey,
        values: FeeExpenseValues,
    }

    impl FeeUpsert {
        fn new(store: &Arc<MemoryStore>, key: ExpenseKey, amount: Decimal) -> Self {
            let values = FeeExpenseValues::new(amount, "USD", Utc::now(), "card").unwrap();
            Self { store: Arc::clone(store), key, values }
        }
    }

    #[async_trait]
    impl NaturalKeyUpsert<MemoryTx> for FeeUpsert {
        type Row = Expense;

        fn natural_key(&self) -> String {
            self.key.to_string()
        }

        async fn lock_existing(&self, tx: &mut MemoryTx) -> ExecResult<Option<Expense>> {
            Ok(self.store.find_for_update(tx, &self.key).await?)
        }

        async fn insert(&self, tx: &mut MemoryTx) -> ExecResult<Expense> {
            let expense = Expense::for_key(&self.key, &self.values);
            self.store.insert_expense(tx, &expense).await?;
            Ok(expense)
        }

        async fn update(&self, tx: &mut MemoryTx, mut existing: Expense) -> ExecResult<Expense> {
            existing.apply(&self.values);
            self.store.update_expense(tx, &existing).await?;
            Ok(existing)
        }
    }

    /// Same upsert, but the locking read goes through the fault injector
    struct HiddenFeeUpsert {
        inner: FeeUpsert,
        stub: Arc<FaultInjectingStore<MemoryStore>>,
    }

    #[async_trait]
    impl NaturalKeyUpsert<MemoryTx> for HiddenFeeUpsert {
        type Row = Expense;

        fn natural_key(&self) -> String {
            self.inner.natural_key()
        }

        async fn lock_existing(&self, tx: &mut MemoryTx) -> ExecResult<Option<Expense>> {
            Ok(self.stub.find_for_update(tx, &self.inner.key).await?)
        }

        async fn insert(&self, tx: &mut MemoryTx) -> ExecResult<Expense> {
            self.inner.insert(tx).await
        }

        async fn update(&self, tx: &mut MemoryTx, existing: Expense) -> ExecResult<Expense> {
            self.inner.update(tx, existing).await
        }
    }

    async fn all_expenses(store: &MemoryStore, key: &ExpenseKey) -> Vec<Expense> {
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        store.find_expenses_by_order(&mut tx, key.business_id, key.order_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_then_update_same_row() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let key = ExpenseKey::transaction_fee(Uuid::now_v7(), Uuid::now_v7());

        let first = coordinator
            .upsert_by_natural_key(AtomicOptions::serializable(3), &FeeUpsert::new(&store, key, dec!(3.88)))
            .await
            .unwrap();
        let second = coordinator
            .upsert_by_natural_key(AtomicOptions::serializable(3), &FeeUpsert::new(&store, key, dec!(4.10)))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let rows = all_expenses(&store, &key).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, dec!(4.10));
    }

    #[tokio::test]
    async fn test_lost_insert_race_updates_winner() {
        let memory = Arc::new(MemoryStore::new());
        let stub = Arc::new(FaultInjectingStore::new(Arc::clone(&memory)));
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&stub));
        let key = ExpenseKey::transaction_fee(Uuid::now_v7(), Uuid::now_v7());

        coordinator
            .upsert_by_natural_key(AtomicOptions::serializable(3), &FeeUpsert::new(&memory, key, dec!(1)))
            .await
            .unwrap();

        // Locking read misses once, so the insert collides with the row above
        stub.hide_next_lookups(1);
        let op = HiddenFeeUpsert { inner: FeeUpsert::new(&memory, key, dec!(2)), stub: Arc::clone(&stub) };
        let row = coordinator.upsert_by_natural_key(AtomicOptions::serializable(3), &op).await.unwrap();

        assert_eq!(row.amount, dec!(2));
        let rows = all_expenses(&memory, &key).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, dec!(2));
    }

    #[tokio::test]
    async fn test_duplicate_without_row_is_invariant_violation() {
        let memory = Arc::new(MemoryStore::new());
        let stub = Arc::new(FaultInjectingStore::new(Arc::clone(&memory)));
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&stub));
        let key = ExpenseKey::transaction_fee(Uuid::now_v7(), Uuid::now_v7());

        coordinator
            .upsert_by_natural_key(AtomicOptions::serializable(3), &FeeUpsert::new(&memory, key, dec!(1)))
            .await
            .unwrap();

        stub.hide_next_lookups(2);
        let op = HiddenFeeUpsert { inner: FeeUpsert::new(&memory, key, dec!(2)), stub: Arc::clone(&stub) };
        let err = coordinator.upsert_by_natural_key(AtomicOptions::serializable(3), &op).await.unwrap_err();

        assert!(matches!(err, ExecError::Invariant(_)));
        assert_eq!(all_expenses(&memory, &key).await[0].amount, dec!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_converge_on_one_row() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let key = ExpenseKey::transaction_fee(Uuid::now_v7(), Uuid::now_v7());

        let amounts: Vec<Decimal> = (1..=12).map(Decimal::from).collect();
        let mut handles = Vec::new();
        for amount in amounts.clone() {
            let coordinator = coordinator.clone();
            let op = FeeUpsert::new(&store, key, amount);
            handles.push(tokio::spawn(async move {
                coordinator.upsert_by_natural_key(AtomicOptions::serializable(3), &op).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let rows = all_expenses(&store, &key).await;
        assert_eq!(rows.len(), 1);
        assert!(amounts.contains(&rows[0].amount));
        assert_eq!(store.expense_count().await, 1);
    }
}
