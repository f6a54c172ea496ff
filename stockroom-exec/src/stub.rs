//! Fault-injecting store for testing.
//!
//! Wraps a real store and, on demand, simulates what a contended database
//! does: serialization conflicts at `BEGIN` or `COMMIT`, and a lookup that
//! misses a row committed by a concurrent writer (which forces the
//! duplicate-on-insert path of race resolution).

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use stockroom_domain::{BusinessId, DedupeRecord, Expense, ExpenseKey, Fingerprint, OrderId};
use stockroom_store::{
    ExpenseRepository, LedgerRepository, StoreError, Transactional, TxOptions,
};

/// Store wrapper with injectable transient failures.
pub struct FaultInjectingStore<S> {
    inner: Arc<S>,
    begin_conflicts: AtomicU32,
    commit_conflicts: AtomicU32,
    hidden_lookups: AtomicU32,
    begins: AtomicU32,
    commits: AtomicU32,
}

/// Take one unit from a counter, if any is left. `u32::MAX` never runs out.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
            0 => None,
            u32::MAX => Some(u32::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

impl<S> FaultInjectingStore<S> {
    /// Wrap a store with no faults configured.
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            begin_conflicts: AtomicU32::new(0),
            commit_conflicts: AtomicU32::new(0),
            hidden_lookups: AtomicU32::new(0),
            begins: AtomicU32::new(0),
            commits: AtomicU32::new(0),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Fail the next `n` `begin` calls with a serialization conflict.
    pub fn conflict_on_begin(&self, n: u32) {
        self.begin_conflicts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commits with a serialization conflict.
    pub fn conflict_on_commit(&self, n: u32) {
        self.commit_conflicts.store(n, Ordering::SeqCst);
    }

    /// Fail every commit with a serialization conflict.
    pub fn always_conflict_on_commit(&self) {
        self.commit_conflicts.store(u32::MAX, Ordering::SeqCst);
    }

    /// Make the next `n` ledger lookups or locking reads report nothing.
    pub fn hide_next_lookups(&self, n: u32) {
        self.hidden_lookups.store(n, Ordering::SeqCst);
    }

    /// Number of `begin` calls, failed ones included.
    pub fn begin_count(&self) -> u32 {
        self.begins.load(Ordering::SeqCst)
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: Transactional> Transactional for FaultInjectingStore<S> {
    type Tx = S::Tx;

    async fn begin(&self, options: TxOptions) -> Result<S::Tx, StoreError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        if take(&self.begin_conflicts) {
            debug!("Injecting serialization conflict at begin");
            return Err(StoreError::SerializationConflict("injected at begin".to_string()));
        }
        self.inner.begin(options).await
    }

    async fn commit(&self, tx: S::Tx) -> Result<(), StoreError> {
        if take(&self.commit_conflicts) {
            debug!("Injecting serialization conflict at commit");
            self.inner.rollback(tx).await?;
            return Err(StoreError::SerializationConflict("injected at commit".to_string()));
        }
        self.inner.commit(tx).await?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx: S::Tx) -> Result<(), StoreError> {
        self.inner.rollback(tx).await
    }

    fn is_unique_violation(&self, err: &StoreError) -> bool {
        self.inner.is_unique_violation(err)
    }

    fn is_serialization_conflict(&self, err: &StoreError) -> bool {
        self.inner.is_serialization_conflict(err)
    }
}

#[async_trait]
impl<S: LedgerRepository> LedgerRepository for FaultInjectingStore<S> {
    async fn create_record(
        &self,
        tx: &mut S::Tx,
        scope: BusinessId,
        dedupe_key: &str,
        fingerprint: Fingerprint,
    ) -> Result<DedupeRecord, StoreError> {
        self.inner.create_record(tx, scope, dedupe_key, fingerprint).await
    }

    async fn find_record(
        &self,
        tx: &mut S::Tx,
        scope: BusinessId,
        dedupe_key: &str,
    ) -> Result<Option<DedupeRecord>, StoreError> {
        if take(&self.hidden_lookups) {
            debug!(%scope, dedupe_key, "Hiding ledger lookup");
            return Ok(None);
        }
        self.inner.find_record(tx, scope, dedupe_key).await
    }

    async fn attach_result(
        &self,
        tx: &mut S::Tx,
        scope: BusinessId,
        record_id: Uuid,
        result_ref: Uuid,
    ) -> Result<(), StoreError> {
        self.inner.attach_result(tx, scope, record_id, result_ref).await
    }
}

#[async_trait]
impl<S: ExpenseRepository> ExpenseRepository for FaultInjectingStore<S> {
    async fn find_for_update(
        &self,
        tx: &mut S::Tx,
        key: &ExpenseKey,
    ) -> Result<Option<Expense>, StoreError> {
        if take(&self.hidden_lookups) {
            debug!(natural_key = %key, "Hiding locking read");
            return Ok(None);
        }
        self.inner.find_for_update(tx, key).await
    }

    async fn insert_expense(&self, tx: &mut S::Tx, expense: &Expense) -> Result<(), StoreError> {
        self.inner.insert_expense(tx, expense).await
    }

    async fn update_expense(&self, tx: &mut S::Tx, expense: &Expense) -> Result<(), StoreError> {
        self.inner.update_expense(tx, expense).await
    }

    async fn find_expenses_by_order(
        &self,
        tx: &mut S::Tx,
        business_id: BusinessId,
        order_id: OrderId,
    ) -> Result<Vec<Expense>, StoreError> {
        self.inner.find_expenses_by_order(tx, business_id, order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockroom_store::MemoryStore;

    #[test]
    fn test_take_counts_down() {
        let counter = AtomicU32::new(2);
        assert!(take(&counter));
        assert!(take(&counter));
        assert!(!take(&counter));
    }

    #[test]
    fn test_take_unbounded() {
        let counter = AtomicU32::new(u32::MAX);
        for _ in 0..10 {
            assert!(take(&counter));
        }
        assert_eq!(counter.load(Ordering::SeqCst), u32::MAX);
    }

    #[tokio::test]
    async fn test_commit_conflict_discards_writes() {
        let memory = Arc::new(MemoryStore::new());
        let store = FaultInjectingStore::new(Arc::clone(&memory));
        store.conflict_on_commit(1);

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        store
            .create_record(&mut tx, Uuid::now_v7(), "k", Fingerprint::from_bytes([1; 32]))
            .await
            .unwrap();
        let err = store.commit(tx).await.unwrap_err();

        assert!(store.is_serialization_conflict(&err));
        assert_eq!(store.commit_count(), 0);
        assert_eq!(memory.ledger_count().await, 0);
    }
}
