//! Idempotency coordinator: race resolution over the dedupe ledger.
//!
//! Every attempt runs inside one transaction of the Atomic Execution Engine:
//!
//! ```text
//! find_record ──found──► compare fingerprint ──► Conflict | InProgress | Replayed
//!      │
//!  not found
//!      ▼
//! create_record ──Duplicate──► find_record again (must exist) ──► resolve as above
//!      │
//!      ▼
//! domain work → attach_result → Completed
//! ```
//!
//! At most one caller per `(scope, dedupe_key)` ever observes `Completed`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stockroom_domain::{BusinessId, DedupeRecord, Fingerprint, IdempotencyKey};
use stockroom_store::{LedgerRepository, Transactional};

use crate::atomic::{AtomicExecutor, AtomicOptions, UnitOfWork};
use crate::error::{ExecError, ExecResult};

// =============================================================================
// Descriptor & Outcome
// =============================================================================

/// Identity of one logical mutation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationDescriptor {
    /// Tenant the ledger row belongs to
    pub scope: BusinessId,
    /// Client token or derived key
    pub dedupe_key: String,
    /// Digest of the request payload
    pub fingerprint: Fingerprint,
}

impl MutationDescriptor {
    /// Describe a mutation by an arbitrary dedupe key
    pub fn new(scope: BusinessId, dedupe_key: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self { scope, dedupe_key: dedupe_key.into(), fingerprint }
    }

    /// Describe a mutation by a validated client idempotency key
    pub fn for_key(scope: BusinessId, key: &IdempotencyKey, fingerprint: Fingerprint) -> Self {
        Self::new(scope, key.as_str(), fingerprint)
    }
}

/// How an idempotent mutation resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// This call performed the mutation
    Completed(Uuid),
    /// An earlier call performed it; its result is returned again
    Replayed(Uuid),
    /// Another attempt holds the key and has not finished
    InProgress,
    /// The key was used with a different payload
    Conflict,
}

impl Outcome {
    /// Id of the produced entity, if any
    pub fn result_ref(&self) -> Option<Uuid> {
        match self {
            Outcome::Completed(id) | Outcome::Replayed(id) => Some(*id),
            Outcome::InProgress | Outcome::Conflict => None,
        }
    }

    /// Map `Conflict`/`InProgress` to their errors, keep the result id otherwise
    pub fn into_result(self, descriptor: &MutationDescriptor) -> ExecResult<Uuid> {
        match self {
            Outcome::Completed(id) | Outcome::Replayed(id) => Ok(id),
            Outcome::InProgress => {
                Err(ExecError::InProgress { dedupe_key: descriptor.dedupe_key.clone() })
            },
            Outcome::Conflict => {
                Err(ExecError::ConflictingPayload { dedupe_key: descriptor.dedupe_key.clone() })
            },
        }
    }

    /// Resolve an existing ledger row against the incoming request
    fn from_record(record: &DedupeRecord, descriptor: &MutationDescriptor) -> Self {
        if record.fingerprint != descriptor.fingerprint {
            Outcome::Conflict
        } else {
            match record.result_ref {
                Some(id) => Outcome::Replayed(id),
                None => Outcome::InProgress,
            }
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Runs side-effecting work at most once per logical request.
pub struct IdempotencyCoordinator<S> {
    executor: AtomicExecutor<S>,
}

impl<S> Clone for IdempotencyCoordinator<S> {
    fn clone(&self) -> Self {
        Self { executor: self.executor.clone() }
    }
}

impl<S: Transactional> IdempotencyCoordinator<S> {
    /// Create a coordinator over a store.
    pub fn new(store: Arc<S>) -> Self {
        Self { executor: AtomicExecutor::new(store) }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        self.executor.store()
    }

    /// The engine used for every attempt.
    pub fn executor(&self) -> &AtomicExecutor<S> {
        &self.executor
    }
}

impl<S: LedgerRepository> IdempotencyCoordinator<S> {
    /// Run `work` unless the descriptor was already claimed.
    ///
    /// `work` produces the id of the entity it created; that id is stored as
    /// the ledger row's result and returned to every replay.
    ///
    /// # Errors
    ///
    /// Whatever the engine reports (`RetryExhausted`, `Transport`, errors of
    /// `work`), or `Invariant` if the ledger reports a duplicate key it cannot
    /// read back.
    pub async fn run_idempotent<W>(
        &self,
        descriptor: &MutationDescriptor,
        options: AtomicOptions,
        work: &W,
    ) -> ExecResult<Outcome>
    where
        W: UnitOfWork<S::Tx, Output = Uuid> + ?Sized,
    {
        let guarded = Guarded { store: self.store().as_ref(), descriptor, work };
        let outcome = self.executor.execute(options, &guarded).await?;

        match outcome {
            Outcome::Completed(id) => {
                info!(scope = %descriptor.scope, dedupe_key = %descriptor.dedupe_key, result = %id, "Mutation completed");
            },
            Outcome::Replayed(id) => {
                debug!(scope = %descriptor.scope, dedupe_key = %descriptor.dedupe_key, result = %id, "Mutation replayed");
            },
            Outcome::InProgress => {
                debug!(scope = %descriptor.scope, dedupe_key = %descriptor.dedupe_key, "Mutation already in progress");
            },
            Outcome::Conflict => {
                warn!(scope = %descriptor.scope, dedupe_key = %descriptor.dedupe_key, "Idempotency key reused with different payload");
            },
        }

        Ok(outcome)
    }

    /// Read-only check of the ledger.
    ///
    /// Returns `None` when the key was never claimed; otherwise the outcome
    /// `run_idempotent` would report without running any work.
    pub async fn lookup(&self, descriptor: &MutationDescriptor) -> ExecResult<Option<Outcome>> {
        let lookup = Lookup { store: self.store().as_ref(), descriptor };
        self.executor.execute(AtomicOptions::read_only(), &lookup).await
    }
}

async fn resolve<S>(
    store: &S,
    tx: &mut S::Tx,
    descriptor: &MutationDescriptor,
) -> ExecResult<Option<Outcome>>
where
    S: LedgerRepository + ?Sized,
{
    let record = store.find_record(tx, descriptor.scope, &descriptor.dedupe_key).await?;
    Ok(record.map(|r| Outcome::from_record(&r, descriptor)))
}

/// Ledger check wrapped around the caller's work
struct Guarded<'a, S: ?Sized, W: ?Sized> {
    store: &'a S,
    descriptor: &'a MutationDescriptor,
    work: &'a W,
}

#[async_trait]
impl<'a, S, W> UnitOfWork<S::Tx> for Guarded<'a, S, W>
where
    S: LedgerRepository + ?Sized,
    W: UnitOfWork<S::Tx, Output = Uuid> + ?Sized,
{
    type Output = Outcome;

    async fn run(&self, tx: &mut S::Tx) -> ExecResult<Outcome> {
        let d = self.descriptor;

        if let Some(outcome) = resolve(self.store, tx, d).await? {
            return Ok(outcome);
        }

        match self.store.create_record(tx, d.scope, &d.dedupe_key, d.fingerprint).await {
            Ok(record) => {
                let result_ref = self.work.run(tx).await?;
                self.store.attach_result(tx, d.scope, record.id, result_ref).await?;
                Ok(Outcome::Completed(result_ref))
            },
            Err(err) if self.store.is_unique_violation(&err) => {
                debug!(scope = %d.scope, dedupe_key = %d.dedupe_key, "Lost race on dedupe key");
                resolve(self.store, tx, d).await?.ok_or_else(|| {
                    ExecError::Invariant(format!(
                        "dedupe key {} reported as duplicate but not found",
                        d.dedupe_key
                    ))
                })
            },
            Err(err) => Err(err.into()),
        }
    }
}

/// Ledger check alone
struct Lookup<'a, S: ?Sized> {
    store: &'a S,
    descriptor: &'a MutationDescriptor,
}

#[async_trait]
impl<'a, S> UnitOfWork<S::Tx> for Lookup<'a, S>
where
    S: LedgerRepository + ?Sized,
{
    type Output = Option<Outcome>;

    async fn run(&self, tx: &mut S::Tx) -> ExecResult<Option<Outcome>> {
        resolve(self.store, tx, self.descriptor).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::stub::FaultInjectingStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stockroom_domain::{Expense, ExpenseKey, FeeExpenseValues};
    use stockroom_store::{ExpenseRepository, MemoryStore, MemoryTx, StoreError, TxOptions};

    /// Domain write used by the tests: records one expense per run
    struct RecordExpense {
        business_id: Uuid,
        store: Arc<MemoryStore>,
        runs: AtomicU32,
    }

    impl RecordExpense {
        fn new(business_id: Uuid, store: &Arc<MemoryStore>) -> Self {
            Self { business_id, store: Arc::clone(store), runs: AtomicU32::new(0) }
        }

        fn runs(&self) -> u32 {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UnitOfWork<MemoryTx> for RecordExpense {
        type Output = Uuid;

        async fn run(&self, tx: &mut MemoryTx) -> ExecResult<Uuid> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let key = ExpenseKey::transaction_fee(self.business_id, Uuid::now_v7());
            let values = FeeExpenseValues::new(Decimal::ONE, "USD", Utc::now(), "card")?;
            let expense = Expense::for_key(&key, &values);
            self.store.insert_expense(tx, &expense).await?;
            Ok(expense.id)
        }
    }

    fn descriptor(scope: Uuid, key: &str, body: &str) -> MutationDescriptor {
        MutationDescriptor::new(scope, key, fingerprint([body]))
    }

    fn options() -> AtomicOptions {
        AtomicOptions::serializable(2)
    }

    #[tokio::test]
    async fn test_first_call_completes() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let work = RecordExpense::new(scope, &store);

        let outcome = coordinator
            .run_idempotent(&descriptor(scope, "abc", "A"), options(), &work)
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Completed(_)));
        assert_eq!(work.runs(), 1);
        assert_eq!(store.ledger_count().await, 1);
        assert_eq!(store.expense_count().await, 1);
    }

    #[tokio::test]
    async fn test_same_key_same_payload_replays() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let work = RecordExpense::new(scope, &store);
        let d = descriptor(scope, "abc", "A");

        let first = coordinator.run_idempotent(&d, options(), &work).await.unwrap();
        let second = coordinator.run_idempotent(&d, options(), &work).await.unwrap();

        assert_eq!(second, Outcome::Replayed(first.result_ref().unwrap()));
        assert_eq!(work.runs(), 1);
        assert_eq!(store.expense_count().await, 1);
    }

    #[tokio::test]
    async fn test_same_key_different_payload_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let work = RecordExpense::new(scope, &store);

        coordinator.run_idempotent(&descriptor(scope, "abc", "A"), options(), &work).await.unwrap();

        let other = descriptor(scope, "abc", "B");
        let outcome = coordinator.run_idempotent(&other, options(), &work).await.unwrap();

        assert_eq!(outcome, Outcome::Conflict);
        assert!(matches!(
            outcome.into_result(&other),
            Err(ExecError::ConflictingPayload { dedupe_key }) if dedupe_key == "abc"
        ));
        assert_eq!(work.runs(), 1);
        assert_eq!(store.expense_count().await, 1);
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_tenant() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let work = RecordExpense::new(Uuid::now_v7(), &store);

        let a = coordinator
            .run_idempotent(&descriptor(Uuid::now_v7(), "abc", "A"), options(), &work)
            .await
            .unwrap();
        let b = coordinator
            .run_idempotent(&descriptor(Uuid::now_v7(), "abc", "B"), options(), &work)
            .await
            .unwrap();

        assert!(matches!(a, Outcome::Completed(_)));
        assert!(matches!(b, Outcome::Completed(_)));
        assert_eq!(work.runs(), 2);
    }

    #[tokio::test]
    async fn test_unfinished_record_reports_in_progress() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let d = descriptor(scope, "abc", "A");

        // A crashed attempt left a record without a result
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        store.create_record(&mut tx, scope, "abc", d.fingerprint).await.unwrap();
        store.commit(tx).await.unwrap();

        let work = RecordExpense::new(scope, &store);
        let outcome = coordinator.run_idempotent(&d, options(), &work).await.unwrap();

        assert_eq!(outcome, Outcome::InProgress);
        assert!(matches!(outcome.into_result(&d), Err(ExecError::InProgress { .. })));
        assert_eq!(work.runs(), 0);
    }

    #[tokio::test]
    async fn test_lookup_fast_path() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let d = descriptor(scope, "abc", "A");

        assert_eq!(coordinator.lookup(&d).await.unwrap(), None);

        let work = RecordExpense::new(scope, &store);
        let completed = coordinator.run_idempotent(&d, options(), &work).await.unwrap();

        let replay = coordinator.lookup(&d).await.unwrap();
        assert_eq!(replay, Some(Outcome::Replayed(completed.result_ref().unwrap())));

        let conflict = coordinator.lookup(&descriptor(scope, "abc", "B")).await.unwrap();
        assert_eq!(conflict, Some(Outcome::Conflict));
        assert_eq!(store.ledger_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_work_leaves_no_record() {
        struct Rejects;

        #[async_trait]
        impl UnitOfWork<MemoryTx> for Rejects {
            type Output = Uuid;

            async fn run(&self, _tx: &mut MemoryTx) -> ExecResult<Uuid> {
                Err(stockroom_domain::DomainError::InvalidOrder("no items".into()).into())
            }
        }

        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let d = descriptor(Uuid::now_v7(), "abc", "A");

        let err = coordinator.run_idempotent(&d, options(), &Rejects).await.unwrap_err();

        assert!(matches!(err, ExecError::Domain(_)));
        assert_eq!(store.ledger_count().await, 0);
        assert_eq!(coordinator.lookup(&d).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let work = Arc::new(RecordExpense::new(scope, &store));
        let d = descriptor(scope, "abc", "A");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = coordinator.clone();
            let work = Arc::clone(&work);
            let d = d.clone();
            handles.push(tokio::spawn(async move {
                coordinator.run_idempotent(&d, options(), work.as_ref()).await
            }));
        }

        let mut completed = Vec::new();
        let mut replayed = Vec::new();
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Outcome::Completed(id) => completed.push(id),
                Outcome::Replayed(id) => replayed.push(id),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }

        assert_eq!(completed.len(), 1);
        assert_eq!(replayed.len(), 15);
        assert!(replayed.iter().all(|id| *id == completed[0]));
        assert_eq!(work.runs(), 1);
        assert_eq!(store.expense_count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_on_create_resolves_to_replay() {
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(FaultInjectingStore::new(Arc::clone(&memory)));
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let work = RecordExpense::new(scope, &memory);
        let d = descriptor(scope, "abc", "A");

        let first = coordinator.run_idempotent(&d, options(), &work).await.unwrap();

        // The first lookup misses, so create_record hits the unique key and
        // the second lookup must find the winner.
        store.hide_next_lookups(1);
        let second = coordinator.run_idempotent(&d, options(), &work).await.unwrap();

        assert_eq!(second, Outcome::Replayed(first.result_ref().unwrap()));
        assert_eq!(work.runs(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_on_create_resolves_to_conflict() {
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(FaultInjectingStore::new(Arc::clone(&memory)));
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let work = RecordExpense::new(scope, &memory);

        coordinator.run_idempotent(&descriptor(scope, "abc", "A"), options(), &work).await.unwrap();

        store.hide_next_lookups(1);
        let outcome = coordinator
            .run_idempotent(&descriptor(scope, "abc", "B"), options(), &work)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Conflict);
    }

    #[tokio::test]
    async fn test_duplicate_without_record_is_invariant_violation() {
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(FaultInjectingStore::new(Arc::clone(&memory)));
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let work = RecordExpense::new(scope, &memory);
        let d = descriptor(scope, "abc", "A");

        coordinator.run_idempotent(&d, options(), &work).await.unwrap();

        store.hide_next_lookups(2);
        let err = coordinator.run_idempotent(&d, options(), &work).await.unwrap_err();

        assert!(matches!(err, ExecError::Invariant(_)));
        assert_eq!(work.runs(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_and_leaves_no_record() {
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(FaultInjectingStore::new(Arc::clone(&memory)));
        store.always_conflict_on_commit();
        let coordinator = IdempotencyCoordinator::new(Arc::clone(&store));
        let scope = Uuid::now_v7();
        let work = RecordExpense::new(scope, &memory);

        let err = coordinator
            .run_idempotent(&descriptor(scope, "abc", "A"), AtomicOptions::serializable(2), &work)
            .await
            .unwrap_err();

        match err {
            ExecError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, StoreError::SerializationConflict(_)));
            },
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(store.begin_count(), 3);
        assert_eq!(work.runs(), 3);
        assert_eq!(memory.ledger_count().await, 0);
        assert_eq!(memory.expense_count().await, 0);
    }
}
