//! Repository trait definitions (Ports)
//!
//! These traits define the storage interface for the domain.
//! Every operation runs against a transaction handle obtained from
//! [`Transactional::begin`], so a unit of work either commits all of its
//! writes or none of them.
//!
//! Implementations: PostgreSQL (feature `postgres`) and in-memory for tests.

use crate::error::StoreError;
use async_trait::async_trait;
use stockroom_domain::{
    Business, BusinessId, Customer, CustomerAddress, CustomerUpsert, DedupeRecord, Expense,
    ExpenseKey, Fingerprint, Order, OrderId, PaymentMethodFee, Variant, VariantId,
};
use uuid::Uuid;

// =============================================================================
// Transactions
// =============================================================================

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Whatever the database is configured with
    #[default]
    Default,
    /// READ COMMITTED
    ReadCommitted,
    /// REPEATABLE READ
    RepeatableRead,
    /// SERIALIZABLE
    Serializable,
}

impl IsolationLevel {
    /// `SET TRANSACTION` statement for this level (`None` for `Default`)
    pub fn set_statement(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::ReadCommitted => {
                Some("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            },
            IsolationLevel::RepeatableRead => {
                Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            },
            IsolationLevel::Serializable => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
        }
    }
}

/// Options applied when a transaction is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    /// Isolation level
    pub isolation: IsolationLevel,
    /// Reject writes for the lifetime of the transaction
    pub read_only: bool,
}

/// Transaction lifecycle plus the error classification the retry engine
/// relies on.
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Transaction handle threaded through every repository call
    type Tx: Send;

    /// Open a transaction
    async fn begin(&self, options: TxOptions) -> Result<Self::Tx, StoreError>;

    /// Commit; may itself fail with a serialization conflict
    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Discard all writes of the transaction
    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Did this error come from a unique constraint?
    fn is_unique_violation(&self, err: &StoreError) -> bool {
        err.is_unique_violation()
    }

    /// Is this error a transient conflict (safe to re-run the transaction)?
    fn is_serialization_conflict(&self, err: &StoreError) -> bool {
        err.is_serialization_conflict()
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Persistence of dedupe records, unique per `(scope, dedupe_key)`
#[async_trait]
pub trait LedgerRepository: Transactional {
    /// Insert an in-flight record.
    ///
    /// Returns `StoreError::Duplicate` when a record for `(scope, dedupe_key)`
    /// already exists; no other error kind means "someone else owns the key".
    async fn create_record(
        &self,
        tx: &mut Self::Tx,
        scope: BusinessId,
        dedupe_key: &str,
        fingerprint: Fingerprint,
    ) -> Result<DedupeRecord, StoreError>;

    /// Find a record by key within the scope
    async fn find_record(
        &self,
        tx: &mut Self::Tx,
        scope: BusinessId,
        dedupe_key: &str,
    ) -> Result<Option<DedupeRecord>, StoreError>;

    /// Attach the id of the produced entity. Idempotent.
    async fn attach_result(
        &self,
        tx: &mut Self::Tx,
        scope: BusinessId,
        record_id: Uuid,
        result_ref: Uuid,
    ) -> Result<(), StoreError>;
}

// =============================================================================
// Domain repositories
// =============================================================================

/// Businesses and their payment method fees
#[async_trait]
pub trait BusinessRepository: Transactional {
    /// Save a business (insert or update)
    async fn save_business(&self, tx: &mut Self::Tx, business: &Business) -> Result<(), StoreError>;

    /// Find a business by its public storefront id
    async fn find_by_storefront_id(
        &self,
        tx: &mut Self::Tx,
        storefront_public_id: &str,
    ) -> Result<Option<Business>, StoreError>;

    /// Save a payment method fee configuration (insert or update)
    async fn save_payment_method(
        &self,
        tx: &mut Self::Tx,
        fee: &PaymentMethodFee,
    ) -> Result<(), StoreError>;

    /// Find the fee configuration for a payment method descriptor
    async fn find_payment_method(
        &self,
        tx: &mut Self::Tx,
        business_id: BusinessId,
        descriptor: &str,
    ) -> Result<Option<PaymentMethodFee>, StoreError>;
}

/// Product variants
#[async_trait]
pub trait InventoryRepository: Transactional {
    /// Save a variant (insert or update)
    async fn save_variant(&self, tx: &mut Self::Tx, variant: &Variant) -> Result<(), StoreError>;

    /// Load the variants of a business among `ids` (unknown ids are skipped)
    async fn find_variants(
        &self,
        tx: &mut Self::Tx,
        business_id: BusinessId,
        ids: &[VariantId],
    ) -> Result<Vec<Variant>, StoreError>;
}

/// Customers and their addresses
#[async_trait]
pub trait CustomerRepository: Transactional {
    /// Create the customer for `(business_id, email)` or refresh its details
    async fn upsert_by_email(
        &self,
        tx: &mut Self::Tx,
        business_id: BusinessId,
        input: &CustomerUpsert,
    ) -> Result<Customer, StoreError>;

    /// Insert a shipping address
    async fn create_address(
        &self,
        tx: &mut Self::Tx,
        address: &CustomerAddress,
    ) -> Result<(), StoreError>;
}

/// Orders
#[async_trait]
pub trait OrderRepository: Transactional {
    /// Next per-business order sequence (1-based)
    async fn next_order_sequence(
        &self,
        tx: &mut Self::Tx,
        business_id: BusinessId,
    ) -> Result<i64, StoreError>;

    /// Insert an order with its items
    async fn insert_order(&self, tx: &mut Self::Tx, order: &Order) -> Result<(), StoreError>;

    /// Find an order of a business
    async fn find_order(
        &self,
        tx: &mut Self::Tx,
        business_id: BusinessId,
        order_id: OrderId,
    ) -> Result<Option<Order>, StoreError>;

    /// Number of orders of a business
    async fn count_orders(&self, tx: &mut Self::Tx, business_id: BusinessId)
        -> Result<i64, StoreError>;
}

/// Expenses, unique per `(business_id, order_id, category)` when linked to an
/// order
#[async_trait]
pub trait ExpenseRepository: Transactional {
    /// Locking read of the expense for a natural key (`SELECT ... FOR UPDATE`)
    async fn find_for_update(
        &self,
        tx: &mut Self::Tx,
        key: &ExpenseKey,
    ) -> Result<Option<Expense>, StoreError>;

    /// Insert; `StoreError::Duplicate` if the natural key is taken
    async fn insert_expense(&self, tx: &mut Self::Tx, expense: &Expense) -> Result<(), StoreError>;

    /// Overwrite an existing expense by id
    async fn update_expense(&self, tx: &mut Self::Tx, expense: &Expense) -> Result<(), StoreError>;

    /// All expenses linked to an order
    async fn find_expenses_by_order(
        &self,
        tx: &mut Self::Tx,
        business_id: BusinessId,
        order_id: OrderId,
    ) -> Result<Vec<Expense>, StoreError>;
}

/// Combined store interface
pub trait Store:
    LedgerRepository
    + BusinessRepository
    + InventoryRepository
    + CustomerRepository
    + OrderRepository
    + ExpenseRepository
{
}

impl<T> Store for T where
    T: LedgerRepository
        + BusinessRepository
        + InventoryRepository
        + CustomerRepository
        + OrderRepository
        + ExpenseRepository
{
}
