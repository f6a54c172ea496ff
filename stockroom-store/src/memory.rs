//! In-memory store implementation
//!
//! Used for testing and development without a database.
//!
//! A transaction takes the store-wide lock for its whole lifetime and works
//! on a private copy of the state. Commit publishes the copy, rollback (or
//! dropping the handle) discards it. Transactions therefore run one at a
//! time, which is trivially a serializable schedule.

use crate::error::StoreError;
use crate::repository::{
    BusinessRepository, CustomerRepository, ExpenseRepository, InventoryRepository,
    LedgerRepository, OrderRepository, Transactional, TxOptions,
};
use async_trait::async_trait;
use chrono::Utc;
use stockroom_domain::{
    Business, BusinessId, Customer, CustomerAddress, CustomerId, CustomerUpsert, DedupeRecord,
    Expense, ExpenseId, ExpenseKey, Fingerprint, Order, OrderId, PaymentMethodFee, Variant,
    VariantId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    ledger: HashMap<(BusinessId, String), DedupeRecord>,
    businesses: HashMap<BusinessId, Business>,
    payment_methods: HashMap<(BusinessId, String), PaymentMethodFee>,
    variants: HashMap<VariantId, Variant>,
    customers: HashMap<CustomerId, Customer>,
    addresses: HashMap<Uuid, CustomerAddress>,
    orders: HashMap<OrderId, Order>,
    expenses: HashMap<ExpenseId, Expense>,
}

/// In-memory store for testing
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

/// Open transaction on a [`MemoryStore`]
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    read_only: bool,
}

impl MemoryTx {
    fn writable(&mut self) -> Result<&mut MemoryState, StoreError> {
        if self.read_only {
            return Err(StoreError::Database(
                "cannot execute write in a read-only transaction".to_string(),
            ));
        }
        Ok(&mut self.working)
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dedupe records
    pub async fn ledger_count(&self) -> usize {
        self.state.lock().await.ledger.len()
    }

    /// Number of orders
    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    /// Number of customers
    pub async fn customer_count(&self) -> usize {
        self.state.lock().await.customers.len()
    }

    /// Number of expenses
    pub async fn expense_count(&self) -> usize {
        self.state.lock().await.expenses.len()
    }

    /// Clear all data (useful for test setup)
    pub async fn clear(&self) {
        *self.state.lock().await = MemoryState::default();
    }
}

// =============================================================================
// Transactions
// =============================================================================

#[async_trait]
impl Transactional for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self, options: TxOptions) -> Result<MemoryTx, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTx { guard, working, read_only: options.read_only })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), StoreError> {
        let MemoryTx { mut guard, working, read_only } = tx;
        if !read_only {
            *guard = working;
        }
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }
}

// =============================================================================
// Ledger Repository Implementation
// =============================================================================

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn create_record(
        &self,
        tx: &mut MemoryTx,
        scope: BusinessId,
        dedupe_key: &str,
        fingerprint: Fingerprint,
    ) -> Result<DedupeRecord, StoreError> {
        let state = tx.writable()?;
        let key = (scope, dedupe_key.to_string());
        if state.ledger.contains_key(&key) {
            return Err(StoreError::duplicate("dedupe_record", dedupe_key));
        }
        let record = DedupeRecord::new(scope, dedupe_key, fingerprint);
        state.ledger.insert(key, record.clone());
        Ok(record)
    }

    async fn find_record(
        &self,
        tx: &mut MemoryTx,
        scope: BusinessId,
        dedupe_key: &str,
    ) -> Result<Option<DedupeRecord>, StoreError> {
        Ok(tx.working.ledger.get(&(scope, dedupe_key.to_string())).cloned())
    }

    async fn attach_result(
        &self,
        tx: &mut MemoryTx,
        scope: BusinessId,
        record_id: Uuid,
        result_ref: Uuid,
    ) -> Result<(), StoreError> {
        let state = tx.writable()?;
        let record = state
            .ledger
            .values_mut()
            .find(|r| r.scope == scope && r.id == record_id)
            .ok_or_else(|| StoreError::not_found("dedupe_record", record_id.to_string()))?;
        record.result_ref = Some(result_ref);
        record.updated_at = Utc::now();
        Ok(())
    }
}

// =============================================================================
// Business Repository Implementation
// =============================================================================

#[async_trait]
impl BusinessRepository for MemoryStore {
    async fn save_business(&self, tx: &mut MemoryTx, business: &Business) -> Result<(), StoreError> {
        let state = tx.writable()?;
        let taken = state.businesses.values().any(|b| {
            b.id != business.id && b.storefront_public_id == business.storefront_public_id
        });
        if taken {
            return Err(StoreError::duplicate("business", &business.storefront_public_id));
        }
        state.businesses.insert(business.id, business.clone());
        Ok(())
    }

    async fn find_by_storefront_id(
        &self,
        tx: &mut MemoryTx,
        storefront_public_id: &str,
    ) -> Result<Option<Business>, StoreError> {
        Ok(tx
            .working
            .businesses
            .values()
            .find(|b| b.storefront_public_id == storefront_public_id)
            .cloned())
    }

    async fn save_payment_method(
        &self,
        tx: &mut MemoryTx,
        fee: &PaymentMethodFee,
    ) -> Result<(), StoreError> {
        let state = tx.writable()?;
        state.payment_methods.insert((fee.business_id, fee.descriptor.clone()), fee.clone());
        Ok(())
    }

    async fn find_payment_method(
        &self,
        tx: &mut MemoryTx,
        business_id: BusinessId,
        descriptor: &str,
    ) -> Result<Option<PaymentMethodFee>, StoreError> {
        Ok(tx.working.payment_methods.get(&(business_id, descriptor.to_string())).cloned())
    }
}

// =============================================================================
// Inventory Repository Implementation
// =============================================================================

#[async_trait]
impl InventoryRepository for MemoryStore {
    async fn save_variant(&self, tx: &mut MemoryTx, variant: &Variant) -> Result<(), StoreError> {
        tx.writable()?.variants.insert(variant.id, variant.clone());
        Ok(())
    }

    async fn find_variants(
        &self,
        tx: &mut MemoryTx,
        business_id: BusinessId,
        ids: &[VariantId],
    ) -> Result<Vec<Variant>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| tx.working.variants.get(id))
            .filter(|v| v.business_id == business_id)
            .cloned()
            .collect())
    }
}

// =============================================================================
// Customer Repository Implementation
// =============================================================================

#[async_trait]
impl CustomerRepository for MemoryStore {
    async fn upsert_by_email(
        &self,
        tx: &mut MemoryTx,
        business_id: BusinessId,
        input: &CustomerUpsert,
    ) -> Result<Customer, StoreError> {
        let state = tx.writable()?;
        let existing = state
            .customers
            .values_mut()
            .find(|c| c.business_id == business_id && c.email == input.email);

        let customer = match existing {
            Some(customer) => {
                customer.merge(input);
                customer.clone()
            },
            None => {
                let customer = Customer::from_upsert(business_id, input);
                state.customers.insert(customer.id, customer.clone());
                customer
            },
        };
        Ok(customer)
    }

    async fn create_address(
        &self,
        tx: &mut MemoryTx,
        address: &CustomerAddress,
    ) -> Result<(), StoreError> {
        let state = tx.writable()?;
        if !state.customers.contains_key(&address.customer_id) {
            return Err(StoreError::not_found("customer", address.customer_id.to_string()));
        }
        state.addresses.insert(address.id, address.clone());
        Ok(())
    }
}

// =============================================================================
// Order Repository Implementation
// =============================================================================

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn next_order_sequence(
        &self,
        tx: &mut MemoryTx,
        business_id: BusinessId,
    ) -> Result<i64, StoreError> {
        let max = tx
            .working
            .orders
            .values()
            .filter(|o| o.business_id == business_id)
            .map(|o| o.sequence)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn insert_order(&self, tx: &mut MemoryTx, order: &Order) -> Result<(), StoreError> {
        let state = tx.writable()?;
        let taken = state.orders.contains_key(&order.id)
            || state
                .orders
                .values()
                .any(|o| o.business_id == order.business_id && o.sequence == order.sequence);
        if taken {
            return Err(StoreError::duplicate("order", &order.order_number));
        }
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order(
        &self,
        tx: &mut MemoryTx,
        business_id: BusinessId,
        order_id: OrderId,
    ) -> Result<Option<Order>, StoreError> {
        Ok(tx.working.orders.get(&order_id).filter(|o| o.business_id == business_id).cloned())
    }

    async fn count_orders(&self, tx: &mut MemoryTx, business_id: BusinessId) -> Result<i64, StoreError> {
        Ok(tx.working.orders.values().filter(|o| o.business_id == business_id).count() as i64)
    }
}

// =============================================================================
// Expense Repository Implementation
// =============================================================================

fn matches_key(expense: &Expense, key: &ExpenseKey) -> bool {
    expense.business_id == key.business_id
        && expense.order_id == Some(key.order_id)
        && expense.category == key.category
}

#[async_trait]
impl ExpenseRepository for MemoryStore {
    async fn find_for_update(
        &self,
        tx: &mut MemoryTx,
        key: &ExpenseKey,
    ) -> Result<Option<Expense>, StoreError> {
        Ok(tx.working.expenses.values().find(|e| matches_key(e, key)).cloned())
    }

    async fn insert_expense(&self, tx: &mut MemoryTx, expense: &Expense) -> Result<(), StoreError> {
        let state = tx.writable()?;
        if let Some(order_id) = expense.order_id {
            let key = ExpenseKey { business_id: expense.business_id, order_id, category: expense.category };
            if state.expenses.values().any(|e| matches_key(e, &key)) {
                return Err(StoreError::duplicate("expense", key.to_string()));
            }
        }
        if state.expenses.contains_key(&expense.id) {
            return Err(StoreError::duplicate("expense", expense.id.to_string()));
        }
        state.expenses.insert(expense.id, expense.clone());
        Ok(())
    }

    async fn update_expense(&self, tx: &mut MemoryTx, expense: &Expense) -> Result<(), StoreError> {
        let state = tx.writable()?;
        match state.expenses.get_mut(&expense.id) {
            Some(stored) => {
                *stored = expense.clone();
                Ok(())
            },
            None => Err(StoreError::not_found("expense", expense.id.to_string())),
        }
    }

    async fn find_expenses_by_order(
        &self,
        tx: &mut MemoryTx,
        business_id: BusinessId,
        order_id: OrderId,
    ) -> Result<Vec<Expense>, StoreError> {
        let mut expenses: Vec<Expense> = tx
            .working
            .expenses
            .values()
            .filter(|e| e.business_id == business_id && e.order_id == Some(order_id))
            .cloned()
            .collect();
        expenses.sort_by_key(|e| e.created_at);
        Ok(expenses)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockroom_domain::{Email, FeeExpenseValues};

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 32])
    }

    fn upsert(email: &str) -> CustomerUpsert {
        CustomerUpsert {
            email: Email::parse(email).unwrap(),
            name: "Jane".to_string(),
            phone_code: None,
            phone_number: None,
            instagram_username: None,
        }
    }

    // Transaction Tests
    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryStore::new();
        let scope = Uuid::now_v7();

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        store.create_record(&mut tx, scope, "k1", fp(1)).await.unwrap();
        // Held until commit
        assert!(store.state.try_lock().is_err());
        store.commit(tx).await.unwrap();

        assert_eq!(store.ledger_count().await, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        let scope = Uuid::now_v7();

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        store.create_record(&mut tx, scope, "k1", fp(1)).await.unwrap();
        store.rollback(tx).await.unwrap();

        assert_eq!(store.ledger_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_tx_discards_writes() {
        let store = MemoryStore::new();
        let scope = Uuid::now_v7();

        {
            let mut tx = store.begin(TxOptions::default()).await.unwrap();
            store.create_record(&mut tx, scope, "k1", fp(1)).await.unwrap();
        }

        assert_eq!(store.ledger_count().await, 0);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        let options = TxOptions { read_only: true, ..Default::default() };

        let mut tx = store.begin(options).await.unwrap();
        let result = store.create_record(&mut tx, Uuid::now_v7(), "k1", fp(1)).await;
        assert!(matches!(result, Err(StoreError::Database(_))));

        let found = store.find_record(&mut tx, Uuid::now_v7(), "k1").await.unwrap();
        assert!(found.is_none());
        store.commit(tx).await.unwrap();
    }

    // Ledger Tests
    #[tokio::test]
    async fn test_create_record_duplicate() {
        let store = MemoryStore::new();
        let scope = Uuid::now_v7();

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        store.create_record(&mut tx, scope, "k1", fp(1)).await.unwrap();
        let err = store.create_record(&mut tx, scope, "k1", fp(2)).await.unwrap_err();
        assert!(store.is_unique_violation(&err));

        // Same key in another scope is independent
        store.create_record(&mut tx, Uuid::now_v7(), "k1", fp(1)).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(store.ledger_count().await, 2);
    }

    #[tokio::test]
    async fn test_attach_result() {
        let store = MemoryStore::new();
        let scope = Uuid::now_v7();
        let result_ref = Uuid::now_v7();

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        let record = store.create_record(&mut tx, scope, "k1", fp(1)).await.unwrap();
        store.attach_result(&mut tx, scope, record.id, result_ref).await.unwrap();
        // Idempotent
        store.attach_result(&mut tx, scope, record.id, result_ref).await.unwrap();

        let found = store.find_record(&mut tx, scope, "k1").await.unwrap().unwrap();
        assert_eq!(found.result_ref, Some(result_ref));
        assert!(found.is_complete());

        let missing = store.attach_result(&mut tx, Uuid::now_v7(), record.id, result_ref).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    // Customer Tests
    #[tokio::test]
    async fn test_upsert_by_email_merges() {
        let store = MemoryStore::new();
        let business_id = Uuid::now_v7();

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        let mut input = upsert("jane@example.com");
        input.phone_number = Some("5551234".to_string());
        let first = store.upsert_by_email(&mut tx, business_id, &input).await.unwrap();

        let mut again = upsert("jane@example.com");
        again.name = "Jane Doe".to_string();
        let second = store.upsert_by_email(&mut tx, business_id, &again).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Jane Doe");
        assert_eq!(second.phone_number.as_deref(), Some("5551234"));
        assert_eq!(store.customer_count().await, 1);
    }

    // Order Tests
    #[tokio::test]
    async fn test_order_sequence_and_uniqueness() {
        let store = MemoryStore::new();
        let business_id = Uuid::now_v7();
        let variant = Variant::new(business_id, "Mug", "MUG-1", dec!(10), "USD");
        let quantities = std::collections::BTreeMap::from([(variant.id, 1)]);

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        assert_eq!(store.next_order_sequence(&mut tx, business_id).await.unwrap(), 1);

        let order = Order::new_pending(
            business_id,
            1,
            Uuid::now_v7(),
            Uuid::now_v7(),
            &quantities,
            std::slice::from_ref(&variant),
            "USD",
            None,
        )
        .unwrap();
        store.insert_order(&mut tx, &order).await.unwrap();
        assert_eq!(store.next_order_sequence(&mut tx, business_id).await.unwrap(), 2);

        let clash = Order { id: Uuid::now_v7(), ..order.clone() };
        let err = store.insert_order(&mut tx, &clash).await.unwrap_err();
        assert!(err.is_unique_violation());

        let found = store.find_order(&mut tx, business_id, order.id).await.unwrap();
        assert!(found.is_some());
        let foreign = store.find_order(&mut tx, Uuid::now_v7(), order.id).await.unwrap();
        assert!(foreign.is_none());
        assert_eq!(store.count_orders(&mut tx, business_id).await.unwrap(), 1);
    }

    // Expense Tests
    #[tokio::test]
    async fn test_expense_natural_key_unique() {
        let store = MemoryStore::new();
        let key = ExpenseKey::transaction_fee(Uuid::now_v7(), Uuid::now_v7());
        let values = FeeExpenseValues::new(dec!(3.50), "USD", Utc::now(), "card").unwrap();

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        assert!(store.find_for_update(&mut tx, &key).await.unwrap().is_none());

        store.insert_expense(&mut tx, &Expense::for_key(&key, &values)).await.unwrap();
        let err = store.insert_expense(&mut tx, &Expense::for_key(&key, &values)).await.unwrap_err();
        assert!(err.is_unique_violation());

        let mut existing = store.find_for_update(&mut tx, &key).await.unwrap().unwrap();
        let newer = FeeExpenseValues::new(dec!(4.00), "USD", Utc::now(), "wallet").unwrap();
        existing.apply(&newer);
        store.update_expense(&mut tx, &existing).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        let all = store.find_expenses_by_order(&mut tx, key.business_id, key.order_id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].amount, dec!(4.00));
    }
}
