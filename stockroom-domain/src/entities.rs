//! Domain Entities for Stockroom
//!
//! Tenant-scoped business entities touched by idempotent mutations.
//! Every entity carries the `BusinessId` it is partitioned by.

use crate::value_objects::{DomainError, Email, Fingerprint};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a Business (the tenant scope)
pub type BusinessId = Uuid;

/// Unique identifier for an Order
pub type OrderId = Uuid;

/// Unique identifier for a Customer
pub type CustomerId = Uuid;

/// Unique identifier for a product Variant
pub type VariantId = Uuid;

/// Unique identifier for an Expense
pub type ExpenseId = Uuid;

// =============================================================================
// Dedupe Record
// =============================================================================

/// Ledger row for one attempted idempotent mutation.
///
/// `(scope, dedupe_key)` is unique. A record without `result_ref` means
/// another attempt is in flight (or crashed before finishing); it never
/// means success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub id: Uuid,
    pub scope: BusinessId,
    pub dedupe_key: String,
    pub fingerprint: Fingerprint,
    pub result_ref: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DedupeRecord {
    /// Create a fresh in-flight record
    pub fn new(scope: BusinessId, dedupe_key: impl Into<String>, fingerprint: Fingerprint) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            scope,
            dedupe_key: dedupe_key.into(),
            fingerprint,
            result_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the mutation's result has been attached
    pub fn is_complete(&self) -> bool {
        self.result_ref.is_some()
    }
}

// =============================================================================
// Business
// =============================================================================

/// Tenant with a public storefront
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub id: BusinessId,
    pub name: String,
    pub storefront_public_id: String,
    pub storefront_enabled: bool,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl Business {
    /// Create a business with its storefront enabled
    pub fn new(
        name: impl Into<String>,
        storefront_public_id: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            storefront_public_id: storefront_public_id.into(),
            storefront_enabled: true,
            currency: currency.into(),
            created_at: Utc::now(),
        }
    }
}

/// Fee configuration of one payment method for a business
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethodFee {
    pub business_id: BusinessId,
    pub descriptor: String,
    pub enabled: bool,
    /// Fraction of the order total (0.029 = 2.9%)
    pub fee_percent: Decimal,
    pub fee_fixed: Decimal,
}

impl PaymentMethodFee {
    /// Fee owed for an order total, rounded to cents.
    ///
    /// `None` when the method is disabled or the rounded fee is not positive.
    pub fn fee_for(&self, order_total: Decimal) -> Option<Decimal> {
        if !self.enabled {
            return None;
        }
        let fee = (order_total * self.fee_percent + self.fee_fixed).round_dp(2);
        (fee > Decimal::ZERO).then_some(fee)
    }
}

/// Sellable product variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub business_id: BusinessId,
    pub name: String,
    pub sku: String,
    pub sale_price: Decimal,
    pub currency: String,
}

impl Variant {
    /// Create a variant priced in `currency`
    pub fn new(
        business_id: BusinessId,
        name: impl Into<String>,
        sku: impl Into<String>,
        sale_price: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            business_id,
            name: name.into(),
            sku: sku.into(),
            sale_price,
            currency: currency.into(),
        }
    }
}

// =============================================================================
// Customer
// =============================================================================

/// Customer of a business, unique per `(business_id, email)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub business_id: BusinessId,
    pub email: Email,
    pub name: String,
    pub phone_code: Option<String>,
    pub phone_number: Option<String>,
    pub instagram_username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for upserting a customer by email
#[derive(Debug, Clone)]
pub struct CustomerUpsert {
    pub email: Email,
    pub name: String,
    pub phone_code: Option<String>,
    pub phone_number: Option<String>,
    pub instagram_username: Option<String>,
}

impl Customer {
    /// Create a customer from upsert input
    pub fn from_upsert(business_id: BusinessId, input: &CustomerUpsert) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            business_id,
            email: input.email.clone(),
            name: input.name.clone(),
            phone_code: input.phone_code.clone(),
            phone_number: input.phone_number.clone(),
            instagram_username: input.instagram_username.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh contact details; blank optional inputs keep the stored value
    pub fn merge(&mut self, input: &CustomerUpsert) {
        self.name = input.name.clone();
        if input.phone_code.is_some() {
            self.phone_code = input.phone_code.clone();
        }
        if input.phone_number.is_some() {
            self.phone_number = input.phone_number.clone();
        }
        if input.instagram_username.is_some() {
            self.instagram_username = input.instagram_username.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// Shipping address owned by a customer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerAddress {
    pub id: Uuid,
    pub business_id: BusinessId,
    pub customer_id: CustomerId,
    pub country_code: String,
    pub state: String,
    pub city: String,
    pub street: Option<String>,
    pub zip_code: Option<String>,
    pub phone_code: String,
    pub phone_number: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Order
// =============================================================================

/// Order lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created from the storefront, awaiting merchant action
    Pending,
    /// Accepted by the merchant
    Placed,
    /// Cancelled
    Cancelled,
}

/// Payment status of an order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Not paid yet
    Pending,
    /// Paid in full
    Paid,
    /// Payment attempt failed
    Failed,
}

/// One line of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub variant_id: VariantId,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total: Decimal,
}

/// Customer order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub business_id: BusinessId,
    /// Per-business sequence, unique within the business
    pub sequence: i64,
    pub order_number: String,
    pub customer_id: CustomerId,
    pub shipping_address_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub items: Vec<OrderItem>,
    pub total: Decimal,
    pub currency: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Build a pending, unpaid order from resolved variants.
    ///
    /// `quantities` is keyed by variant id; every key must be present in
    /// `variants` and priced in `currency`.
    ///
    /// # Errors
    /// `DomainError::InvalidOrder` on empty input, unknown variants,
    /// non-positive quantities or currency mismatch.
    pub fn new_pending(
        business_id: BusinessId,
        sequence: i64,
        customer_id: CustomerId,
        shipping_address_id: Uuid,
        quantities: &BTreeMap<VariantId, i32>,
        variants: &[Variant],
        currency: &str,
        note: Option<String>,
    ) -> Result<Self, DomainError> {
        if quantities.is_empty() {
            return Err(DomainError::InvalidOrder("order has no items".to_string()));
        }

        let mut items = Vec::with_capacity(quantities.len());
        for (variant_id, quantity) in quantities {
            if *quantity <= 0 {
                return Err(DomainError::InvalidOrder(format!(
                    "quantity for variant {} must be positive",
                    variant_id
                )));
            }
            let variant = variants
                .iter()
                .find(|v| v.id == *variant_id && v.business_id == business_id)
                .ok_or_else(|| {
                    DomainError::InvalidOrder(format!("variant not found: {}", variant_id))
                })?;
            if variant.currency != currency {
                return Err(DomainError::InvalidOrder(format!(
                    "variant {} is priced in {}, expected {}",
                    variant_id, variant.currency, currency
                )));
            }
            items.push(OrderItem {
                variant_id: *variant_id,
                quantity: *quantity,
                unit_price: variant.sale_price,
                total: variant.sale_price * Decimal::from(*quantity),
            });
        }

        let total = items.iter().map(|i| i.total).sum();

        Ok(Self {
            id: Uuid::now_v7(),
            business_id,
            sequence,
            order_number: format_order_number(sequence),
            customer_id,
            shipping_address_id,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            items,
            total,
            currency: currency.to_string(),
            note,
            created_at: Utc::now(),
        })
    }
}

/// Human-facing order number for the n-th order of a business
pub fn format_order_number(sequence: i64) -> String {
    format!("ORD-{:06}", sequence)
}

// =============================================================================
// Expense
// =============================================================================

/// Expense category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    /// Payment processing fee generated from a paid order
    TransactionFee,
    /// Shipping cost
    Shipping,
    /// Anything else
    Other,
}

/// Expense recurrence type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseType {
    /// Single occurrence
    OneTime,
    /// Generated from a recurring template
    Recurring,
}

/// Natural key of an order-linked expense: at most one row per
/// `(business_id, order_id, category)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpenseKey {
    pub business_id: BusinessId,
    pub order_id: OrderId,
    pub category: ExpenseCategory,
}

impl ExpenseKey {
    /// Key of the transaction-fee expense of an order
    pub fn transaction_fee(business_id: BusinessId, order_id: OrderId) -> Self {
        Self { business_id, order_id, category: ExpenseCategory::TransactionFee }
    }
}

impl fmt::Display for ExpenseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.business_id, self.order_id, self.category)
    }
}

/// Recorded business expense
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub business_id: BusinessId,
    pub order_id: Option<OrderId>,
    pub amount: Decimal,
    pub currency: String,
    pub category: ExpenseCategory,
    pub expense_type: ExpenseType,
    pub note: Option<String>,
    pub occurred_on: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values written by a transaction-fee upsert
#[derive(Debug, Clone, PartialEq)]
pub struct FeeExpenseValues {
    pub amount: Decimal,
    pub currency: String,
    pub occurred_on: DateTime<Utc>,
    pub note: String,
}

impl FeeExpenseValues {
    /// Fee values for an order paid through `payment_method`
    ///
    /// # Errors
    /// `DomainError::InvalidAmount` if `amount <= 0`
    pub fn new(
        amount: Decimal,
        currency: impl Into<String>,
        occurred_on: DateTime<Utc>,
        payment_method: &str,
    ) -> Result<Self, DomainError> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::InvalidAmount("Fee amount must be positive".to_string()));
        }
        let note = if payment_method.trim().is_empty() {
            "Transaction fee".to_string()
        } else {
            format!("Transaction fee ({})", payment_method.trim())
        };
        Ok(Self { amount, currency: currency.into(), occurred_on, note })
    }
}

impl Expense {
    /// New one-time expense for `key` carrying `values`
    pub fn for_key(key: &ExpenseKey, values: &FeeExpenseValues) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            business_id: key.business_id,
            order_id: Some(key.order_id),
            amount: values.amount,
            currency: values.currency.clone(),
            category: key.category,
            expense_type: ExpenseType::OneTime,
            note: Some(values.note.clone()),
            occurred_on: values.occurred_on,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the mutable fields with `values` (last writer wins)
    pub fn apply(&mut self, values: &FeeExpenseValues) {
        self.amount = values.amount;
        self.currency = values.currency.clone();
        self.occurred_on = values.occurred_on;
        self.note = Some(values.note.clone());
        self.expense_type = ExpenseType::OneTime;
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// String codecs for storage
// =============================================================================

macro_rules! str_enum {
    ($ty:ident, $field:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            /// Storage representation
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(DomainError::InvalidValue { field: $field, value: other.to_string() }),
                }
            }
        }
    };
}

str_enum!(OrderStatus, "order_status", {
    Pending => "pending",
    Placed => "placed",
    Cancelled => "cancelled",
});

str_enum!(PaymentStatus, "payment_status", {
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
});

str_enum!(ExpenseCategory, "expense_category", {
    TransactionFee => "transaction_fee",
    Shipping => "shipping",
    Other => "other",
});

str_enum!(ExpenseType, "expense_type", {
    OneTime => "one_time",
    Recurring => "recurring",
});

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn variant(business_id: BusinessId, price: Decimal) -> Variant {
        Variant::new(business_id, "Mug", "MUG-1", price, "USD")
    }

    #[test]
    fn test_new_pending_order_totals() {
        let business_id = Uuid::now_v7();
        let v1 = variant(business_id, dec!(12.50));
        let v2 = variant(business_id, dec!(3.00));
        let quantities = BTreeMap::from([(v1.id, 2), (v2.id, 3)]);

        let order = Order::new_pending(
            business_id,
            7,
            Uuid::now_v7(),
            Uuid::now_v7(),
            &quantities,
            &[v1, v2],
            "USD",
            None,
        )
        .unwrap();

        assert_eq!(order.total, dec!(34.00));
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.order_number, "ORD-000007");
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Pending);
    }

    #[test]
    fn test_new_pending_order_rejects_foreign_variant() {
        let business_id = Uuid::now_v7();
        let foreign = variant(Uuid::now_v7(), dec!(1));
        let quantities = BTreeMap::from([(foreign.id, 1)]);

        let result = Order::new_pending(
            business_id,
            1,
            Uuid::now_v7(),
            Uuid::now_v7(),
            &quantities,
            &[foreign],
            "USD",
            None,
        );
        assert!(matches!(result, Err(DomainError::InvalidOrder(_))));
    }

    #[test]
    fn test_new_pending_order_rejects_currency_mismatch() {
        let business_id = Uuid::now_v7();
        let v = variant(business_id, dec!(1));
        let quantities = BTreeMap::from([(v.id, 1)]);

        let result = Order::new_pending(
            business_id,
            1,
            Uuid::now_v7(),
            Uuid::now_v7(),
            &quantities,
            &[v],
            "EUR",
            None,
        );
        assert!(matches!(result, Err(DomainError::InvalidOrder(_))));
    }

    #[test]
    fn test_fee_for_rounds_to_cents() {
        let fee = PaymentMethodFee {
            business_id: Uuid::now_v7(),
            descriptor: "card".to_string(),
            enabled: true,
            fee_percent: dec!(0.029),
            fee_fixed: dec!(0.30),
        };
        // 123.45 * 0.029 + 0.30 = 3.88005
        assert_eq!(fee.fee_for(dec!(123.45)), Some(dec!(3.88)));
    }

    #[test]
    fn test_fee_for_disabled_or_zero() {
        let mut fee = PaymentMethodFee {
            business_id: Uuid::now_v7(),
            descriptor: "cash".to_string(),
            enabled: true,
            fee_percent: Decimal::ZERO,
            fee_fixed: Decimal::ZERO,
        };
        assert_eq!(fee.fee_for(dec!(100)), None);

        fee.fee_fixed = dec!(1);
        fee.enabled = false;
        assert_eq!(fee.fee_for(dec!(100)), None);
    }

    #[test]
    fn test_fee_for_sub_cent_fee_is_none() {
        let fee = PaymentMethodFee {
            business_id: Uuid::now_v7(),
            descriptor: "card".to_string(),
            enabled: true,
            fee_percent: dec!(0.029),
            fee_fixed: Decimal::ZERO,
        };
        // 0.10 * 0.029 = 0.0029
        assert_eq!(fee.fee_for(dec!(0.10)), None);
        assert_eq!(fee.fee_for(dec!(0.20)), Some(dec!(0.01)));
    }

    #[test]
    fn test_fee_values_note() {
        let values = FeeExpenseValues::new(dec!(1), "USD", Utc::now(), "card").unwrap();
        assert_eq!(values.note, "Transaction fee (card)");

        let values = FeeExpenseValues::new(dec!(1), "USD", Utc::now(), " ").unwrap();
        assert_eq!(values.note, "Transaction fee");

        assert!(FeeExpenseValues::new(Decimal::ZERO, "USD", Utc::now(), "card").is_err());
    }

    #[test]
    fn test_expense_apply_overwrites() {
        let key = ExpenseKey::transaction_fee(Uuid::now_v7(), Uuid::now_v7());
        let first = FeeExpenseValues::new(dec!(1), "USD", Utc::now(), "card").unwrap();
        let second = FeeExpenseValues::new(dec!(2), "USD", Utc::now(), "wallet").unwrap();

        let mut expense = Expense::for_key(&key, &first);
        let id = expense.id;
        expense.apply(&second);

        assert_eq!(expense.id, id);
        assert_eq!(expense.amount, dec!(2));
        assert_eq!(expense.note.as_deref(), Some("Transaction fee (wallet)"));
        assert_eq!(expense.category, ExpenseCategory::TransactionFee);
    }

    #[test]
    fn test_str_enum_round_trip() {
        assert_eq!("transaction_fee".parse::<ExpenseCategory>().unwrap(), ExpenseCategory::TransactionFee);
        assert_eq!(OrderStatus::Pending.as_str(), "pending");
        assert!("bogus".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_dedupe_record_starts_in_flight() {
        let record = DedupeRecord::new(Uuid::now_v7(), "abc", Fingerprint::from_bytes([0; 32]));
        assert!(!record.is_complete());
    }
}
