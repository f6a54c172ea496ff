//! Stockroom Domain Layer
//!
//! Pure domain types with zero I/O dependencies: tenant-scoped entities,
//! the dedupe ledger record, and validated value objects.

#![warn(clippy::all)]

// Public modules
pub mod entities;
pub mod value_objects;

// Re-export commonly used types
pub use entities::{
    format_order_number, Business, BusinessId, Customer, CustomerAddress, CustomerId,
    CustomerUpsert, DedupeRecord, Expense, ExpenseCategory, ExpenseId, ExpenseKey, ExpenseType,
    FeeExpenseValues, Order, OrderId, OrderItem, OrderStatus, PaymentMethodFee, PaymentStatus,
    Variant, VariantId,
};
pub use value_objects::{DomainError, Email, Fingerprint, IdempotencyKey};
