//! Test helper functions for database seeding and inspection.

use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::Result;
use stockroom_domain::{Business, BusinessId, OrderId, PaymentMethodFee, Variant};
use stockroom_store::{BusinessRepository, InventoryRepository, PgStore, Transactional, TxOptions};

/// A seeded tenant
pub struct TestBusiness {
    pub business: Business,
    pub variants: Vec<Variant>,
}

impl TestBusiness {
    pub fn id(&self) -> BusinessId {
        self.business.id
    }

    pub fn public_id(&self) -> &str {
        &self.business.storefront_public_id
    }
}

/// Seed a business with an enabled storefront, one variant per price and a
/// `card` payment method charging `fee_percent` plus `fee_fixed`.
///
/// The storefront public id is random, so tests sharing a database do not
/// collide.
pub async fn seed_business(
    store: &PgStore,
    prices: &[Decimal],
    fee_percent: Decimal,
    fee_fixed: Decimal,
) -> Result<TestBusiness> {
    let public_id = format!("shop-{}", Uuid::now_v7().simple());
    let business = Business::new("Test Shop", public_id, "USD");

    let mut tx = store.begin(TxOptions::default()).await?;
    store.save_business(&mut tx, &business).await?;
    store
        .save_payment_method(
            &mut tx,
            &PaymentMethodFee {
                business_id: business.id,
                descriptor: "card".to_string(),
                enabled: true,
                fee_percent,
                fee_fixed,
            },
        )
        .await?;

    let mut variants = Vec::with_capacity(prices.len());
    for (i, price) in prices.iter().enumerate() {
        let variant = Variant::new(business.id, format!("Item {}", i + 1), format!("SKU-{}", i + 1), *price, "USD");
        store.save_variant(&mut tx, &variant).await?;
        variants.push(variant);
    }
    store.commit(tx).await?;

    Ok(TestBusiness { business, variants })
}

/// Ledger rows of a business for one dedupe key (0 or 1)
pub async fn count_ledger_records(pool: &PgPool, business_id: BusinessId, dedupe_key: &str) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM storefront_requests WHERE business_id = $1 AND dedupe_key = $2",
    )
    .bind(business_id)
    .bind(dedupe_key)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Result reference stored on a ledger row, if the row exists and completed
pub async fn ledger_result_ref(
    pool: &PgPool,
    business_id: BusinessId,
    dedupe_key: &str,
) -> Result<Option<Uuid>> {
    let result_ref: Option<Option<Uuid>> = sqlx::query_scalar(
        "SELECT result_ref FROM storefront_requests WHERE business_id = $1 AND dedupe_key = $2",
    )
    .bind(business_id)
    .bind(dedupe_key)
    .fetch_optional(pool)
    .await?;
    Ok(result_ref.flatten())
}

/// Orders of a business
pub async fn count_orders(pool: &PgPool, business_id: BusinessId) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE business_id = $1")
        .bind(business_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Expenses linked to an order
pub async fn count_expenses(pool: &PgPool, business_id: BusinessId, order_id: OrderId) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM expenses WHERE business_id = $1 AND order_id = $2")
        .bind(business_id)
        .bind(order_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
