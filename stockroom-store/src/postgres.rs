//! PostgreSQL store implementation.
//!
//! Every repository call runs on an explicit `sqlx::Transaction`. Inserts that
//! can race on a unique key use `ON CONFLICT DO NOTHING RETURNING`, so a lost
//! race surfaces as `StoreError::Duplicate` without aborting the transaction.
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.

use crate::error::StoreError;
use crate::repository::{
    BusinessRepository, CustomerRepository, ExpenseRepository, InventoryRepository,
    LedgerRepository, OrderRepository, Transactional, TxOptions,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use stockroom_domain::{
    Business, BusinessId, Customer, CustomerAddress, CustomerUpsert, DedupeRecord, Email, Expense,
    ExpenseKey, Fingerprint, Order, OrderId, OrderItem, PaymentMethodFee, Variant, VariantId,
};
use uuid::Uuid;

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap a connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

type PgTx = Transaction<'static, Postgres>;

// =============================================================================
// Row parsing
// =============================================================================

fn parse_dedupe_row(row: &PgRow) -> Result<DedupeRecord, StoreError> {
    let fingerprint: String = row.try_get("fingerprint")?;
    Ok(DedupeRecord {
        id: row.try_get("id")?,
        scope: row.try_get("business_id")?,
        dedupe_key: row.try_get("dedupe_key")?,
        fingerprint: fingerprint.parse::<Fingerprint>()?,
        result_ref: row.try_get("result_ref")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_business_row(row: &PgRow) -> Result<Business, StoreError> {
    Ok(Business {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        storefront_public_id: row.try_get("storefront_public_id")?,
        storefront_enabled: row.try_get("storefront_enabled")?,
        currency: row.try_get("currency")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_variant_row(row: &PgRow) -> Result<Variant, StoreError> {
    Ok(Variant {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        name: row.try_get("name")?,
        sku: row.try_get("sku")?,
        sale_price: row.try_get("sale_price")?,
        currency: row.try_get("currency")?,
    })
}

fn parse_customer_row(row: &PgRow) -> Result<Customer, StoreError> {
    let email: String = row.try_get("email")?;
    Ok(Customer {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        email: Email::parse(&email)?,
        name: row.try_get("name")?,
        phone_code: row.try_get("phone_code")?,
        phone_number: row.try_get("phone_number")?,
        instagram_username: row.try_get("instagram_username")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_order_row(row: &PgRow, items: Vec<OrderItem>) -> Result<Order, StoreError> {
    let status: String = row.try_get("status")?;
    let payment_status: String = row.try_get("payment_status")?;
    Ok(Order {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        sequence: row.try_get("sequence")?,
        order_number: row.try_get("order_number")?,
        customer_id: row.try_get("customer_id")?,
        shipping_address_id: row.try_get("shipping_address_id")?,
        status: status.parse()?,
        payment_status: payment_status.parse()?,
        items,
        total: row.try_get("total")?,
        currency: row.try_get("currency")?,
        note: row.try_get("note")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_expense_row(row: &PgRow) -> Result<Expense, StoreError> {
    let category: String = row.try_get("category")?;
    let expense_type: String = row.try_get("expense_type")?;
    Ok(Expense {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        order_id: row.try_get("order_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        category: category.parse()?,
        expense_type: expense_type.parse()?,
        note: row.try_get("note")?,
        occurred_on: row.try_get("occurred_on")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const EXPENSE_COLUMNS: &str = "id, business_id, order_id, amount, currency, category, \
     expense_type, note, occurred_on, created_at, updated_at";

const CUSTOMER_COLUMNS: &str = "id, business_id, email, name, phone_code, phone_number, \
     instagram_username, created_at, updated_at";

// =============================================================================
// Transactions
// =============================================================================

#[async_trait]
impl Transactional for PgStore {
    type Tx = PgTx;

    async fn begin(&self, options: TxOptions) -> Result<PgTx, StoreError> {
        let mut tx = self.pool.begin().await?;
        if let Some(statement) = options.isolation.set_statement() {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        if options.read_only {
            sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
        }
        Ok(tx)
    }

    async fn commit(&self, tx: PgTx) -> Result<(), StoreError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: PgTx) -> Result<(), StoreError> {
        tx.rollback().await?;
        Ok(())
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[async_trait]
impl LedgerRepository for PgStore {
    async fn create_record(
        &self,
        tx: &mut PgTx,
        scope: BusinessId,
        dedupe_key: &str,
        fingerprint: Fingerprint,
    ) -> Result<DedupeRecord, StoreError> {
        let record = DedupeRecord::new(scope, dedupe_key, fingerprint);

        let inserted = sqlx::query(
            r#"
            INSERT INTO storefront_requests (
                id, business_id, dedupe_key, fingerprint, result_ref, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, NULL, $5, $5)
            ON CONFLICT (business_id, dedupe_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id)
        .bind(scope)
        .bind(dedupe_key)
        .bind(fingerprint.to_hex())
        .bind(record.created_at)
        .fetch_optional(&mut **tx)
        .await?;

        match inserted {
            Some(_) => Ok(record),
            None => {
                debug!(%scope, dedupe_key, "Dedupe key already claimed");
                Err(StoreError::duplicate("dedupe_record", dedupe_key))
            },
        }
    }

    async fn find_record(
        &self,
        tx: &mut PgTx,
        scope: BusinessId,
        dedupe_key: &str,
    ) -> Result<Option<DedupeRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, business_id, dedupe_key, fingerprint, result_ref, created_at, updated_at
            FROM storefront_requests
            WHERE business_id = $1 AND dedupe_key = $2
            "#,
        )
        .bind(scope)
        .bind(dedupe_key)
        .fetch_optional(&mut **tx)
        .await?;

        row.as_ref().map(parse_dedupe_row).transpose()
    }

    async fn attach_result(
        &self,
        tx: &mut PgTx,
        scope: BusinessId,
        record_id: Uuid,
        result_ref: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE storefront_requests
            SET result_ref = $1, updated_at = NOW()
            WHERE id = $2 AND business_id = $3
            "#,
        )
        .bind(result_ref)
        .bind(record_id)
        .bind(scope)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("dedupe_record", record_id.to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Businesses
// =============================================================================

#[async_trait]
impl BusinessRepository for PgStore {
    async fn save_business(&self, tx: &mut PgTx, business: &Business) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO businesses (
                id, name, storefront_public_id, storefront_enabled, currency, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                storefront_public_id = EXCLUDED.storefront_public_id,
                storefront_enabled = EXCLUDED.storefront_enabled,
                currency = EXCLUDED.currency
            "#,
        )
        .bind(business.id)
        .bind(&business.name)
        .bind(&business.storefront_public_id)
        .bind(business.storefront_enabled)
        .bind(&business.currency)
        .bind(business.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn find_by_storefront_id(
        &self,
        tx: &mut PgTx,
        storefront_public_id: &str,
    ) -> Result<Option<Business>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, storefront_public_id, storefront_enabled, currency, created_at
            FROM businesses
            WHERE storefront_public_id = $1
            "#,
        )
        .bind(storefront_public_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.as_ref().map(parse_business_row).transpose()
    }

    async fn save_payment_method(
        &self,
        tx: &mut PgTx,
        fee: &PaymentMethodFee,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO business_payment_methods (business_id, descriptor, enabled, fee_percent, fee_fixed)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (business_id, descriptor) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                fee_percent = EXCLUDED.fee_percent,
                fee_fixed = EXCLUDED.fee_fixed
            "#,
        )
        .bind(fee.business_id)
        .bind(&fee.descriptor)
        .bind(fee.enabled)
        .bind(fee.fee_percent)
        .bind(fee.fee_fixed)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn find_payment_method(
        &self,
        tx: &mut PgTx,
        business_id: BusinessId,
        descriptor: &str,
    ) -> Result<Option<PaymentMethodFee>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT business_id, descriptor, enabled, fee_percent, fee_fixed
            FROM business_payment_methods
            WHERE business_id = $1 AND descriptor = $2
            "#,
        )
        .bind(business_id)
        .bind(descriptor)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PaymentMethodFee {
            business_id: row.try_get("business_id")?,
            descriptor: row.try_get("descriptor")?,
            enabled: row.try_get("enabled")?,
            fee_percent: row.try_get("fee_percent")?,
            fee_fixed: row.try_get("fee_fixed")?,
        }))
    }
}

// =============================================================================
// Inventory
// =============================================================================

#[async_trait]
impl InventoryRepository for PgStore {
    async fn save_variant(&self, tx: &mut PgTx, variant: &Variant) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO variants (id, business_id, name, sku, sale_price, currency)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                sku = EXCLUDED.sku,
                sale_price = EXCLUDED.sale_price,
                currency = EXCLUDED.currency
            "#,
        )
        .bind(variant.id)
        .bind(variant.business_id)
        .bind(&variant.name)
        .bind(&variant.sku)
        .bind(variant.sale_price)
        .bind(&variant.currency)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn find_variants(
        &self,
        tx: &mut PgTx,
        business_id: BusinessId,
        ids: &[VariantId],
    ) -> Result<Vec<Variant>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, business_id, name, sku, sale_price, currency
            FROM variants
            WHERE business_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(business_id)
        .bind(ids.to_vec())
        .fetch_all(&mut **tx)
        .await?;

        rows.iter().map(parse_variant_row).collect()
    }
}

// =============================================================================
// Customers
// =============================================================================

#[async_trait]
impl CustomerRepository for PgStore {
    async fn upsert_by_email(
        &self,
        tx: &mut PgTx,
        business_id: BusinessId,
        input: &CustomerUpsert,
    ) -> Result<Customer, StoreError> {
        let candidate = Customer::from_upsert(business_id, input);

        let query = format!(
            r#"
            INSERT INTO customers (
                id, business_id, email, name, phone_code, phone_number,
                instagram_username, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (business_id, email) DO UPDATE SET
                name = EXCLUDED.name,
                phone_code = COALESCE(EXCLUDED.phone_code, customers.phone_code),
                phone_number = COALESCE(EXCLUDED.phone_number, customers.phone_number),
                instagram_username = COALESCE(EXCLUDED.instagram_username, customers.instagram_username),
                updated_at = EXCLUDED.updated_at
            RETURNING {CUSTOMER_COLUMNS}
            "#
        );

        let row = sqlx::query(&query)
            .bind(candidate.id)
            .bind(business_id)
            .bind(candidate.email.as_str())
            .bind(&candidate.name)
            .bind(&candidate.phone_code)
            .bind(&candidate.phone_number)
            .bind(&candidate.instagram_username)
            .bind(candidate.created_at)
            .fetch_one(&mut **tx)
            .await?;

        parse_customer_row(&row)
    }

    async fn create_address(
        &self,
        tx: &mut PgTx,
        address: &CustomerAddress,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO customer_addresses (
                id, business_id, customer_id, country_code, state, city,
                street, zip_code, phone_code, phone_number, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(address.id)
        .bind(address.business_id)
        .bind(address.customer_id)
        .bind(&address.country_code)
        .bind(&address.state)
        .bind(&address.city)
        .bind(&address.street)
        .bind(&address.zip_code)
        .bind(&address.phone_code)
        .bind(&address.phone_number)
        .bind(address.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

// =============================================================================
// Orders
// =============================================================================

#[async_trait]
impl OrderRepository for PgStore {
    async fn next_order_sequence(
        &self,
        tx: &mut PgTx,
        business_id: BusinessId,
    ) -> Result<i64, StoreError> {
        let next = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM orders WHERE business_id = $1",
        )
        .bind(business_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(next)
    }

    async fn insert_order(&self, tx: &mut PgTx, order: &Order) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (
                id, business_id, sequence, order_number, customer_id, shipping_address_id,
                status, payment_status, total, currency, note, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(order.id)
        .bind(order.business_id)
        .bind(order.sequence)
        .bind(&order.order_number)
        .bind(order.customer_id)
        .bind(order.shipping_address_id)
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.total)
        .bind(&order.currency)
        .bind(&order.note)
        .bind(order.created_at)
        .fetch_optional(&mut **tx)
        .await?;

        if inserted.is_none() {
            return Err(StoreError::duplicate("order", &order.order_number));
        }

        for (position, item) in order.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, position, variant_id, quantity, unit_price, total)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.id)
            .bind(position as i32)
            .bind(item.variant_id)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.total)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    async fn find_order(
        &self,
        tx: &mut PgTx,
        business_id: BusinessId,
        order_id: OrderId,
    ) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, business_id, sequence, order_number, customer_id, shipping_address_id,
                   status, payment_status, total, currency, note, created_at
            FROM orders
            WHERE business_id = $1 AND id = $2
            "#,
        )
        .bind(business_id)
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let item_rows = sqlx::query(
            r#"
            SELECT variant_id, quantity, unit_price, total
            FROM order_items
            WHERE order_id = $1
            ORDER BY position
            "#,
        )
        .bind(order_id)
        .fetch_all(&mut **tx)
        .await?;

        let items = item_rows
            .iter()
            .map(|r| {
                Ok(OrderItem {
                    variant_id: r.try_get("variant_id")?,
                    quantity: r.try_get("quantity")?,
                    unit_price: r.try_get("unit_price")?,
                    total: r.try_get("total")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        parse_order_row(&row, items).map(Some)
    }

    async fn count_orders(&self, tx: &mut PgTx, business_id: BusinessId) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM orders WHERE business_id = $1")
            .bind(business_id)
            .fetch_one(&mut **tx)
            .await?;
        Ok(count)
    }
}

// =============================================================================
// Expenses
// =============================================================================

#[async_trait]
impl ExpenseRepository for PgStore {
    async fn find_for_update(
        &self,
        tx: &mut PgTx,
        key: &ExpenseKey,
    ) -> Result<Option<Expense>, StoreError> {
        let query = format!(
            r#"
            SELECT {EXPENSE_COLUMNS}
            FROM expenses
            WHERE business_id = $1 AND order_id = $2 AND category = $3
            FOR UPDATE
            "#
        );

        let row = sqlx::query(&query)
            .bind(key.business_id)
            .bind(key.order_id)
            .bind(key.category.as_str())
            .fetch_optional(&mut **tx)
            .await?;

        row.as_ref().map(parse_expense_row).transpose()
    }

    async fn insert_expense(&self, tx: &mut PgTx, expense: &Expense) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO expenses (
                id, business_id, order_id, amount, currency, category,
                expense_type, note, occurred_on, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(expense.id)
        .bind(expense.business_id)
        .bind(expense.order_id)
        .bind(expense.amount)
        .bind(&expense.currency)
        .bind(expense.category.as_str())
        .bind(expense.expense_type.as_str())
        .bind(&expense.note)
        .bind(expense.occurred_on)
        .bind(expense.created_at)
        .bind(expense.updated_at)
        .fetch_optional(&mut **tx)
        .await?;

        if inserted.is_none() {
            return Err(StoreError::duplicate("expense", expense.id.to_string()));
        }
        Ok(())
    }

    async fn update_expense(&self, tx: &mut PgTx, expense: &Expense) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE expenses
            SET amount = $1, currency = $2, expense_type = $3, note = $4,
                occurred_on = $5, updated_at = $6
            WHERE id = $7
            "#,
        )
        .bind(expense.amount)
        .bind(&expense.currency)
        .bind(expense.expense_type.as_str())
        .bind(&expense.note)
        .bind(expense.occurred_on)
        .bind(Utc::now())
        .bind(expense.id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("expense", expense.id.to_string()));
        }
        Ok(())
    }

    async fn find_expenses_by_order(
        &self,
        tx: &mut PgTx,
        business_id: BusinessId,
        order_id: OrderId,
    ) -> Result<Vec<Expense>, StoreError> {
        let query = format!(
            r#"
            SELECT {EXPENSE_COLUMNS}
            FROM expenses
            WHERE business_id = $1 AND order_id = $2
            ORDER BY created_at
            "#
        );

        let rows = sqlx::query(&query)
            .bind(business_id)
            .bind(order_id)
            .fetch_all(&mut **tx)
            .await?;

        rows.iter().map(parse_expense_row).collect()
    }
}
