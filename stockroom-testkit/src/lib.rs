//! Test helpers for Stockroom database-backed tests.
//!
//! Provides schema setup, tenant seeding through the Postgres store, and raw
//! row counts for asserting on what actually landed in the tables.

mod helpers;

pub use helpers::{
    count_expenses, count_ledger_records, count_orders, ledger_result_ref, seed_business,
    TestBusiness,
};

use anyhow::Result;
use sqlx::PgPool;

/// Setup a clean test database by running migrations.
///
/// Convenience function for tests that need a fresh schema.
/// Note: migrations are located at the workspace root.
pub async fn setup_test_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}
