//! Database lifecycle management for Stockroom.
//!
//! Provides migration running, status checking, and demo data seeding.

mod seed;

pub use seed::{seed_demo, DemoSeed, DEMO_PAYMENT_METHOD, DEMO_STOREFRONT_ID};

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

/// Result type for DB operations.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// One row of `_sqlx_migrations`
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: i64,
    pub description: String,
    pub installed_on: DateTime<Utc>,
    pub success: bool,
}

/// Run all pending migrations.
///
/// Uses sqlx migrations from the workspace `migrations/` directory.
/// Idempotent: safe to run multiple times.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    sqlx::migrate!("../migrations").run(pool).await?;

    info!("Migrations completed successfully");
    Ok(())
}

/// Check connectivity and report applied migrations, newest first.
///
/// An empty list means the database was never migrated.
pub async fn status(pool: &PgPool) -> Result<Vec<AppliedMigration>> {
    let ping: i64 = sqlx::query_scalar("SELECT 1::BIGINT").fetch_one(pool).await?;
    if ping != 1 {
        return Err(anyhow::anyhow!("Database connectivity check failed"));
    }
    info!("Database connectivity: OK");

    let table: Option<String> =
        sqlx::query_scalar("SELECT to_regclass('_sqlx_migrations')::TEXT").fetch_one(pool).await?;
    if table.is_none() {
        warn!("Migration table not found (run `stockroomd db migrate` first)");
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT version, description, installed_on, success
        FROM _sqlx_migrations
        ORDER BY version DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut applied = Vec::with_capacity(rows.len());
    for row in rows {
        applied.push(AppliedMigration {
            version: row.try_get("version")?,
            description: row.try_get("description")?,
            installed_on: row.try_get("installed_on")?,
            success: row.try_get("success")?,
        });
    }

    if applied.is_empty() {
        warn!("No migrations applied (run `stockroomd db migrate` first)");
    }
    for mig in &applied {
        let mark = if mig.success { "✓" } else { "✗" };
        info!("  {} v{}: {} ({})", mark, mig.version, mig.description, mig.installed_on.to_rfc3339());
    }

    Ok(applied)
}
