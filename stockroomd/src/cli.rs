//! CLI subcommands for stockroomd.
//!
//! Provides `db migrate`, `db status`, `db seed` and `fees reconcile`.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use stockroom_db::{migrate, seed_demo, status};
use stockroom_store::PgStore;

use crate::accounting::FeeReconciler;
use crate::config::Config;
use crate::event_bus::OrderPaymentSucceeded;

/// Open a pool from `DATABASE_URL`.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let url = config
        .database
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("DATABASE_URL environment variable is required"))?;

    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("Failed to connect to database")
}

/// Run database CLI subcommands.
///
/// Supported commands:
/// - `stockroomd db migrate` - Run pending migrations
/// - `stockroomd db status` - Check migration status
/// - `stockroomd db seed [--storefront-id ID]` - Seed a demo business
pub async fn run_db_command(args: &[String], config: &Config) -> Result<()> {
    let Some(command) = args.get(2) else {
        return Err(anyhow!("Usage: stockroomd db <migrate|status|seed> [options]"));
    };

    let pool = connect(config).await?;

    match command.as_str() {
        "migrate" => migrate(&pool).await?,
        "status" => {
            let applied = status(&pool).await?;
            info!(applied = applied.len(), "Migration status checked");
        },
        "seed" => {
            let storefront_id = parse_flag(&args[3..], "--storefront-id")?;
            let store = PgStore::new(pool);
            let seed = seed_demo(&store, storefront_id.as_deref()).await?;
            info!(
                business_id = %seed.business_id,
                storefront = %seed.storefront_public_id,
                created = seed.created,
                "Seed complete"
            );
            for variant_id in &seed.variant_ids {
                info!(%variant_id, "Variant available");
            }
        },
        other => {
            return Err(anyhow!("Unknown db command: {}. Use migrate, status, or seed", other));
        },
    }

    Ok(())
}

/// Run fee CLI subcommands.
///
/// - `stockroomd fees reconcile <business_id> <order_id> <total> <currency> <method>`
///
/// Records the fee as if a payment event had arrived; safe to repeat.
pub async fn run_fees_command(args: &[String], config: &Config) -> Result<()> {
    const USAGE: &str =
        "Usage: stockroomd fees reconcile <business_id> <order_id> <total> <currency> <method>";

    match args.get(2).map(String::as_str) {
        Some("reconcile") => {},
        _ => return Err(anyhow!(USAGE)),
    }
    let fields = args.get(3..8).ok_or_else(|| anyhow!(USAGE))?;
    let [business_id, order_id, total, currency, method] = fields else {
        return Err(anyhow!(USAGE));
    };

    let event = OrderPaymentSucceeded {
        business_id: Uuid::parse_str(business_id).context("invalid business_id")?,
        order_id: Uuid::parse_str(order_id).context("invalid order_id")?,
        order_total: Decimal::from_str(total).context("invalid total")?,
        currency: currency.to_uppercase(),
        payment_method: method.clone(),
        paid_at: Utc::now(),
    };

    let store = Arc::new(PgStore::new(connect(config).await?));
    let reconciler = FeeReconciler::new(store, config.fees.clone());

    match reconciler.reconcile(&event).await? {
        Some(expense) => info!(expense_id = %expense.id, amount = %expense.amount, "Fee expense upserted"),
        None => info!("No fee owed for this payment"),
    }
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Result<Option<String>> {
    let mut value = None;
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            let v = args.get(i + 1).ok_or_else(|| anyhow!("{} requires a value", flag))?;
            value = Some(v.clone());
            i += 2;
        } else {
            return Err(anyhow!("Unknown option: {}", args[i]));
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag(&args(&[]), "--storefront-id").unwrap(), None);
        assert_eq!(
            parse_flag(&args(&["--storefront-id", "shop"]), "--storefront-id").unwrap(),
            Some("shop".to_string())
        );
        assert!(parse_flag(&args(&["--storefront-id"]), "--storefront-id").is_err());
        assert!(parse_flag(&args(&["--bogus"]), "--storefront-id").is_err());
    }

    #[tokio::test]
    async fn test_fees_command_validates_before_connecting() {
        let config = Config::test();

        let err = run_fees_command(&args(&["stockroomd", "fees", "reconcile", "x"]), &config)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Usage"));

        let err = run_fees_command(
            &args(&["stockroomd", "fees", "reconcile", "nope", "nope", "1", "USD", "card"]),
            &config,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("invalid business_id"));
    }

    #[tokio::test]
    async fn test_db_command_requires_database_url() {
        let err = run_db_command(&args(&["stockroomd", "db", "status"]), &Config::test())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
