//! Stockroom Daemon
//!
//! Storefront order intake and fee reconciliation over Postgres.
//!
//! # Usage
//!
//! ```bash
//! # Apply migrations and seed a demo storefront
//! stockroomd db migrate
//! stockroomd db seed --storefront-id demo-shop
//!
//! # Record the transaction fee of a paid order
//! stockroomd fees reconcile <business_id> <order_id> 120.00 USD card
//!
//! # Run the background workers
//! stockroomd run
//! ```
//!
//! # Environment Variables
//!
//! - `STOCKROOM_ENV`: Environment (test, development, production)
//! - `DATABASE_URL`: Postgres connection string
//! - `STOCKROOM_DB_MAX_CONNECTIONS`: Pool size (default: 10)
//! - `STOCKROOM_STOREFRONT_MAX_RETRIES`: Order retries (default: 2)
//! - `STOCKROOM_FEE_MAX_RETRIES`: Fee upsert retries (default: 3)
//! - `STOCKROOM_RETRY_BACKOFF_MS`: Base retry backoff (default: 10)
//! - `STOCKROOM_RATE_LIMIT_BURST`: Orders per client per window (default: 10)
//! - `STOCKROOM_RATE_LIMIT_WINDOW_SECS`: Rate limit window (default: 60)
//! - `STOCKROOM_RATE_LIMIT_MIN_INTERVAL_MS`: Minimum order spacing (default: 1000)
//! - `STOCKROOM_EVENT_BUS_CAPACITY`: Event bus buffer (default: 1000)

use std::sync::Arc;

use stockroom_store::PgStore;
use stockroomd::cli::{connect, run_db_command, run_fees_command};
use stockroomd::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("stockroomd=info".parse()?))
        .init();

    let config = Config::from_env()?;
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("db") => return run_db_command(&args, &config).await,
        Some("fees") => return run_fees_command(&args, &config).await,
        Some("run") | None => {},
        Some(other) => {
            return Err(anyhow::anyhow!("Unknown command: {}. Use db, fees, or run", other));
        },
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Stockroom Daemon"
    );

    let store = Arc::new(PgStore::new(connect(&config).await?));
    let daemon = Daemon::new(config, store);
    daemon.run().await?;

    Ok(())
}
