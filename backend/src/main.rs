//! Material Issue Engine - maintenance binary
//!
//! Applies database migrations and audits the reservation ledger. Exits with
//! a non-zero status when any lot is oversubscribed.

use std::process::ExitCode;

use issue_engine::services::AuditService;
use issue_engine::store::PgStore;
use issue_engine::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "issue_engine=debug,sqlx=warn".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    init_tracing(config.logging.json);

    tracing::info!("Starting Material Issue Engine");
    tracing::info!("Environment: {}", config.environment);

    tracing::info!("Connecting to database...");
    let store = PgStore::connect(&config.database).await?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    store.migrate().await?;
    tracing::info!("Migrations completed");

    let report = AuditService::new(store).audit_reservations().await?;
    if report.is_clean() {
        tracing::info!(lots = report.lots_checked, "Reservation ledger is consistent");
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!(
            violations = report.oversubscribed.len(),
            "Reservation ledger has oversubscribed lots"
        );
        Ok(ExitCode::FAILURE)
    }
}
