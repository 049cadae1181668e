use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    config::Config,
    error::AppResult,
    ledger::{LedgerRepository, LedgerStore, MemoryLedgerStore},
    rails::{build_client, RailRegistry},
    rates::{HttpRateSource, RateSource, StaticRateSource},
    settlement::{InvoiceSettings, PollerConfig, ReconciliationPoller, SettlementOrchestrator},
};

/// Everything `main` needs to serve and reconcile
pub struct Components {
    pub state: AppState,
    pub poller: ReconciliationPoller,
}

pub async fn initialize_components(config: &Config) -> AppResult<Components> {
    info!("Initializing application components ...");

    let store: Arc<dyn LedgerStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = initialize_database(url, config).await?;
            Arc::new(LedgerRepository::new(pool))
        }
        None => {
            warn!("⚠️  DATABASE_URL not set - using the in-memory ledger store, balances will not survive a restart");
            Arc::new(MemoryLedgerStore::new())
        }
    };
    info!("✅ Ledger store ready: {}", store.backend());

    let rails = Arc::new(RailRegistry::from_config(config)?);
    info!("🔗 Rails registered: {:?}", rails.rails());

    let rates: Arc<dyn RateSource> = match config.static_rate_table() {
        Some(table) => {
            warn!("Using static exchange rates for {} assets", table.len());
            Arc::new(StaticRateSource::new(table))
        }
        None => {
            let client = build_client(config.rail_timeout())?;
            Arc::new(HttpRateSource::new(client, config.rate_source_url.clone()))
        }
    };
    info!("✅ Rate source initialized");

    let orchestrator = Arc::new(SettlementOrchestrator::new(
        store,
        rails,
        rates,
        InvoiceSettings::from_config(config),
    ));

    let poller = ReconciliationPoller::new(PollerConfig::from_config(config), orchestrator.clone());

    Ok(Components {
        state: AppState { orchestrator },
        poller,
    })
}

pub async fn initialize_database(database_url: &str, config: &Config) -> AppResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!(
        "✓ Database pool configured: {} max connections",
        config.db_max_connections
    );

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
