mod api;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod middleware;
mod rails;
mod rates;
mod server;
mod settlement;

#[cfg(test)]
mod testing;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,settlement_engine=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting Settlement Engine");

    let config = config::Config::from_env().context("loading configuration")?;

    let components = bootstrap::initialize_components(&config)
        .await
        .context("initializing components")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = components.poller.start(shutdown_rx);

    let app = server::create_app(components.state, &config);

    server::run_server(app, &config.bind_address, async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    })
    .await
    .context("serving HTTP")?;

    poller.await.context("joining reconciliation poller")?;
    info!("👋 Settlement engine stopped");

    Ok(())
}
