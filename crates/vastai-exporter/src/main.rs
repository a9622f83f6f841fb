//! vastai-exporter - Prometheus exporter for the Vast.ai GPU marketplace.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vast_geo::GeoCache;

use vastai_exporter::config::Cli;
use vastai_exporter::metrics::{AccountMetrics, GlobalMetrics};
use vastai_exporter::{create_router, AppState, PayoutTracker, Poller, VastClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let state_dir = cli.resolve_state_dir();

    info!("starting Vast.ai exporter");

    // Geolocation is active only with MaxMind credentials.
    let geo = match &cli.maxmind_key {
        Some(key) => Some(
            GeoCache::open(&state_dir, key, &cli.no_geolocation)
                .context("loading geolocation cache")?,
        ),
        None => None,
    };

    let client = VastClient::new(cli.key.clone()).context("building API client")?;
    let use_account = client.has_api_key();

    let global = GlobalMetrics::new();
    let account = use_account.then(AccountMetrics::new);
    if !use_account {
        info!("no Vast.ai API key provided, only serving global stats");
    }
    let state = Arc::new(AppState::new(global, account));

    let tracker = PayoutTracker::load(&state_dir);
    let mut poller = Poller::new(client, cli.master_url.clone(), geo, tracker, state.clone());

    info!("reading initial Vast.ai info (may take a minute)");
    poller
        .bootstrap()
        .await
        .context("initial update must succeed")?;

    tokio::spawn(poller.run(Duration::from_secs(cli.update_interval)));

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!(addr = %cli.listen, "listening");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
