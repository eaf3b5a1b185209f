//! price-ingest binary
//!
//! Wires the store, ingestion orchestrator, staleness monitor and snapshot
//! rollup together and runs them until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use price_ingest::config::{AppConfig, LoggingConfig};
use price_ingest::monitor::StalenessMonitor;
use price_ingest::oracle::sources::{
    http_client, CoinGeckoSource, PriceAdapter, PythHermesSource, StreamingSource,
    SubstreamsSource,
};
use price_ingest::oracle::{
    FallbackChain, IngestHealth, IngestOrchestrator, IngestSink, OrchestratorTiming,
};
use price_ingest::persistence::{seed_tokens_if_empty, CsvPriceStore, PriceStore};
use price_ingest::rollup::SnapshotRollup;
use price_ingest::shutdown::Shutdown;
use price_ingest::types::default_tokens;

fn init_logging(cfg: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    if cfg.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(&config.logging);

    info!("🚀 Starting price-ingest v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %config, "Configuration loaded");

    let store = Arc::new(
        CsvPriceStore::open(&config.persistence.data_dir).with_context(|| {
            format!("Failed to open data dir {}", config.persistence.data_dir)
        })?,
    );
    let store: Arc<dyn PriceStore> = store;

    if config.persistence.seed_tokens {
        let seeded = seed_tokens_if_empty(store.as_ref(), &default_tokens())
            .await
            .context("Failed to seed tokens")?;
        if seeded > 0 {
            info!(tokens = seeded, "Seeded default tokens");
        }
    }

    let health = Arc::new(IngestHealth::new());
    let sink = IngestSink::new(store.clone(), health.clone());

    let client = http_client(config.http.timeout()).context("Failed to build HTTP client")?;
    let chain = FallbackChain::new(vec![
        Arc::new(PythHermesSource::new(client.clone(), config.pyth.base_url.clone()))
            as Arc<dyn PriceAdapter>,
        Arc::new(CoinGeckoSource::new(client, config.coingecko.base_url.clone())),
    ]);

    let streaming: Option<Arc<dyn StreamingSource>> = if config.streaming.enabled {
        Some(Arc::new(SubstreamsSource::new(config.streaming.clone())))
    } else {
        warn!("Streaming disabled by configuration");
        None
    };

    let orchestrator = Arc::new(IngestOrchestrator::new(
        streaming,
        chain,
        sink,
        OrchestratorTiming {
            poll_interval: config.poll_interval(),
            restart_delay: config.streaming.restart_delay(),
        },
    ));
    let monitor = StalenessMonitor::new(
        store.clone(),
        health,
        config.staleness_threshold(),
        config.monitor_interval(),
    );
    let rollup = SnapshotRollup::new(store, config.rollup_interval());

    let shutdown = Shutdown::new();
    let tasks = vec![
        tokio::spawn(orchestrator.clone().run(shutdown.listener())),
        {
            let listener = shutdown.listener();
            tokio::spawn(async move { monitor.run(listener).await })
        },
        {
            let listener = shutdown.listener();
            tokio::spawn(async move { rollup.run(listener).await })
        },
    ];

    info!("✅ Price ingestion running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!(state = %orchestrator.state(), "Shutdown requested");
    shutdown.trigger();

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }

    info!("👋 price-ingest stopped");
    Ok(())
}
