use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rapidreach::capabilities::Capabilities;
use rapidreach::config::AppConfig;
use rapidreach::dashboard::{AppState, dashboard_routes};
use rapidreach::events::bus::EventBus;
use rapidreach::inbound::{InboundRouter, spawn_inbox_poller};
use rapidreach::leads::discovery::DiscoveryService;
use rapidreach::leads::registry::LeadRegistry;
use rapidreach::meetings::MeetingBook;
use rapidreach::pipeline::{PipelineRunner, RunLedger, RunManager};
use rapidreach::store::{DurableStore, LibSqlStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = AppConfig::from_env();
    config.validate().context("invalid configuration")?;

    // ── Tracing ─────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rapidreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📞 RapidReach v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Observer WS: ws://0.0.0.0:{}/ws", config.http_port);
    eprintln!("   API:         http://0.0.0.0:{}/api", config.http_port);

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn DurableStore> = match &config.db_path {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let store = LibSqlStore::new_local(path)
                .await
                .with_context(|| format!("opening database at {}", path.display()))?;
            eprintln!("   Database:    {}", path.display());
            Arc::new(store)
        }
        None => {
            eprintln!("   Database:    in-memory (set RAPIDREACH_DB_PATH to persist)");
            Arc::new(MemoryStore::new())
        }
    };

    // ── Core ────────────────────────────────────────────────────────────
    let bus = EventBus::new(config.bus.clone());
    let retry = config.pipeline.retry;
    let caps = Capabilities::from_config(&config.keys);

    let registry = LeadRegistry::new(store.clone(), bus.clone(), retry);
    let ledger = RunLedger::new(store.clone(), bus.clone(), retry);
    let meetings = MeetingBook::new(store.clone(), bus.clone(), retry);

    let leads = registry.hydrate().await.context("loading leads")?;
    let runs = ledger.hydrate().await.context("loading runs")?;
    let booked = meetings.hydrate().await.context("loading meetings")?;
    eprintln!("   Restored:    {leads} leads, {runs} runs, {booked} meetings");

    let organizer = config
        .router
        .sales_address
        .clone()
        .or_else(|| config.keys.smtp.as_ref().map(|s| s.from_address.clone()));
    let runner = PipelineRunner::new(
        caps.clone(),
        registry.clone(),
        ledger.clone(),
        config.pipeline.clone(),
        &config.scheduling,
        organizer,
    );
    let run_manager = RunManager::new(ledger, runner, registry.clone());

    let discovery = DiscoveryService::new(
        registry.clone(),
        caps.search.clone(),
        config.discovery.clone(),
        retry,
        config.pipeline.stage_timeout,
    );

    let inbound = InboundRouter::new(
        caps,
        registry.clone(),
        run_manager.clone(),
        meetings.clone(),
        bus.clone(),
        config.router.clone(),
        config.scheduling.clone(),
        retry,
        config.pipeline.stage_timeout,
    );
    let (_poller, poller_shutdown) = spawn_inbox_poller(
        inbound.clone(),
        Duration::from_secs(config.router.poll_interval_secs.max(1)),
    );

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = dashboard_routes(AppState {
        registry,
        bus: bus.clone(),
        runs: run_manager,
        discovery,
        inbound,
        meetings,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("binding port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Dashboard server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("serving dashboard")?;

    poller_shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    bus.shutdown();
    tracing::info!("RapidReach stopped");
    Ok(())
}
