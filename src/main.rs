//! Helmsman entry point.
//!
//! Composition in dependency order: config, store, exchange adapter,
//! coordinator, cache, notifier, risk manager, reversal monitor,
//! scheduler, reconciler, health aggregator, HTTP. Shutdown is graceful:
//! in-flight exchange operations complete so their store writes (or
//! inconsistency breadcrumbs) always land.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use helmsman::api::{self, ApiState};
use helmsman::application::agent::tools::ToolDispatcher;
use helmsman::application::agent::HoldProvider;
use helmsman::application::health::HealthAggregator;
use helmsman::application::notifier::{LogSink, Notifier};
use helmsman::application::reconciler::Reconciler;
use helmsman::application::reversal_monitor::ReversalMonitor;
use helmsman::application::risk_manager::RiskManager;
use helmsman::application::scheduler::Scheduler;
use helmsman::config::{AppConfig, Venue};
use helmsman::domain::repositories::exchange_client::ExchangeClient;
use helmsman::domain::services::stop_policy::StopPolicy;
use helmsman::infrastructure::binance::{BinanceClient, BinanceConfig};
use helmsman::infrastructure::cache::{CachedExchange, MarketCache};
use helmsman::infrastructure::coordinator::{CoordinatorConfig, RequestCoordinator};
use helmsman::infrastructure::gate::{GateClient, GateConfig};
use helmsman::persistence::{self, repository::Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "helmsman=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Helmsman trading agent starting...");

    // config -> store
    let config = AppConfig::from_env();
    let pool = persistence::init_database(&config.database.url, config.database.max_connections)
        .await?;
    let store = Store::new(pool);

    // exchange adapter behind the coordinator, then the cache
    let coordinator = RequestCoordinator::new(
        match config.exchange.venue {
            Venue::Gate => "gate",
            Venue::Binance => "binance",
        },
        CoordinatorConfig::default(),
    );
    let raw_exchange: Arc<dyn ExchangeClient> = match config.exchange.venue {
        Venue::Gate => Arc::new(GateClient::new(
            &config.exchange.api_key,
            &config.exchange.api_secret,
            GateConfig::new(config.exchange.testnet),
            Arc::clone(&coordinator),
            config.symbols.clone(),
        )?),
        Venue::Binance => Arc::new(BinanceClient::new(
            &config.exchange.api_key,
            &config.exchange.api_secret,
            BinanceConfig::new(config.exchange.testnet),
            Arc::clone(&coordinator),
            config.symbols.clone(),
        )?),
    };
    let cache = Arc::new(MarketCache::new());
    let exchange: Arc<dyn ExchangeClient> = Arc::new(CachedExchange::new(
        Arc::clone(&raw_exchange),
        Arc::clone(&cache),
    ));
    let _reporting = coordinator.spawn_reporting();

    // notifier (SMTP collaborator not wired here; log sink keeps alerts
    // visible either way)
    if config.smtp.is_none() {
        warn!("SMTP not configured; alerts go to the log only");
    }
    let notifier = Notifier::with_default_cooldown(Arc::new(LogSink));

    // risk engine and its close worker
    let (risk, close_rx) = RiskManager::new(
        Arc::clone(&exchange),
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&notifier),
        StopPolicy::default(),
        config.symbols.clone(),
    );
    tokio::spawn(Arc::clone(&risk).run_close_worker(close_rx));

    // server-side trigger polling
    {
        let risk = Arc::clone(&risk);
        let interval = config.price_order_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = risk.poll_triggers_once().await {
                    error!("trigger poll failed: {}", e);
                }
            }
        });
    }

    // reversal monitor
    let monitor = ReversalMonitor::new(
        Arc::clone(&exchange),
        Arc::clone(&store),
        Arc::clone(&notifier),
        risk.close_sender(),
        config.reversal_interval,
    );
    tokio::spawn(monitor.run());

    // decision loop
    let provider = Arc::new(HoldProvider);
    let dispatcher = ToolDispatcher::new(
        Arc::clone(&risk),
        config.min_open_score,
        config.max_opportunities,
    );
    let scheduler = Scheduler::new(
        Arc::clone(&exchange),
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&risk),
        provider,
        dispatcher,
        Arc::clone(&notifier),
        config.symbols.clone(),
        config.trading_interval,
    );
    tokio::spawn(scheduler.run());

    // reconciler
    let reconciler = Reconciler::new(
        Arc::clone(&exchange),
        Arc::clone(&store),
        Arc::clone(&notifier),
        config.resolve_interval,
    );
    tokio::spawn(Arc::clone(&reconciler).run());

    // health aggregator + background refresh
    let health = HealthAggregator::new(
        Arc::clone(&coordinator),
        Arc::clone(&reconciler),
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&notifier),
    );
    tokio::spawn(Arc::clone(&health).run(config.health_interval));

    // HTTP read API
    let api_state = ApiState::new(
        Arc::clone(&store),
        Arc::clone(&health),
        Arc::clone(&exchange),
        config.symbols.clone(),
    );
    let limiter = api::create_rate_limiter(100);
    let app = api::router(api_state, limiter);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.api_port));
    info!("Dashboard API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app);

    let shutdown_signal = async {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Helmsman started. Press Ctrl+C to stop.");
    server.with_graceful_shutdown(shutdown_signal).await?;

    info!("Shutting down gracefully...");
    Ok(())
}
