use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use market_mover_watch::api;
use market_mover_watch::config::Config;
use market_mover_watch::db::Database;
use market_mover_watch::notify::{AlertSink, ChatDispatcher};
use market_mover_watch::pipeline::{spawn_scheduler, AlertParams, Pipeline};
use market_mover_watch::profiler::model::spawn_reloader;
use market_mover_watch::profiler::ModelHandle;
use market_mover_watch::providers::{
    KalshiProvider, MarketProvider, OpinionProvider, PolymarketProvider,
};
use market_mover_watch::signals::SpotSignals;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Open database and apply migrations; a failure here is fatal.
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    // Provider adapters. Disabled ones stay in the list and report
    // enabled() == false.
    let providers: Vec<Arc<dyn MarketProvider>> = vec![
        Arc::new(PolymarketProvider::new(
            &config.polymarket_gamma_url,
            &config.polymarket_clob_url,
        )?),
        Arc::new(KalshiProvider::new(
            &config.kalshi_api_url,
            config.enable_kalshi,
        )?),
        Arc::new(OpinionProvider::new(
            &config.opinion_api_url,
            config.opinion_api_key.clone(),
            config.enable_opinion,
        )?),
    ];
    let enabled_providers: Vec<String> = providers
        .iter()
        .filter(|p| p.enabled())
        .map(|p| p.name().to_string())
        .collect();
    info!("Enabled providers: {:?}", enabled_providers);

    // Anchor model: best-effort initial load, then periodic reloads.
    let model = ModelHandle::new(&config.anchor_model_path);
    if let Err(e) = model.reload().await {
        warn!("initial anchor model load failed, starting rules-only: {:#}", e);
    }
    let _model_reloader = spawn_reloader(model.clone(), Duration::from_secs(config.model_reload_secs));

    let spot_signals = SpotSignals::new(&config.spot_api_url)?;
    let sink: Arc<ChatDispatcher> = Arc::new(ChatDispatcher::from_settings(&config.chat_settings())?);
    if sink.enabled() {
        if let Err(e) = sink.send("📡 market-mover-watch started").await {
            warn!("startup notification failed: {:#}", e);
        }
    }

    let pipeline = Arc::new(Pipeline::new(
        db.clone(),
        providers,
        model,
        spot_signals,
        sink,
        AlertParams {
            min_liquidity_usd: config.alert_min_liquidity,
            max_spread_pp: config.alert_max_spread_pp,
            cooldown_minutes: config.alert_cooldown_minutes,
        },
        config.profile_batch_size,
        config.retention_hours,
    ));

    // Scheduler: immediate first cycle, then a fixed tick. The flag doubles
    // as the shutdown drain signal.
    let cycle_active = Arc::new(AtomicBool::new(false));
    let scheduler = spawn_scheduler(
        Arc::clone(&pipeline),
        Duration::from_millis(config.worker_interval_ms),
        Arc::clone(&cycle_active),
    );

    // Read API.
    let app = api::router(api::AppState {
        db: db.clone(),
        enabled_providers,
    });
    let addr: SocketAddr = config.api_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Read API listening on http://{}", addr);
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    shutdown_signal().await;
    info!("Shutdown signal received, draining in-flight cycle");
    scheduler.abort();
    server.abort();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while cycle_active.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    info!("Clean shutdown");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(t) => t,
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
