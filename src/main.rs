//! Bootstrap (C15): builds every component, wires the controller and the
//! position monitor as concurrent background tasks, and shuts down cleanly
//! on Ctrl-C.
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::{error, info, warn};

use volguard::api::AppContext;
use volguard::broker::{BrokerGateway, InstrumentCache, LiveBrokerGateway, PaperBrokerGateway, TokenManager};
use volguard::cache::MarketDataCache;
use volguard::calendar::{analyze_veto_risk, CalendarClient, VetoRisk};
use volguard::circuit_breaker::CircuitBreaker;
use volguard::config::loader::load_config;
use volguard::controller::TradingController;
use volguard::events::event_bus::EventBus;
use volguard::events::types::{Event, EventPayload, EventType};
use volguard::monitor::PositionMonitor;
use volguard::notify::NotificationSink;
use volguard::orchestrator::OrderOrchestrator;
use volguard::participant::ParticipantDataClient;
use volguard::persistence::SqliteStore;
use volguard::risk::RiskManager;
use volguard::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "volguard=info".into()))
        .init();

    info!("starting volguard trading control plane");

    let config = match load_config() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "configuration failed to load or validate");
            std::process::exit(1);
        }
    };

    if let Some(dir) = std::path::Path::new(&config.event_log_path).parent() {
        tokio::fs::create_dir_all(dir).await.ok();
    }
    if let Some(dir) = std::path::Path::new(&config.db_path).parent() {
        tokio::fs::create_dir_all(dir).await.ok();
    }

    let event_bus = Arc::new(EventBus::new(config.event_log_path.clone()));
    event_bus.start_processing().await;
    event_bus
        .publish(Event::new(EventType::LogInitialized, EventPayload::LogInitialized { log_level: config.log_level.clone() }))
        .await?;

    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    event_bus
        .publish(Event::new(
            EventType::StorageReady,
            EventPayload::StorageReady { data_root: config.db_path.clone() },
        ))
        .await?;

    let instrument_cache = Arc::new(InstrumentCache::new(config.broker_instrument_master_url.clone()));
    if let Err(e) = instrument_cache.refresh().await {
        warn!(error = %e, "initial instrument master refresh failed, will retry lazily");
    }

    let broker: Arc<dyn BrokerGateway> = if config.dry_run {
        info!("dry-run mode: using paper broker gateway");
        Arc::new(PaperBrokerGateway::new(Arc::clone(&config)))
    } else {
        let token_manager = Arc::new(TokenManager::new(config.token_file_path.clone()));
        token_manager.load_from_file().await.ok();
        let live = Arc::new(LiveBrokerGateway::new(Arc::clone(&token_manager), Arc::clone(&instrument_cache), Arc::clone(&config)));
        match live.login().await {
            Ok(_) => event_bus
                .publish(Event::new(EventType::BrokerSessionReady, EventPayload::BrokerSessionReady { session_id: "live".to_string() }))
                .await?,
            Err(e) => {
                error!(error = %e, "broker login failed at startup");
                std::process::exit(1);
            }
        }
        live
    };

    let market_data = Arc::new(MarketDataCache::new(Arc::clone(&config)));
    let calendar = Arc::new(CalendarClient::new(config.calendar_feed_url.clone()));
    let participant = Arc::new(ParticipantDataClient::new());
    let risk_manager = Arc::new(RiskManager::new(Arc::clone(&config)));
    let circuit_breaker = Arc::new(CircuitBreaker::load(Arc::clone(&config), Arc::clone(&store) as _).await?);
    let orchestrator = Arc::new(OrderOrchestrator::new(
        Arc::clone(&broker),
        Arc::clone(&circuit_breaker),
        Arc::clone(&event_bus),
        Arc::clone(&config),
        Arc::clone(&store) as _,
    ));

    let notify = Arc::new(NotificationSink::new(&config));
    if notify.is_configured() {
        Arc::clone(&notify).attach(&event_bus).await;
    } else {
        info!("notification sink not configured, alerts will be logged only");
    }

    let controller = Arc::new(TradingController::new(
        Arc::clone(&config),
        Arc::clone(&event_bus),
        Arc::clone(&broker),
        Arc::clone(&instrument_cache),
        Arc::clone(&market_data),
        Arc::clone(&calendar),
        Arc::clone(&participant),
        Arc::clone(&risk_manager),
        Arc::clone(&circuit_breaker),
        Arc::clone(&orchestrator),
        Arc::clone(&store) as _,
    ));

    let monitor = Arc::new(PositionMonitor::new(
        Arc::clone(&market_data),
        Arc::clone(&store) as _,
        Arc::clone(&orchestrator),
        Arc::clone(&config),
    ));

    // The monitor's exit-eval loop needs a synchronous veto-risk reader; a
    // small background task keeps this cache current independently of the
    // controller's own per-cycle calendar fetch.
    let veto_cache = Arc::new(std::sync::RwLock::new(no_veto()));
    {
        let veto_cache = Arc::clone(&veto_cache);
        let calendar = Arc::clone(&calendar);
        tokio::spawn(async move {
            loop {
                let events = calendar.fetch_events(7).await;
                let veto = analyze_veto_risk(&events, chrono::Utc::now());
                if let Ok(mut guard) = veto_cache.write() {
                    *guard = veto;
                }
                tokio::time::sleep(StdDuration::from_secs(300)).await;
            }
        });
    }

    let app_ctx = AppContext {
        config: Arc::clone(&config),
        broker: Arc::clone(&broker),
        market_data: Arc::clone(&market_data),
        calendar: Arc::clone(&calendar),
        risk_manager: Arc::clone(&risk_manager),
        circuit_breaker: Arc::clone(&circuit_breaker),
        orchestrator: Arc::clone(&orchestrator),
        controller: Arc::clone(&controller),
        store: Arc::clone(&store),
    };
    // `app_ctx` is ready for a future HTTP binary to wire into its router;
    // this process itself only runs the background control loops.
    let _ = app_ctx;

    let controller_task = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run().await })
    };
    let monitor_task = {
        let monitor = Arc::clone(&monitor);
        let veto_cache = Arc::clone(&veto_cache);
        tokio::spawn(async move {
            monitor
                .run(move || veto_cache.read().map(|g| g.clone()).unwrap_or_else(|_| no_veto()))
                .await
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        res = controller_task => {
            if let Err(e) = res {
                error!(error = %e, "controller task panicked");
            }
        }
        res = monitor_task => {
            if let Err(e) = res {
                error!(error = %e, "monitor task panicked");
            }
        }
    }

    event_bus
        .publish(Event::new(
            EventType::GracefulShutdownInitiated,
            EventPayload::GracefulShutdownInitiated { reason: "ctrl-c or task exit".to_string() },
        ))
        .await
        .ok();
    controller.request_shutdown().await;

    info!("volguard shut down cleanly");
    Ok(())
}

fn no_veto() -> VetoRisk {
    VetoRisk { has_veto: false, event_title: None, event_time: None, square_off_needed: false, hours_until: None, suggested_square_off_time: None }
}
