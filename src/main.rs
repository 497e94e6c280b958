/// Main entry point for the zoneflow trading runtime
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use zoneflow::{
    analysis::ZoneAnalyzer,
    broker::{BrokerAdapter, BrokerHandle, BrokerRegistry, HttpBroker, MarketDataFeed, PaperBroker},
    config::{load_config, AdapterKind, Config},
    error::EngineError,
    events::{Event, EventBus, EventPayload, EventType},
    execution::{EntryExecutor, EntryReconciler, ExitDetector, ExitExecutor, ExitQualifier, ExitReconciler},
    hub::{self, BroadcastHub, WsState},
    market::{CandleStore, FeedLiveness, PipelineContext, TickCache, TickPipeline},
    signals::{spawn_analysis_driver, SignalManager, SignalManagerDeps},
    startup::run_startup_gate,
    store::Store,
    time::SessionClock,
    trades::TradeManager,
    validation::ValidationService,
    watchdog::{ReadOnlyGuard, Watchdog},
    Timeframe,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = load_config(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(format!("zoneflow={}", config.engine.log_level))
        .init();

    info!("🚀 Starting zoneflow runtime...");
    run(config).await?;
    info!("👋 Goodbye!");
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let clock = Arc::new(SessionClock::from_config(&config.session)?);
    if let Some(parent) = std::path::Path::new(&config.store.db_path).parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let store = Store::open(&config.store.db_path)?;
    info!("✅ Store ready at {}", config.store.db_path);

    let bus = Arc::new(if config.engine.async_event_writer_enabled {
        EventBus::with_async_writer(store.clone())
    } else {
        EventBus::new(store.clone())
    });

    // Broker endpoints
    let mut handles = Vec::new();
    for ub in &config.user_brokers {
        let adapter: Arc<dyn BrokerAdapter> = match ub.adapter {
            AdapterKind::Paper => Arc::new(PaperBroker::new(true, 5.0)),
            AdapterKind::Http => {
                let base_url = ub.base_url.clone().ok_or_else(|| {
                    EngineError::Config(format!("broker {} missing base_url", ub.user_broker_id))
                })?;
                Arc::new(HttpBroker::new(
                    base_url,
                    ub.credentials_handle.clone(),
                    config.engine.broker_call_timeout_seconds,
                )?)
            }
        };
        handles.push(BrokerHandle {
            record: ub.to_record(),
            adapter,
        });
    }
    let registry = Arc::new(BrokerRegistry::new(handles));

    // Boot refusal before any component accepts work
    run_startup_gate(&config, &store, &registry, bus.async_writer_enabled())?;

    let watchlist = config.shared_watchlist();
    let candle_store = Arc::new(CandleStore::new(store.clone()));
    candle_store.warm_up(&watchlist).await?;

    // Cold-start backfill: pull recent history through the data broker so
    // the analyzer windows are populated before the first live seal
    if let Some(data) = registry.data_broker() {
        let to = Utc::now();
        let from = to - Duration::days(2);
        for symbol in &watchlist {
            for timeframe in Timeframe::ALL {
                match data.adapter.historical_candles(symbol, timeframe, from, to).await {
                    Ok(candles) => {
                        for candle in candles {
                            candle_store.insert(candle).await?;
                        }
                    }
                    Err(e) => warn!("Backfill {} {} failed: {}", symbol, timeframe.as_str(), e),
                }
            }
        }
    }

    let tick_cache = TickCache::new();
    let liveness = FeedLiveness::new();
    let guard = Arc::new(ReadOnlyGuard::new());

    // Client-facing hub
    let broadcast_hub = BroadcastHub::new(&config.hub);
    broadcast_hub.start(&bus);
    {
        let ws_state = WsState {
            hub: Arc::clone(&broadcast_hub),
            bus: Arc::clone(&bus),
            auth_token: config.hub.auth_token.clone(),
        };
        let bind_addr = config.hub.bind_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = hub::serve(ws_state, &bind_addr).await {
                error!("Hub server ended: {}", e);
            }
        });
    }

    // Core services
    let trade_manager = Arc::new(TradeManager::new(store.clone(), Arc::clone(&bus)));
    let validation = Arc::new(ValidationService::new(
        store.clone(),
        Arc::clone(&candle_store),
        config.strategy.clone(),
        config.sizing.clone(),
        Arc::clone(&clock),
    ));
    let analyzer = Arc::new(ZoneAnalyzer::new(
        config.strategy.clone(),
        Arc::clone(&candle_store),
        Arc::clone(&clock),
    ));
    let qualifier = Arc::new(ExitQualifier::new(
        store.clone(),
        Arc::clone(&registry),
        Arc::clone(&clock),
        config.exits.clone(),
    ));

    let (entry_job_tx, entry_job_rx) = mpsc::channel(256);
    let (candle_close_tx, candle_close_rx) = mpsc::channel(1024);
    let (exit_tick_tx, exit_tick_rx) = mpsc::channel(4096);
    let (feed_tick_tx, mut feed_tick_rx) = mpsc::channel(8192);

    // Signal manager and coordinators
    let manager_deps = Arc::new(SignalManagerDeps {
        store: store.clone(),
        bus: Arc::clone(&bus),
        validation,
        registry: Arc::clone(&registry),
        qualifier,
        clock: Arc::clone(&clock),
        tick_cache: tick_cache.clone(),
        entry_job_tx,
        exit_cooldown_seconds: config.exits.exit_cooldown_seconds,
        validation_timeout_seconds: config.engine.validation_timeout_seconds,
    });
    let signal_manager = SignalManager::spawn(Arc::clone(&manager_deps));
    SignalManager::rebuild_on_start(&manager_deps).await?;

    spawn_analysis_driver(analyzer, candle_close_rx, signal_manager.entry_sender());

    // Exit detection
    let detector = Arc::new(ExitDetector::new(
        store.clone(),
        Arc::clone(&trade_manager),
        config.exits.clone(),
        signal_manager.exit_sender(),
    ));
    detector.spawn(exit_tick_rx);

    // Entry execution
    let entry_executor = Arc::new(EntryExecutor::new(
        store.clone(),
        Arc::clone(&trade_manager),
        Arc::clone(&registry),
        Arc::clone(&guard),
        config.engine.order_execution_enabled,
        config.engine.broker_call_timeout_seconds,
    ));
    entry_executor.recover_unplaced().await?;
    Arc::clone(&entry_executor).spawn(entry_job_rx);

    // Exit execution
    Arc::new(ExitExecutor::new(
        store.clone(),
        Arc::clone(&bus),
        Arc::clone(&trade_manager),
        Arc::clone(&registry),
        Arc::clone(&guard),
        config.engine.order_execution_enabled,
        config.exits.exit_poll_seconds,
        config.engine.broker_call_timeout_seconds,
    ))
    .spawn();

    // Reconcilers share one outbound-call semaphore; the offset keeps the
    // entry and exit pulls from colliding
    let broker_semaphore = Arc::new(Semaphore::new(config.engine.broker_call_concurrency));
    Arc::new(EntryReconciler::new(
        store.clone(),
        Arc::clone(&registry),
        Arc::clone(&trade_manager),
        Arc::clone(&broker_semaphore),
        config.engine.reconcile_interval_seconds,
        config.engine.pending_timeout_minutes,
        config.engine.broker_call_timeout_seconds,
    ))
    .spawn(0);
    Arc::new(ExitReconciler::new(
        store.clone(),
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::clone(&trade_manager),
        broker_semaphore,
        config.engine.reconcile_interval_seconds,
        config.engine.broker_call_timeout_seconds,
    ))
    .spawn(config.engine.reconcile_interval_seconds / 2);

    // Watchdog
    Arc::new(Watchdog::new(
        store.clone(),
        Arc::clone(&bus),
        Arc::clone(&candle_store),
        liveness.clone(),
        Arc::clone(&clock),
        Arc::clone(&guard),
        broadcast_hub.depth_gauge(),
        config.hub.queue_capacity,
        config.feed.stale_feed_seconds,
        config.engine.watchdog_interval_seconds,
        watchlist.clone(),
    ))
    .spawn();

    // Tick pipeline: one worker per symbol plus the boundary sweeper
    let pipeline_ctx = Arc::new(PipelineContext {
        clock: Arc::clone(&clock),
        candle_store,
        bus: Arc::clone(&bus),
        tick_cache,
        liveness: liveness.clone(),
        candle_close_tx,
        exit_tick_tx,
        persist_tick_events: config.engine.persist_tick_events,
        dedupe_window_seconds: config.feed.dedupe_window_seconds,
        grace_seconds: config.session.candle_grace_seconds,
    });
    let pipeline = Arc::new(TickPipeline::spawn(&watchlist, pipeline_ctx, 10));
    tokio::spawn(async move {
        while let Some(tick) = feed_tick_rx.recv().await {
            pipeline.dispatch(tick).await;
        }
    });

    // Data-broker tick stream
    Arc::new(MarketDataFeed::new(
        config.feed.clone(),
        watchlist.clone(),
        liveness,
        Arc::clone(&bus),
        feed_tick_tx,
    ))
    .spawn();

    bus.append(Event::global(
        EventType::EngineStarted,
        EventPayload::EngineStarted {
            release: if config.engine.production_mode { "PROD" } else { "BETA" }.to_string(),
            symbols: watchlist.clone(),
        },
    ))?;
    info!("✅ Engine started with {} symbols", watchlist.len());

    tokio::signal::ctrl_c().await?;
    info!("🛑 Ctrl+C received - shutting down");
    bus.append(Event::global(
        EventType::ShutdownInitiated,
        EventPayload::ShutdownInitiated {
            reason: "User requested (Ctrl+C)".to_string(),
        },
    ))?;

    Ok(())
}
