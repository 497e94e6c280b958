/// Per-symbol single-writer tick workers.
/// Each symbol is owned by exactly one task: dedupe membership, the latest
/// tick cell and every partial candle for the symbol are written only there.
/// Brokers are never touched from this path.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventPayload, EventType};
use crate::market::aggregator::TimeframeAggregator;
use crate::market::dedupe::TickDeduper;
use crate::market::partial::PartialCandle;
use crate::market::tick_cache::{FeedLiveness, TickCache};
use crate::market::candle_store::CandleStore;
use crate::events::EventBus;
use crate::time::SessionClock;
use crate::types::{Candle, Tick, Timeframe};

pub enum WorkerMsg {
    Tick(Tick),
    Sweep(DateTime<Utc>),
}

/// Shared dependencies handed to every symbol worker
pub struct PipelineContext {
    pub clock: Arc<SessionClock>,
    pub candle_store: Arc<CandleStore>,
    pub bus: Arc<EventBus>,
    pub tick_cache: TickCache,
    pub liveness: FeedLiveness,
    /// Sealed 1m candles feed the analyzer driver
    pub candle_close_tx: mpsc::Sender<Candle>,
    /// Accepted ticks feed the exit detector
    pub exit_tick_tx: mpsc::Sender<Tick>,
    pub persist_tick_events: bool,
    pub dedupe_window_seconds: i64,
    pub grace_seconds: i64,
}

pub struct TickPipeline {
    routes: HashMap<String, mpsc::Sender<WorkerMsg>>,
}

impl TickPipeline {
    /// Spawn one worker per watchlist symbol plus the boundary sweeper
    pub fn spawn(symbols: &[String], ctx: Arc<PipelineContext>, sweep_interval_seconds: u64) -> Self {
        let mut routes = HashMap::new();
        for symbol in symbols {
            let (tx, rx) = mpsc::channel(2048);
            tokio::spawn(run_symbol_worker(symbol.clone(), rx, Arc::clone(&ctx)));
            routes.insert(symbol.clone(), tx);
        }
        info!("Tick pipeline started for {} symbols", routes.len());

        let sweeper_routes: Vec<mpsc::Sender<WorkerMsg>> = routes.values().cloned().collect();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(sweep_interval_seconds.max(1)));
            loop {
                ticker.tick().await;
                let now = Utc::now();
                for route in &sweeper_routes {
                    let _ = route.send(WorkerMsg::Sweep(now)).await;
                }
            }
        });

        TickPipeline { routes }
    }

    pub async fn dispatch(&self, tick: Tick) {
        match self.routes.get(&tick.symbol) {
            Some(route) => {
                if route.send(WorkerMsg::Tick(tick)).await.is_err() {
                    warn!("Symbol worker channel closed");
                }
            }
            None => debug!("Tick for unsubscribed symbol {} dropped", tick.symbol),
        }
    }
}

async fn run_symbol_worker(symbol: String, mut rx: mpsc::Receiver<WorkerMsg>, ctx: Arc<PipelineContext>) {
    let mut deduper = TickDeduper::new(ctx.dedupe_window_seconds);
    let mut current: Option<PartialCandle> = None;
    let mut aggregator = TimeframeAggregator::new(symbol.clone(), Arc::clone(&ctx.clock));

    while let Some(msg) = rx.recv().await {
        match msg {
            WorkerMsg::Tick(tick) => {
                if !deduper.observe(&tick) {
                    if deduper.dropped().is_power_of_two() {
                        debug!("{}: {} duplicate ticks dropped", symbol, deduper.dropped());
                    }
                    continue;
                }
                handle_tick(&symbol, &tick, &mut current, &mut aggregator, &ctx).await;
            }
            WorkerMsg::Sweep(now) => {
                sweep(&symbol, now, &mut current, &mut aggregator, &ctx).await;
            }
        }
    }
    warn!("Symbol worker for {} ended", symbol);
}

async fn handle_tick(
    symbol: &str,
    tick: &Tick,
    current: &mut Option<PartialCandle>,
    aggregator: &mut TimeframeAggregator,
    ctx: &PipelineContext,
) {
    ctx.liveness.record(symbol, tick.received_at);
    ctx.tick_cache.update(tick);

    if ctx.persist_tick_events {
        let event = Event::global(
            EventType::Tick,
            EventPayload::Tick {
                symbol: symbol.to_string(),
                last_price: tick.last_price,
                last_qty: tick.last_qty,
                exchange_timestamp: tick.exchange_timestamp,
            },
        );
        if let Err(e) = ctx.bus.enqueue(event) {
            error!("Tick event enqueue failed: {}", e);
        }
    }

    let ts = tick.exchange_timestamp.unwrap_or(tick.received_at);
    let boundary = ctx.clock.period_start(Timeframe::M1, ts);

    match current.as_mut() {
        Some(partial) if partial.start_time != boundary => {
            let sealed = partial.seal(symbol, Timeframe::M1);
            *partial = PartialCandle::new(boundary, tick.last_price, tick.last_qty);
            close_m1(sealed, aggregator, ctx).await;
        }
        Some(partial) => partial.update_tick(tick.last_price, tick.last_qty),
        None => {
            *current = Some(PartialCandle::new(boundary, tick.last_price, tick.last_qty));
            debug!("{}: first 1m partial started at {}", symbol, boundary);
        }
    }

    // Exit conditions are evaluated off the hot path
    if ctx.exit_tick_tx.send(tick.clone()).await.is_err() {
        warn!("Exit detector channel closed");
    }
}

/// Store the sealed 1m candle, publish it, fold it into the higher
/// timeframes, and hand it to the analyzer driver. Persist failures stop
/// the emit for that candle; the upsert path heals on the next seal.
async fn close_m1(m1: Candle, aggregator: &mut TimeframeAggregator, ctx: &PipelineContext) {
    let mut derived = aggregator.on_m1_close(&m1);
    publish_candle(&m1, ctx).await;
    for candle in derived.drain(..) {
        publish_candle(&candle, ctx).await;
    }
    if ctx.candle_close_tx.send(m1).await.is_err() {
        warn!("Analyzer channel closed");
    }
}

async fn publish_candle(candle: &Candle, ctx: &PipelineContext) {
    if let Err(e) = ctx.candle_store.insert(candle.clone()).await {
        error!(
            "Candle persist failed for {} {}: {} ({})",
            candle.symbol,
            candle.timeframe.as_str(),
            e,
            e.error_code()
        );
        return;
    }
    let event = Event::global(
        EventType::CandleClosed,
        EventPayload::CandleClosed { candle: candle.clone() },
    );
    if let Err(e) = ctx.bus.append(event) {
        error!("CANDLE_CLOSED emit failed: {}", e);
    }
}

async fn sweep(
    symbol: &str,
    now: DateTime<Utc>,
    current: &mut Option<PartialCandle>,
    aggregator: &mut TimeframeAggregator,
    ctx: &PipelineContext,
) {
    let grace = Duration::seconds(ctx.grace_seconds);
    if let Some(partial) = current.as_ref() {
        let period_end = ctx.clock.period_end(Timeframe::M1, partial.start_time);
        if now > period_end + grace {
            let sealed = partial.seal(symbol, Timeframe::M1);
            *current = None;
            debug!("{}: swept stale 1m partial at {}", symbol, sealed.start_time);
            close_m1(sealed, aggregator, ctx).await;
        }
    }
    for candle in aggregator.sweep(now, ctx.grace_seconds) {
        publish_candle(&candle, ctx).await;
    }
}
