/// Signal manager: dedupe, persistence and delivery fan-out for entry
/// signals; episode-gated exit signal creation; minute-tick expiry.
///
/// Entry processing is serialized through the entry coordinator task and
/// exit processing through the exit coordinator task; deliveries of one
/// signal are validated in parallel across user-brokers.
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::analysis::ZoneAnalyzer;
use crate::broker::BrokerRegistry;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventPayload, EventType};
use crate::execution::exit_executor::ExitQualifier;
use crate::execution::entry_executor::EntryJob;
use crate::market::TickCache;
use crate::store::signals::SignalUpsert;
use crate::store::Store;
use crate::time::SessionClock;
use crate::types::{
    Candle, DeliveryStatus, ExitCandidate, ExitIntent, ExitIntentStatus, ExitReason, OrderType,
    Signal, SignalCandidate, SignalDelivery, SignalStatus, UserBroker,
};
use crate::utils::generate_idempotency_key;
use crate::validation::ValidationService;

pub struct SignalManagerDeps {
    pub store: Store,
    pub bus: Arc<EventBus>,
    pub validation: Arc<ValidationService>,
    pub registry: Arc<BrokerRegistry>,
    pub qualifier: Arc<ExitQualifier>,
    pub clock: Arc<SessionClock>,
    pub tick_cache: TickCache,
    pub entry_job_tx: mpsc::Sender<EntryJob>,
    pub exit_cooldown_seconds: i64,
    pub validation_timeout_seconds: u64,
}

pub struct SignalManager {
    entry_tx: mpsc::Sender<SignalCandidate>,
    exit_tx: mpsc::Sender<ExitCandidate>,
}

impl SignalManager {
    /// Spawn the entry coordinator, exit coordinator and expiry scheduler
    pub fn spawn(deps: Arc<SignalManagerDeps>) -> Self {
        let (entry_tx, mut entry_rx) = mpsc::channel::<SignalCandidate>(512);
        let (exit_tx, mut exit_rx) = mpsc::channel::<ExitCandidate>(512);

        let entry_deps = Arc::clone(&deps);
        tokio::spawn(async move {
            while let Some(candidate) = entry_rx.recv().await {
                if let Err(e) = process_candidate(&entry_deps, candidate).await {
                    error!("Entry coordinator error: {} ({})", e, e.error_code());
                }
            }
            warn!("Entry coordinator ended");
        });

        let exit_deps = Arc::clone(&deps);
        tokio::spawn(async move {
            while let Some(candidate) = exit_rx.recv().await {
                match process_exit_candidate(&exit_deps, candidate).await {
                    Ok(()) => {}
                    Err(e) if e.is_benign() => debug!("Exit candidate swallowed: {}", e),
                    Err(e) => error!("Exit coordinator error: {} ({})", e, e.error_code()),
                }
            }
            warn!("Exit coordinator ended");
        });

        let expiry_deps = Arc::clone(&deps);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(e) = expire_signals(&expiry_deps).await {
                    error!("Signal expiry pass failed: {}", e);
                }
            }
        });

        SignalManager { entry_tx, exit_tx }
    }

    pub fn entry_sender(&self) -> mpsc::Sender<SignalCandidate> {
        self.entry_tx.clone()
    }

    pub fn exit_sender(&self) -> mpsc::Sender<ExitCandidate> {
        self.exit_tx.clone()
    }

    /// Repopulate pending work after a restart: PENDING deliveries are
    /// re-qualified (idempotently) and re-dispatched.
    pub async fn rebuild_on_start(deps: &SignalManagerDeps) -> Result<()> {
        let pending = deps.store.pending_deliveries()?;
        if pending.is_empty() {
            return Ok(());
        }
        info!("Rebuilding {} pending deliveries", pending.len());
        for delivery in pending {
            let signal = match deps.store.get_signal(&delivery.signal_id)? {
                Some(s) if s.status == SignalStatus::Published => s,
                _ => {
                    deps.store
                        .set_delivery_status(&delivery.delivery_id, DeliveryStatus::Rejected)?;
                    continue;
                }
            };
            let user_broker = match deps.registry.get(&delivery.user_broker_id) {
                Ok(handle) => handle.record.clone(),
                Err(_) => {
                    deps.store
                        .set_delivery_status(&delivery.delivery_id, DeliveryStatus::Rejected)?;
                    continue;
                }
            };
            validate_delivery(deps, &signal, &delivery, &user_broker).await;
        }
        Ok(())
    }
}

/// Analysis driver: turns sealed 1m candles into candidates for the entry
/// coordinator. Runs downstream of the per-symbol workers, so candidates
/// for one symbol arrive in candle order.
pub fn spawn_analysis_driver(
    analyzer: Arc<ZoneAnalyzer>,
    mut candle_rx: mpsc::Receiver<Candle>,
    entry_tx: mpsc::Sender<SignalCandidate>,
) {
    tokio::spawn(async move {
        while let Some(candle) = candle_rx.recv().await {
            match analyzer.evaluate(&candle.symbol, candle.close, Utc::now()).await {
                Ok(Some(candidate)) => {
                    if entry_tx.send(candidate).await.is_err() {
                        warn!("Entry coordinator channel closed");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => error!("Analyzer error for {}: {}", candle.symbol, e),
            }
        }
        warn!("Analysis driver ended");
    });
}

async fn process_candidate(deps: &SignalManagerDeps, candidate: SignalCandidate) -> Result<()> {
    let now = candidate.generated_at;
    let signal = Signal {
        signal_id: uuid::Uuid::new_v4().to_string(),
        symbol: candidate.symbol.clone(),
        direction: candidate.direction,
        confluence: candidate.confluence,
        score: candidate.score,
        strength: candidate.strength,
        htf_low: candidate.htf.floor,
        htf_high: candidate.htf.ceiling,
        itf_low: candidate.itf.floor,
        itf_high: candidate.itf.ceiling,
        ltf_low: candidate.ltf.floor,
        ltf_high: candidate.ltf.ceiling,
        effective_floor: candidate.effective_floor,
        effective_ceiling: candidate.effective_ceiling,
        ref_price: candidate.ref_price,
        p_win: candidate.p_win,
        kelly: candidate.kelly,
        generated_at: now,
        expires_at: candidate.expires_at,
        last_seen_at: now,
        status: SignalStatus::Published,
        signal_day: deps.clock.local_date(now),
    };

    let signal = match deps.store.publish_or_touch_signal(&signal)? {
        SignalUpsert::Touched(existing) => {
            debug!(
                "Signal identity already active for {} ({}), last_seen advanced",
                existing.symbol, existing.signal_id
            );
            return Ok(());
        }
        SignalUpsert::Inserted(signal) => signal,
    };

    deps.bus.append(
        Event::global(
            EventType::SignalPublished,
            EventPayload::SignalPublished {
                symbol: signal.symbol.clone(),
                direction: signal.direction,
                confluence: signal.confluence,
                strength: signal.strength,
                effective_floor: signal.effective_floor,
                effective_ceiling: signal.effective_ceiling,
                ref_price: signal.ref_price,
                p_win: signal.p_win,
                kelly: signal.kelly,
                expires_at: signal.expires_at,
            },
        )
        .with_signal(&signal.signal_id),
    )?;
    info!(
        "Signal published: {} {} {} zone [{:.2}, {:.2}]",
        signal.symbol,
        signal.confluence.as_str(),
        signal.strength.as_str(),
        signal.effective_floor,
        signal.effective_ceiling
    );

    fan_out(deps, &signal).await
}

/// One delivery row per enabled EXEC user-broker whitelisted for the
/// symbol; validations then run in parallel under the per-validation
/// timeout.
async fn fan_out(deps: &SignalManagerDeps, signal: &Signal) -> Result<()> {
    let mut targets: Vec<(SignalDelivery, UserBroker)> = Vec::new();
    for handle in deps.registry.exec_brokers() {
        if !handle.record.watchlist.iter().any(|s| s == &signal.symbol) {
            continue;
        }
        let delivery = SignalDelivery {
            delivery_id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal.signal_id.clone(),
            user_broker_id: handle.record.user_broker_id.clone(),
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
        };
        if !deps.store.insert_delivery(&delivery)? {
            debug!(
                "Delivery for ({}, {}) already exists",
                signal.signal_id, handle.record.user_broker_id
            );
            continue;
        }
        deps.bus.append(
            Event::for_user_broker(
                EventType::SignalDeliveryCreated,
                &handle.record.user_id,
                &handle.record.user_broker_id,
                EventPayload::SignalDeliveryCreated {
                    delivery_id: delivery.delivery_id.clone(),
                    symbol: signal.symbol.clone(),
                },
            )
            .with_signal(&signal.signal_id),
        )?;
        targets.push((delivery, handle.record.clone()));
    }

    join_all(
        targets
            .iter()
            .map(|(delivery, user_broker)| validate_delivery(deps, signal, delivery, user_broker)),
    )
    .await;
    Ok(())
}

async fn validate_delivery(
    deps: &SignalManagerDeps,
    signal: &Signal,
    delivery: &SignalDelivery,
    user_broker: &UserBroker,
) {
    let timeout = std::time::Duration::from_secs(deps.validation_timeout_seconds);
    let state = match deps.registry.state(&user_broker.user_broker_id).await {
        Ok(state) => state,
        Err(e) => {
            error!("Broker state lookup failed for {}: {}", user_broker.user_broker_id, e);
            return;
        }
    };

    let intent = match tokio::time::timeout(timeout, deps.validation.qualify(signal, user_broker, state)).await
    {
        Ok(Ok(intent)) => intent,
        Ok(Err(e)) => {
            error!("Validation failed for {}: {}", user_broker.user_broker_id, e);
            return;
        }
        Err(_) => {
            warn!(
                "Validation timed out for ({}, {})",
                signal.signal_id, user_broker.user_broker_id
            );
            match deps
                .validation
                .reject_with_code(signal, &user_broker.user_broker_id, "TIMEOUT")
            {
                Ok(intent) => intent,
                Err(e) => {
                    error!("Timeout rejection persist failed: {}", e);
                    return;
                }
            }
        }
    };

    let outcome = if intent.validation_passed {
        DeliveryStatus::Processed
    } else {
        DeliveryStatus::Rejected
    };
    if let Err(e) = deps.store.set_delivery_status(&delivery.delivery_id, outcome) {
        error!("Delivery status update failed: {}", e);
    }

    let event = if intent.validation_passed {
        Event::for_user_broker(
            EventType::IntentApproved,
            &user_broker.user_id,
            &user_broker.user_broker_id,
            EventPayload::IntentApproved {
                symbol: signal.symbol.clone(),
                qty: intent.approved_qty,
                order_type: intent.order_type,
                limit_price: intent.limit_price,
            },
        )
    } else {
        Event::for_user_broker(
            EventType::IntentRejected,
            &user_broker.user_id,
            &user_broker.user_broker_id,
            EventPayload::IntentRejected {
                symbol: signal.symbol.clone(),
                reasons: intent.rejection_reasons.clone(),
            },
        )
    };
    if let Err(e) = deps
        .bus
        .append(event.with_signal(&signal.signal_id).with_intent(&intent.intent_id))
    {
        error!("Intent event emit failed: {}", e);
        return;
    }

    if intent.validation_passed {
        let job = EntryJob {
            intent,
            signal: signal.clone(),
            user_broker: user_broker.clone(),
        };
        if deps.entry_job_tx.send(job).await.is_err() {
            error!("Entry executor channel closed");
        }
    }
}

/// Exit path: episode allocation is delegated to the store; a cooldown
/// rejection means "not eligible now" and nothing is emitted.
async fn process_exit_candidate(deps: &SignalManagerDeps, candidate: ExitCandidate) -> Result<()> {
    let trade = deps
        .store
        .get_trade(&candidate.trade_id)?
        .ok_or_else(|| EngineError::NotFound(format!("trade {}", candidate.trade_id)))?;
    if trade.status != crate::types::TradeStatus::Open {
        debug!(
            "Exit candidate for trade {} ignored (status {})",
            trade.trade_id,
            trade.status.as_str()
        );
        return Ok(());
    }

    let exit_signal = deps.store.allocate_exit_episode(
        &candidate.trade_id,
        candidate.reason,
        candidate.price,
        candidate.detected_at,
        deps.exit_cooldown_seconds,
    )?;

    deps.bus.append(
        Event::for_user_broker(
            EventType::ExitSignalPublished,
            &trade.user_id,
            &trade.user_broker_id,
            EventPayload::ExitSignalPublished {
                reason: exit_signal.reason,
                episode_id: exit_signal.episode_id,
                price: exit_signal.price,
            },
        )
        .with_trade(&trade.trade_id),
    )?;
    info!(
        "Exit signal: trade {} {} episode {} @ {:.2}",
        trade.trade_id,
        exit_signal.reason.as_str(),
        exit_signal.episode_id,
        exit_signal.price
    );

    let exit_intent_id = uuid::Uuid::new_v4().to_string();
    let intent = ExitIntent {
        exit_intent_id: exit_intent_id.clone(),
        exit_signal_id: exit_signal.exit_signal_id.clone(),
        trade_id: trade.trade_id.clone(),
        user_broker_id: trade.user_broker_id.clone(),
        reason: exit_signal.reason,
        episode_id: exit_signal.episode_id,
        status: ExitIntentStatus::Pending,
        order_type: default_order_type(exit_signal.reason),
        limit_price: matches!(exit_signal.reason, ExitReason::TargetHit | ExitReason::Manual)
            .then_some(candidate.price),
        client_order_id: generate_idempotency_key(&["exit", &exit_intent_id]),
        broker_order_id: None,
        rejection_reasons: vec![],
        placed_at: None,
        filled_at: None,
        created_at: Utc::now(),
    };
    if !deps.store.insert_exit_intent(&intent)? {
        // Identity (trade, broker, reason, episode) already covered
        return Ok(());
    }

    let verdict = deps.qualifier.qualify(&intent, &trade).await?;
    deps.store.qualify_exit_intent(
        &intent.exit_intent_id,
        verdict.status,
        verdict.order_type,
        verdict.limit_price,
        &verdict.codes,
    )?;

    let event = match verdict.status {
        ExitIntentStatus::Approved => Event::for_user_broker(
            EventType::ExitIntentApproved,
            &trade.user_id,
            &trade.user_broker_id,
            EventPayload::ExitIntentApproved {
                reason: intent.reason,
                order_type: verdict.order_type,
                limit_price: verdict.limit_price,
            },
        ),
        _ => Event::for_user_broker(
            EventType::ExitIntentRejected,
            &trade.user_id,
            &trade.user_broker_id,
            EventPayload::ExitIntentRejected {
                reason: intent.reason,
                codes: verdict.codes.clone(),
            },
        ),
    };
    deps.bus.append(event.with_trade(&trade.trade_id))?;
    Ok(())
}

fn default_order_type(reason: ExitReason) -> OrderType {
    match reason {
        ExitReason::TargetHit | ExitReason::Manual => OrderType::Limit,
        ExitReason::StopLoss | ExitReason::TimeBased | ExitReason::TrailingStop => OrderType::Market,
    }
}

/// Once-per-minute sweep: TTL expiry and zone invalidation by current price
pub(crate) async fn expire_signals(deps: &SignalManagerDeps) -> Result<()> {
    let now = Utc::now();
    for signal in deps.store.active_signals()? {
        let (retire_as, reason) = if signal.expires_at < now {
            (SignalStatus::Expired, "TTL_ELAPSED")
        } else if deps
            .tick_cache
            .last_price(&signal.symbol)
            .map(|price| price < signal.effective_floor)
            .unwrap_or(false)
        {
            (SignalStatus::Invalidated, "ZONE_INVALIDATED")
        } else {
            continue;
        };

        if deps.store.retire_signal(&signal.signal_id, retire_as)? {
            deps.bus.append(
                Event::global(
                    EventType::SignalExpired,
                    EventPayload::SignalExpired {
                        symbol: signal.symbol.clone(),
                        reason: reason.to_string(),
                    },
                )
                .with_signal(&signal.signal_id),
            )?;
            info!("Signal {} retired: {}", signal.signal_id, reason);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerHandle, PaperBroker};
    use crate::config::{
        SessionConfig, SizingConfig, StrategyConfig, StrengthMultipliers, StrengthThresholds,
        VelocityStep,
    };
    use crate::execution::{EntryExecutor, EntryReconciler, ExitExecutor, ExitReconciler};
    use crate::market::CandleStore;
    use crate::trades::TradeManager;
    use crate::types::{BrokerRole, ConfluenceType, Direction, StrengthBucket, TradeStatus, Zone};
    use crate::watchdog::ReadOnlyGuard;
    use chrono::Duration;
    use tokio::sync::Semaphore;

    fn strategy_cfg() -> StrategyConfig {
        StrategyConfig {
            min_confluence_type: ConfluenceType::Triple,
            min_win_prob: 0.5,
            min_kelly: 0.01,
            htf_window: 2,
            itf_window: 2,
            ltf_window: 3,
            advantage_ratio: 3.0,
            utility_alpha: 0.6,
            utility_beta: 1.4,
            strength_thresholds: StrengthThresholds { moderate: 0.4, strong: 0.6, very_strong: 0.8 },
            signal_ttl_minutes: 60,
        }
    }

    fn sizing_cfg() -> SizingConfig {
        SizingConfig {
            kelly_fraction: 1.0,
            kelly_cap: 5.0,
            strength_multipliers: StrengthMultipliers { weak: 0.5, moderate: 0.75, strong: 1.0, very_strong: 1.2 },
            portfolio_budget: 0.0866,
            symbol_budget: 0.10,
            position_budget: 0.05,
            velocity_gamma: 2.0,
            velocity_min: 0.10,
            velocity_table: vec![VelocityStep { ratio_ceiling: f64::MAX, multiplier: 1.0 }],
            reentry_spacing_atr: 2.0,
            atr_period: 14,
        }
    }

    /// Session that is always open keeps the tests independent of wall time
    fn always_open_clock() -> Arc<SessionClock> {
        Arc::new(
            SessionClock::from_config(&SessionConfig {
                timezone: "UTC".to_string(),
                open_time: "00:00".to_string(),
                close_time: "23:59".to_string(),
                holidays: vec![],
                candle_grace_seconds: 15,
                weekend_trading: true,
            })
            .unwrap(),
        )
    }

    fn user_broker(id: &str, role: BrokerRole) -> crate::types::UserBroker {
        crate::types::UserBroker {
            user_broker_id: id.to_string(),
            user_id: "u1".to_string(),
            name: id.to_string(),
            role,
            enabled: true,
            credentials_handle: String::new(),
            capital: 100_000.0,
            max_exposure: 60_000.0,
            max_per_trade: 25_000.0,
            min_trade_value: 0.0,
            max_open_trades: 5,
            max_daily_loss: 5_000.0,
            max_weekly_loss: 15_000.0,
            cooldown_minutes: 0,
            watchlist: vec!["NSE:X".to_string()],
        }
    }

    struct Harness {
        deps: Arc<SignalManagerDeps>,
        store: Store,
        broker: Arc<PaperBroker>,
        entry_job_rx: mpsc::Receiver<EntryJob>,
        trade_manager: Arc<TradeManager>,
    }

    fn harness(auto_fill: bool) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::new(store.clone()));
        let broker = Arc::new(PaperBroker::new(auto_fill, 0.0));
        let registry = Arc::new(BrokerRegistry::new(vec![
            BrokerHandle {
                record: user_broker("data1", BrokerRole::Data),
                adapter: Arc::new(PaperBroker::new(true, 0.0)),
            },
            BrokerHandle {
                record: user_broker("ub1", BrokerRole::Exec),
                adapter: Arc::clone(&broker) as Arc<dyn crate::broker::BrokerAdapter>,
            },
        ]));
        let candle_store = Arc::new(CandleStore::new(store.clone()));
        let clock = always_open_clock();
        let validation = Arc::new(ValidationService::new(
            store.clone(),
            Arc::clone(&candle_store),
            strategy_cfg(),
            sizing_cfg(),
            Arc::clone(&clock),
        ));
        let qualifier = Arc::new(ExitQualifier::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&clock),
            crate::config::ExitConfig {
                exit_cooldown_seconds: 30,
                max_hold_days: 5,
                exit_cutoff_minutes: 0,
                brick_min_abs: 0.05,
                brick_min_pct: 0.0,
                trailing_enabled: false,
                trailing_activation_pct: 0.02,
                trailing_distance_pct: 0.01,
                exit_poll_seconds: 5,
            },
        ));
        let (entry_job_tx, entry_job_rx) = mpsc::channel(64);
        let trade_manager = Arc::new(TradeManager::new(store.clone(), Arc::clone(&bus)));
        let deps = Arc::new(SignalManagerDeps {
            store: store.clone(),
            bus,
            validation,
            registry,
            qualifier,
            clock,
            tick_cache: TickCache::new(),
            entry_job_tx,
            exit_cooldown_seconds: 30,
            validation_timeout_seconds: 5,
        });
        Harness { deps, store, broker, entry_job_rx, trade_manager }
    }

    fn candidate() -> SignalCandidate {
        SignalCandidate {
            symbol: "NSE:X".to_string(),
            direction: Direction::Buy,
            confluence: ConfluenceType::Triple,
            score: 0.8,
            strength: StrengthBucket::Strong,
            htf: Zone { floor: 2380.0, ceiling: 2520.0 },
            itf: Zone { floor: 2390.0, ceiling: 2510.0 },
            ltf: Zone { floor: 2400.0, ceiling: 2500.0 },
            effective_floor: 2400.0,
            effective_ceiling: 2500.0,
            ref_price: 2450.0,
            p_win: 0.6,
            kelly: 0.05,
            generated_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(60),
        }
    }

    fn entry_executor(h: &Harness) -> Arc<EntryExecutor> {
        Arc::new(EntryExecutor::new(
            h.store.clone(),
            Arc::clone(&h.trade_manager),
            Arc::clone(&h.deps.registry),
            Arc::new(ReadOnlyGuard::new()),
            true,
            10,
        ))
    }

    #[tokio::test]
    async fn test_entry_happy_path_event_order() {
        let mut h = harness(false);
        process_candidate(&h.deps, candidate()).await.unwrap();

        // Fan-out approved the single EXEC broker with qty 4
        let job = h.entry_job_rx.recv().await.unwrap();
        assert_eq!(job.intent.approved_qty, 4);

        // Executor places; paper broker stays silent until the late fill
        let executor = entry_executor(&h);
        let (tx, rx) = mpsc::channel(4);
        tx.send(job).await.unwrap();
        drop(tx);
        executor.spawn(rx);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let trade = h.store.get_trade_by_intent(
            &ValidationService::intent_id_for(
                &h.store.active_signals().unwrap()[0].signal_id,
                "ub1",
            ),
        );
        let trade = trade.unwrap().expect("trade row created");
        assert_eq!(trade.status, TradeStatus::Pending);

        // Broker reports the fill; the entry reconciler heals to OPEN
        h.broker.fill(&trade.client_order_id, 2450.0).await;
        EntryReconciler::new(
            h.store.clone(),
            Arc::clone(&h.deps.registry),
            Arc::clone(&h.trade_manager),
            Arc::new(Semaphore::new(5)),
            0,
            10,
            10,
        )
        .pass()
        .await
        .unwrap();

        let opened = h.store.get_trade(&trade.trade_id).unwrap().unwrap();
        assert_eq!(opened.status, TradeStatus::Open);
        assert_eq!(opened.entry_price, Some(2450.0));

        let events = h.store.events_after(0, 100).unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::SignalPublished,
                EventType::SignalDeliveryCreated,
                EventType::IntentApproved,
                EventType::TradeCreated,
                EventType::OrderPlaced,
                EventType::OrderFilled,
                EventType::TradeUpdated,
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_candidate_touches_signal_only() {
        let mut h = harness(true);
        process_candidate(&h.deps, candidate()).await.unwrap();
        let _ = h.entry_job_rx.recv().await.unwrap();
        let first_seen = h.store.active_signals().unwrap()[0].last_seen_at;

        let mut again = candidate();
        again.generated_at = first_seen + Duration::seconds(30);
        process_candidate(&h.deps, again).await.unwrap();

        let signals = h.store.active_signals().unwrap();
        assert_eq!(signals.len(), 1);
        assert!(signals[0].last_seen_at > first_seen);

        // No second published event, delivery or intent
        let events = h.store.events_after(0, 100).unwrap();
        let published = events
            .iter()
            .filter(|e| e.event_type == EventType::SignalPublished)
            .count();
        assert_eq!(published, 1);
        assert!(h.entry_job_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_target_exit_cooldown_end_to_end() {
        let h = harness(false);

        // An OPEN trade as left by the entry path
        let signal_row = {
            process_candidate(&h.deps, candidate()).await.unwrap();
            h.store.active_signals().unwrap()[0].clone()
        };
        let intent_id = ValidationService::intent_id_for(&signal_row.signal_id, "ub1");
        let intent = h.store.get_intent(&intent_id).unwrap().unwrap();
        let trade = h
            .trade_manager
            .create_for_intent(&intent, &signal_row, &user_broker("ub1", BrokerRole::Exec))
            .unwrap();
        h.trade_manager.mark_pending(&trade.trade_id, "B1").unwrap();
        h.trade_manager.mark_open(&trade.trade_id, 2450.0, 4, Utc::now()).unwrap();

        // First detection claims episode 1 and gets APPROVED
        let t0 = Utc::now();
        process_exit_candidate(
            &h.deps,
            ExitCandidate {
                trade_id: trade.trade_id.clone(),
                reason: ExitReason::TargetHit,
                price: 2500.05,
                detected_at: t0,
            },
        )
        .await
        .unwrap();

        // Re-detection inside the 30s cooldown is swallowed
        let within = process_exit_candidate(
            &h.deps,
            ExitCandidate {
                trade_id: trade.trade_id.clone(),
                reason: ExitReason::TargetHit,
                price: 2500.10,
                detected_at: t0 + Duration::seconds(10),
            },
        )
        .await;
        assert!(matches!(within, Err(EngineError::ExitCooldownActive { .. })));
        assert_eq!(h.store.exit_signals_for_trade(&trade.trade_id).unwrap().len(), 1);

        // Place, fill at the broker, reconcile to CLOSED
        let exit_exec = ExitExecutor::new(
            h.store.clone(),
            Arc::clone(&h.deps.bus),
            Arc::clone(&h.trade_manager),
            Arc::clone(&h.deps.registry),
            Arc::new(ReadOnlyGuard::new()),
            true,
            5,
            10,
        );
        exit_exec.pass().await.unwrap();

        let placed = h
            .store
            .exit_intents_with_status(crate::types::ExitIntentStatus::Placed)
            .unwrap();
        assert_eq!(placed.len(), 1);
        h.broker.fill(&placed[0].client_order_id, 2500.20).await;

        ExitReconciler::new(
            h.store.clone(),
            Arc::clone(&h.deps.bus),
            Arc::clone(&h.deps.registry),
            Arc::clone(&h.trade_manager),
            Arc::new(Semaphore::new(5)),
            30,
            10,
        )
        .pass()
        .await
        .unwrap();

        let closed = h.store.get_trade(&trade.trade_id).unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.realized_pnl, Some(200.80));

        let events = h.store.events_after(0, 100).unwrap();
        let exit_types: Vec<_> = events
            .iter()
            .map(|e| e.event_type)
            .filter(|t| {
                matches!(
                    t,
                    EventType::ExitSignalPublished
                        | EventType::ExitIntentApproved
                        | EventType::ExitIntentPlaced
                        | EventType::ExitIntentFilled
                        | EventType::TradeClosed
                )
            })
            .collect();
        assert_eq!(
            exit_types,
            vec![
                EventType::ExitSignalPublished,
                EventType::ExitIntentApproved,
                EventType::ExitIntentPlaced,
                EventType::ExitIntentFilled,
                EventType::TradeClosed,
            ]
        );

        // After the cooldown a fresh detection claims episode 2 but the
        // trade is no longer OPEN, so nothing more is emitted
        process_exit_candidate(
            &h.deps,
            ExitCandidate {
                trade_id: trade.trade_id.clone(),
                reason: ExitReason::TargetHit,
                price: 2500.30,
                detected_at: t0 + Duration::seconds(40),
            },
        )
        .await
        .unwrap();
        assert_eq!(h.store.exit_signals_for_trade(&trade.trade_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expiry_scheduler_retires_and_frees_identity() {
        let h = harness(true);
        let mut short_lived = candidate();
        short_lived.generated_at = Utc::now() - Duration::minutes(120);
        short_lived.expires_at = Utc::now() - Duration::minutes(60);
        process_candidate(&h.deps, short_lived).await.unwrap();

        expire_signals(&h.deps).await.unwrap();
        assert!(h.store.active_signals().unwrap().is_empty());

        let events = h.store.events_after(0, 100).unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::SignalExpired));

        // Publish precedes expiry for the same signal id
        let published_seq = events
            .iter()
            .find(|e| e.event_type == EventType::SignalPublished)
            .and_then(|e| e.seq)
            .unwrap();
        let expired_seq = events
            .iter()
            .find(|e| e.event_type == EventType::SignalExpired)
            .and_then(|e| e.seq)
            .unwrap();
        assert!(published_seq < expired_seq);
    }
}
