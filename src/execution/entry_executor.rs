/// Entry order executor: turns APPROVED intents into broker orders.
/// The trade row is created before the broker is touched; a network
/// failure leaves the row in CREATED for the reconciler to heal.
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broker::{BrokerRegistry, OrderRequest, PlaceOutcome};
use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::trades::TradeManager;
use crate::types::{Signal, SignalStatus, TradeIntent, TradeStatus, UserBroker};
use crate::watchdog::ReadOnlyGuard;

pub struct EntryJob {
    pub intent: TradeIntent,
    pub signal: Signal,
    pub user_broker: UserBroker,
}

pub struct EntryExecutor {
    store: Store,
    trade_manager: Arc<TradeManager>,
    registry: Arc<BrokerRegistry>,
    guard: Arc<ReadOnlyGuard>,
    order_execution_enabled: bool,
    call_timeout: std::time::Duration,
}

impl EntryExecutor {
    pub fn new(
        store: Store,
        trade_manager: Arc<TradeManager>,
        registry: Arc<BrokerRegistry>,
        guard: Arc<ReadOnlyGuard>,
        order_execution_enabled: bool,
        call_timeout_seconds: u64,
    ) -> Self {
        EntryExecutor {
            store,
            trade_manager,
            registry,
            guard,
            order_execution_enabled,
            call_timeout: std::time::Duration::from_secs(call_timeout_seconds),
        }
    }

    /// Consume approved-intent jobs until the channel closes
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<EntryJob>) {
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match self.execute(&job).await {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => {
                        warn!(
                            "Entry placement for intent {} left to the reconciler: {}",
                            job.intent.intent_id, e
                        );
                    }
                    Err(e) => error!("Entry execution failed: {} ({})", e, e.error_code()),
                }
            }
            warn!("Entry executor ended");
        });
    }

    /// Heal after restart: approved intents that never got a trade row
    pub async fn recover_unplaced(&self) -> Result<usize> {
        let orphans = self.store.approved_intents_without_trade()?;
        let mut recovered = 0;
        for intent in orphans {
            let signal = match self.store.get_signal(&intent.signal_id)? {
                Some(s) if s.status == SignalStatus::Published => s,
                _ => continue,
            };
            let user_broker = match self.registry.get(&intent.user_broker_id) {
                Ok(handle) => handle.record.clone(),
                Err(_) => continue,
            };
            let job = EntryJob { intent, signal, user_broker };
            match self.execute(&job).await {
                Ok(()) => recovered += 1,
                Err(e) => warn!("Recovery placement failed for {}: {}", job.intent.intent_id, e),
            }
        }
        if recovered > 0 {
            info!("Recovered {} unplaced approved intents", recovered);
        }
        Ok(recovered)
    }

    async fn execute(&self, job: &EntryJob) -> Result<()> {
        if self.guard.is_read_only() {
            return Err(EngineError::GuardFailed("read-only guard set".to_string()));
        }
        if !self.order_execution_enabled {
            return Err(EngineError::GuardFailed("order execution disabled".to_string()));
        }

        // Row first, broker second
        let trade = self
            .trade_manager
            .create_for_intent(&job.intent, &job.signal, &job.user_broker)?;
        if trade.status != TradeStatus::Created {
            // A retry landed on an already-progressed trade
            return Ok(());
        }

        let handle = self.registry.get(&job.intent.user_broker_id)?;
        let request = OrderRequest {
            symbol: trade.symbol.clone(),
            side: trade.direction,
            qty: trade.entry_qty,
            order_type: job.intent.order_type,
            limit_price: job.intent.limit_price,
            product_type: job.intent.product_type.clone(),
            client_order_id: trade.client_order_id.clone(),
        };

        let outcome = tokio::time::timeout(self.call_timeout, handle.adapter.place_order(&request))
            .await
            .map_err(|_| EngineError::BrokerTimeout(format!("placeOrder {}", trade.client_order_id)))??;

        match outcome {
            PlaceOutcome::Accepted { broker_order_id } => {
                self.trade_manager.mark_pending(&trade.trade_id, &broker_order_id)?;
                info!(
                    "Order placed: trade {} broker order {}",
                    trade.trade_id, broker_order_id
                );
            }
            PlaceOutcome::Rejected { code, message } => {
                self.trade_manager
                    .mark_rejected_by_intent(&job.intent.intent_id, &code, &message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerHandle, PaperBroker};
    use crate::events::EventBus;
    use crate::events::EventType;
    use crate::types::{BrokerRole, ConfluenceType, Direction, OrderType, StrengthBucket};
    use chrono::{NaiveDate, Utc};

    fn signal() -> Signal {
        let now = Utc::now();
        Signal {
            signal_id: "sig1".to_string(),
            symbol: "NSE:X".to_string(),
            direction: Direction::Buy,
            confluence: ConfluenceType::Triple,
            score: 0.8,
            strength: StrengthBucket::Strong,
            htf_low: 2380.0,
            htf_high: 2520.0,
            itf_low: 2390.0,
            itf_high: 2510.0,
            ltf_low: 2400.0,
            ltf_high: 2500.0,
            effective_floor: 2400.0,
            effective_ceiling: 2500.0,
            ref_price: 2450.0,
            p_win: 0.6,
            kelly: 0.05,
            generated_at: now,
            expires_at: now + chrono::Duration::minutes(60),
            last_seen_at: now,
            status: SignalStatus::Published,
            signal_day: NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
        }
    }

    fn user_broker() -> UserBroker {
        UserBroker {
            user_broker_id: "ub1".to_string(),
            user_id: "u1".to_string(),
            name: "exec-one".to_string(),
            role: BrokerRole::Exec,
            enabled: true,
            credentials_handle: String::new(),
            capital: 100_000.0,
            max_exposure: 50_000.0,
            max_per_trade: 25_000.0,
            min_trade_value: 0.0,
            max_open_trades: 5,
            max_daily_loss: 5_000.0,
            max_weekly_loss: 15_000.0,
            cooldown_minutes: 0,
            watchlist: vec!["NSE:X".to_string()],
        }
    }

    fn intent() -> TradeIntent {
        TradeIntent {
            intent_id: "i1".to_string(),
            signal_id: "sig1".to_string(),
            user_broker_id: "ub1".to_string(),
            validation_passed: true,
            approved_qty: 4,
            order_type: OrderType::Limit,
            limit_price: Some(2450.0),
            product_type: "INTRADAY".to_string(),
            rejection_reasons: vec![],
            created_at: Utc::now(),
        }
    }

    fn executor(store: &Store, broker: Arc<PaperBroker>) -> EntryExecutor {
        let bus = Arc::new(EventBus::new(store.clone()));
        let trade_manager = Arc::new(TradeManager::new(store.clone(), bus));
        let registry = Arc::new(BrokerRegistry::new(vec![BrokerHandle {
            record: user_broker(),
            adapter: broker,
        }]));
        EntryExecutor::new(
            store.clone(),
            trade_manager,
            registry,
            Arc::new(ReadOnlyGuard::new()),
            true,
            10,
        )
    }

    #[tokio::test]
    async fn test_accept_path_marks_pending() {
        let store = Store::open_in_memory().unwrap();
        let exec = executor(&store, Arc::new(PaperBroker::new(false, 0.0)));
        let job = EntryJob { intent: intent(), signal: signal(), user_broker: user_broker() };
        exec.execute(&job).await.unwrap();

        let trade = store.get_trade_by_intent("i1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert!(trade.broker_order_id.is_some());

        let events = store.events_after(0, 10).unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::TradeCreated, EventType::OrderPlaced]);
    }

    #[tokio::test]
    async fn test_synchronous_rejection_marks_rejected() {
        let store = Store::open_in_memory().unwrap();
        let broker = Arc::new(PaperBroker::new(false, 0.0));
        broker.reject_next("RMS_BLOCK").await;
        let exec = executor(&store, Arc::clone(&broker));
        let job = EntryJob { intent: intent(), signal: signal(), user_broker: user_broker() };
        exec.execute(&job).await.unwrap();

        let trade = store.get_trade_by_intent("i1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Rejected);
    }

    #[tokio::test]
    async fn test_network_failure_leaves_created() {
        let store = Store::open_in_memory().unwrap();
        let broker = Arc::new(PaperBroker::new(false, 0.0));
        broker.fail_next().await;
        let exec = executor(&store, Arc::clone(&broker));
        let job = EntryJob { intent: intent(), signal: signal(), user_broker: user_broker() };

        let err = exec.execute(&job).await.unwrap_err();
        assert!(err.is_recoverable());

        // A network failure is not a rejection: the row stays CREATED
        let trade = store.get_trade_by_intent("i1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Created);
    }

    #[tokio::test]
    async fn test_guard_refuses_without_state_change() {
        let store = Store::open_in_memory().unwrap();
        let broker = Arc::new(PaperBroker::new(false, 0.0));
        let exec = executor(&store, broker);
        exec.guard.set(true);
        let job = EntryJob { intent: intent(), signal: signal(), user_broker: user_broker() };

        let err = exec.execute(&job).await.unwrap_err();
        assert!(matches!(err, EngineError::GuardFailed(_)));
        assert!(store.get_trade_by_intent("i1").unwrap().is_none());
    }
}
