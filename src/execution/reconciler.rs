/// Broker-state reconciliation. Two single-instance reconcilers run on the
/// same interval with an offset so their pulls do not collide; outbound
/// broker calls share a bounded semaphore. Every state change goes through
/// the trade manager; trade rows are never written here.
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerOrderState, BrokerRegistry};
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventPayload, EventType};
use crate::store::Store;
use crate::trades::TradeManager;
use crate::types::{ExitIntentStatus, Trade, TradeStatus};

pub struct EntryReconciler {
    store: Store,
    registry: Arc<BrokerRegistry>,
    trade_manager: Arc<TradeManager>,
    semaphore: Arc<Semaphore>,
    interval_seconds: u64,
    pending_timeout_minutes: i64,
    call_timeout: std::time::Duration,
}

impl EntryReconciler {
    pub fn new(
        store: Store,
        registry: Arc<BrokerRegistry>,
        trade_manager: Arc<TradeManager>,
        semaphore: Arc<Semaphore>,
        interval_seconds: u64,
        pending_timeout_minutes: i64,
        call_timeout_seconds: u64,
    ) -> Self {
        EntryReconciler {
            store,
            registry,
            trade_manager,
            semaphore,
            interval_seconds,
            pending_timeout_minutes,
            call_timeout: std::time::Duration::from_secs(call_timeout_seconds),
        }
    }

    pub fn spawn(self: Arc<Self>, offset_seconds: u64) {
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(offset_seconds)).await;
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(self.interval_seconds.max(1)));
            loop {
                ticker.tick().await;
                if let Err(e) = self.pass().await {
                    error!("Entry reconcile pass failed: {}", e);
                }
            }
        });
    }

    /// Heal CREATED/PENDING trades whose broker view is stale. One trade's
    /// failure never halts the pass.
    pub async fn pass(&self) -> Result<()> {
        let stale_before = Utc::now() - Duration::seconds(self.interval_seconds as i64);
        let stuck = self.store.trades_awaiting_broker(stale_before)?;
        if stuck.is_empty() {
            return Ok(());
        }
        debug!("Entry reconciler inspecting {} trades", stuck.len());

        let results = join_all(stuck.into_iter().map(|trade| {
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let _permit = semaphore.acquire().await;
                let trade_id = trade.trade_id.clone();
                (trade_id, self.reconcile_trade(trade).await)
            }
        }))
        .await;

        for (trade_id, result) in results {
            if let Err(e) = result {
                warn!("Reconcile skipped trade {}: {}", trade_id, e);
            }
        }
        Ok(())
    }

    async fn reconcile_trade(&self, trade: Trade) -> Result<()> {
        let handle = self.registry.get(&trade.user_broker_id)?;
        let snapshot = tokio::time::timeout(
            self.call_timeout,
            handle.adapter.order_status(&trade.client_order_id),
        )
        .await
        .map_err(|_| EngineError::BrokerTimeout(format!("getOrderStatus {}", trade.client_order_id)))??;

        match snapshot.state {
            BrokerOrderState::Filled => {
                let avg_price = snapshot
                    .avg_price
                    .ok_or_else(|| EngineError::Internal("FILLED without avg price".to_string()))?;
                let qty = if snapshot.filled_qty > 0 {
                    snapshot.filled_qty
                } else {
                    trade.entry_qty
                };
                let filled = self
                    .trade_manager
                    .mark_open(&trade.trade_id, avg_price, qty, snapshot.updated_at)?;
                info!(
                    "Reconciled fill: trade {} entry {:.2}",
                    filled.trade_id,
                    filled.entry_price.unwrap_or(avg_price)
                );
            }
            BrokerOrderState::Rejected => {
                let code = snapshot.reject_reason.unwrap_or_else(|| "BROKER_REJECTED".to_string());
                if trade.status == TradeStatus::Created {
                    self.trade_manager
                        .mark_rejected_by_intent(&trade.intent_id, &code, "discovered by reconciler")?;
                } else {
                    self.trade_manager.mark_cancelled(&trade.trade_id)?;
                }
            }
            BrokerOrderState::Cancelled => {
                if trade.status == TradeStatus::Pending {
                    self.trade_manager.mark_cancelled(&trade.trade_id)?;
                } else {
                    self.timeout_or_touch(&trade)?;
                }
            }
            BrokerOrderState::Pending | BrokerOrderState::NotFound => {
                self.timeout_or_touch(&trade)?;
            }
        }
        Ok(())
    }

    /// Non-terminal past the pending timeout becomes TIMEOUT; otherwise
    /// just refresh the broker-view timestamp.
    fn timeout_or_touch(&self, trade: &Trade) -> Result<()> {
        let age_minutes = (Utc::now() - trade.created_at).num_minutes();
        if age_minutes > self.pending_timeout_minutes {
            self.trade_manager.mark_timeout(&trade.trade_id, age_minutes)?;
            warn!(
                "Trade {} timed out after {} minutes without a terminal broker state",
                trade.trade_id, age_minutes
            );
        } else {
            self.trade_manager.touch_broker_update(&trade.trade_id)?;
        }
        Ok(())
    }
}

pub struct ExitReconciler {
    store: Store,
    bus: Arc<EventBus>,
    registry: Arc<BrokerRegistry>,
    trade_manager: Arc<TradeManager>,
    semaphore: Arc<Semaphore>,
    interval_seconds: u64,
    call_timeout: std::time::Duration,
}

impl ExitReconciler {
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        registry: Arc<BrokerRegistry>,
        trade_manager: Arc<TradeManager>,
        semaphore: Arc<Semaphore>,
        interval_seconds: u64,
        call_timeout_seconds: u64,
    ) -> Self {
        ExitReconciler {
            store,
            bus,
            registry,
            trade_manager,
            semaphore,
            interval_seconds,
            call_timeout: std::time::Duration::from_secs(call_timeout_seconds),
        }
    }

    pub fn spawn(self: Arc<Self>, offset_seconds: u64) {
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(offset_seconds)).await;
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(self.interval_seconds.max(1)));
            loop {
                ticker.tick().await;
                if let Err(e) = self.pass().await {
                    error!("Exit reconcile pass failed: {}", e);
                }
            }
        });
    }

    /// Resolve PLACED exit intents against broker truth
    pub async fn pass(&self) -> Result<()> {
        let placed = self.store.exit_intents_with_status(ExitIntentStatus::Placed)?;
        if placed.is_empty() {
            return Ok(());
        }
        debug!("Exit reconciler inspecting {} intents", placed.len());

        let results = join_all(placed.into_iter().map(|intent| {
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let _permit = semaphore.acquire().await;
                let id = intent.exit_intent_id.clone();
                (id, self.reconcile_intent(intent).await)
            }
        }))
        .await;

        for (intent_id, result) in results {
            if let Err(e) = result {
                warn!("Exit reconcile skipped intent {}: {}", intent_id, e);
            }
        }
        Ok(())
    }

    async fn reconcile_intent(&self, intent: crate::types::ExitIntent) -> Result<()> {
        let handle = self.registry.get(&intent.user_broker_id)?;
        let snapshot = tokio::time::timeout(
            self.call_timeout,
            handle.adapter.order_status(&intent.client_order_id),
        )
        .await
        .map_err(|_| EngineError::BrokerTimeout(format!("getOrderStatus {}", intent.client_order_id)))??;

        match snapshot.state {
            BrokerOrderState::Filled => {
                let avg_price = snapshot
                    .avg_price
                    .ok_or_else(|| EngineError::Internal("FILLED without avg price".to_string()))?;
                if !self
                    .store
                    .mark_exit_intent_filled(&intent.exit_intent_id, snapshot.updated_at)?
                {
                    return Ok(());
                }
                let trade = self
                    .store
                    .get_trade(&intent.trade_id)?
                    .ok_or_else(|| EngineError::NotFound(format!("trade {}", intent.trade_id)))?;
                self.bus.append(
                    Event::for_user_broker(
                        EventType::ExitIntentFilled,
                        &trade.user_id,
                        &trade.user_broker_id,
                        EventPayload::ExitIntentFilled {
                            reason: intent.reason,
                            avg_price,
                        },
                    )
                    .with_trade(&trade.trade_id),
                )?;
                let closed = self.trade_manager.mark_closed(
                    &trade.trade_id,
                    avg_price,
                    intent.reason,
                    snapshot.updated_at,
                )?;
                info!(
                    "Trade {} closed via {} @ {:.2} (pnl {:?})",
                    closed.trade_id,
                    intent.reason.as_str(),
                    avg_price,
                    closed.realized_pnl
                );
            }
            BrokerOrderState::Rejected | BrokerOrderState::Cancelled => {
                let code = snapshot.reject_reason.unwrap_or_else(|| "BROKER_REJECTED".to_string());
                self.store.mark_exit_intent_failed(&intent.exit_intent_id, &code)?;
                warn!("Exit intent {} failed at broker: {}", intent.exit_intent_id, code);
            }
            BrokerOrderState::Pending | BrokerOrderState::NotFound => {
                // Still working, or the order never reached the book; the
                // next pass looks again
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerAdapter, BrokerHandle, OrderRequest, PaperBroker, PlaceOutcome};
    use crate::types::{
        BrokerRole, Direction, ExitIntent, ExitReason, OrderType, UserBroker,
    };
    use crate::store::trades::TradeInsert;

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

    fn registry(broker: Arc<PaperBroker>) -> Arc<BrokerRegistry> {
        Arc::new(BrokerRegistry::new(vec![BrokerHandle {
            record: user_broker(),
            adapter: broker,
        }]))
    }

    fn pending_trade(store: &Store, trade_id: &str, created_minutes_ago: i64) -> Trade {
        let created = Utc::now() - Duration::minutes(created_minutes_ago);
        let trade = Trade {
            trade_id: trade_id.to_string(),
            intent_id: format!("i-{}", trade_id),
            client_order_id: format!("c-{}", trade_id),
            broker_order_id: Some(format!("b-{}", trade_id)),
            user_id: "u1".to_string(),
            user_broker_id: "ub1".to_string(),
            signal_id: "sig1".to_string(),
            symbol: "NSE:X".to_string(),
            direction: Direction::Buy,
            trade_number: 1,
            status: TradeStatus::Pending,
            entry_price: None,
            entry_qty: 4,
            entry_value: None,
            entry_timestamp: None,
            exit_target_price: 2500.0,
            exit_stop_price: 2400.0,
            trailing_active: false,
            trailing_extremum: None,
            trailing_stop_price: None,
            exit_price: None,
            exit_timestamp: None,
            exit_reason: None,
            realized_pnl: None,
            realized_log_return: None,
            last_broker_update_at: None,
            created_at: created,
            updated_at: created,
            row_version: 1,
        };
        match store.insert_trade(&trade).unwrap() {
            TradeInsert::Inserted(t) => t,
            TradeInsert::Existing(_) => panic!("fixture trade already present"),
        }
    }

    fn entry_reconciler(store: &Store, broker: Arc<PaperBroker>) -> EntryReconciler {
        let bus = Arc::new(EventBus::new(store.clone()));
        EntryReconciler::new(
            store.clone(),
            registry(broker),
            Arc::new(TradeManager::new(store.clone(), bus)),
            Arc::new(Semaphore::new(5)),
            30,
            10,
            10,
        )
    }

    async fn place(broker: &PaperBroker, client_order_id: &str) {
        let outcome = broker
            .place_order(&OrderRequest {
                symbol: "NSE:X".to_string(),
                side: Direction::Buy,
                qty: 4,
                order_type: OrderType::Limit,
                limit_price: Some(2450.0),
                product_type: "INTRADAY".to_string(),
                client_order_id: client_order_id.to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, PlaceOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn test_silent_fill_heals_to_open() {
        let store = Store::open_in_memory().unwrap();
        let broker = Arc::new(PaperBroker::new(false, 0.0));
        pending_trade(&store, "t1", 1);
        place(&broker, "c-t1").await;
        // The fill callback never fired, but the broker knows the truth
        broker.fill("c-t1", 2451.30).await;

        entry_reconciler(&store, broker).pass().await.unwrap();

        let trade = store.get_trade("t1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.entry_price, Some(2451.30));
    }

    #[tokio::test]
    async fn test_stuck_pending_times_out() {
        let store = Store::open_in_memory().unwrap();
        let broker = Arc::new(PaperBroker::new(false, 0.0));
        pending_trade(&store, "t1", 15); // past the 10-minute timeout
        place(&broker, "c-t1").await;

        entry_reconciler(&store, broker).pass().await.unwrap();

        let trade = store.get_trade("t1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Timeout);
    }

    #[tokio::test]
    async fn test_young_pending_is_touched_not_timed_out() {
        let store = Store::open_in_memory().unwrap();
        let broker = Arc::new(PaperBroker::new(false, 0.0));
        pending_trade(&store, "t1", 1);
        place(&broker, "c-t1").await;

        entry_reconciler(&store, broker).pass().await.unwrap();

        let trade = store.get_trade("t1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert!(trade.last_broker_update_at.is_some());
    }

    #[tokio::test]
    async fn test_exit_fill_closes_trade_with_pnl() {
        let store = Store::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::new(store.clone()));
        let broker = Arc::new(PaperBroker::new(false, 0.0));
        let trade_manager = Arc::new(TradeManager::new(store.clone(), Arc::clone(&bus)));

        // An OPEN trade with a PLACED exit intent
        let trade = pending_trade(&store, "t1", 1);
        trade_manager.mark_open(&trade.trade_id, 2450.0, 4, Utc::now()).unwrap();
        let intent = ExitIntent {
            exit_intent_id: "xi1".to_string(),
            exit_signal_id: "xs1".to_string(),
            trade_id: "t1".to_string(),
            user_broker_id: "ub1".to_string(),
            reason: ExitReason::TargetHit,
            episode_id: 1,
            status: ExitIntentStatus::Pending,
            order_type: OrderType::Limit,
            limit_price: Some(2500.0),
            client_order_id: "exit-xi1".to_string(),
            broker_order_id: None,
            rejection_reasons: vec![],
            placed_at: None,
            filled_at: None,
            created_at: Utc::now(),
        };
        store.insert_exit_intent(&intent).unwrap();
        store
            .qualify_exit_intent("xi1", ExitIntentStatus::Approved, OrderType::Limit, Some(2500.0), &[])
            .unwrap();
        store.mark_exit_intent_placed("xi1", Utc::now()).unwrap();
        place(&broker, "exit-xi1").await;
        broker.fill("exit-xi1", 2500.20).await;

        let reconciler = ExitReconciler::new(
            store.clone(),
            Arc::clone(&bus),
            registry(Arc::clone(&broker)),
            trade_manager,
            Arc::new(Semaphore::new(5)),
            30,
            10,
        );
        reconciler.pass().await.unwrap();

        let closed = store.get_trade("t1").unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.exit_price, Some(2500.20));
        assert_eq!(closed.realized_pnl, Some(200.80));

        let current = store.get_exit_intent("xi1").unwrap().unwrap();
        assert_eq!(current.status, ExitIntentStatus::Filled);

        // The event trail includes the exit fill and the close
        let events = store.events_after(0, 100).unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::ExitIntentFilled));
        assert!(types.contains(&EventType::TradeClosed));
    }
}
