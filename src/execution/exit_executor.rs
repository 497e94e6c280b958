/// Exit qualifier and executor.
/// The qualifier validates a PENDING exit intent against the trade and the
/// market-hours policy; the executor polls APPROVED intents, wins the
/// APPROVED -> PLACED race, and puts the order on the wire.
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerRegistry, OrderRequest, PlaceOutcome};
use crate::config::ExitConfig;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventPayload, EventType};
use crate::store::Store;
use crate::time::SessionClock;
use crate::trades::TradeManager;
use crate::types::{ExitIntent, ExitIntentStatus, ExitReason, OrderType, Trade, TradeStatus};
use crate::watchdog::ReadOnlyGuard;

/// Qualifier outcome with the final order parameters
#[derive(Debug, Clone)]
pub struct ExitVerdict {
    pub status: ExitIntentStatus,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub codes: Vec<String>,
}

pub struct ExitQualifier {
    store: Store,
    registry: Arc<BrokerRegistry>,
    clock: Arc<SessionClock>,
    cfg: ExitConfig,
}

impl ExitQualifier {
    pub fn new(store: Store, registry: Arc<BrokerRegistry>, clock: Arc<SessionClock>, cfg: ExitConfig) -> Self {
        ExitQualifier { store, registry, clock, cfg }
    }

    pub async fn qualify(&self, intent: &ExitIntent, trade: &Trade) -> Result<ExitVerdict> {
        let mut codes: Vec<String> = Vec::new();
        let now = Utc::now();

        match self.registry.get(&intent.user_broker_id) {
            Ok(handle) => {
                if !handle.record.enabled {
                    codes.push("BROKER_DISABLED".to_string());
                }
                if !handle.adapter.is_connected().await {
                    codes.push("BROKER_DISCONNECTED".to_string());
                }
            }
            Err(_) => codes.push("BROKER_NOT_REGISTERED".to_string()),
        }

        if trade.status != TradeStatus::Open {
            codes.push("TRADE_NOT_OPEN".to_string());
        }
        if trade.user_broker_id != intent.user_broker_id {
            codes.push("USER_BROKER_MISMATCH".to_string());
        }
        if self.store.live_exit_intent_exists(&trade.trade_id, &intent.exit_intent_id)? {
            codes.push("EXIT_ALREADY_IN_FLIGHT".to_string());
        }

        // Market-hours policy: stop-loss may fire any time in session;
        // target and manual exits stay out of the closing window.
        if !self.clock.is_market_open(now) {
            codes.push("MARKET_CLOSED".to_string());
        } else if matches!(intent.reason, ExitReason::TargetHit | ExitReason::Manual)
            && self.clock.minutes_to_close(now) < self.cfg.exit_cutoff_minutes
        {
            codes.push("EXIT_CUTOFF_WINDOW".to_string());
        }

        let (order_type, limit_price) = match intent.reason {
            ExitReason::TargetHit | ExitReason::Manual => (OrderType::Limit, intent.limit_price),
            ExitReason::StopLoss | ExitReason::TimeBased | ExitReason::TrailingStop => (OrderType::Market, None),
        };

        let status = if codes.is_empty() {
            ExitIntentStatus::Approved
        } else {
            ExitIntentStatus::Rejected
        };
        Ok(ExitVerdict { status, order_type, limit_price, codes })
    }
}

pub struct ExitExecutor {
    store: Store,
    bus: Arc<EventBus>,
    trade_manager: Arc<TradeManager>,
    registry: Arc<BrokerRegistry>,
    guard: Arc<ReadOnlyGuard>,
    order_execution_enabled: bool,
    poll_interval: std::time::Duration,
    call_timeout: std::time::Duration,
}

impl ExitExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        trade_manager: Arc<TradeManager>,
        registry: Arc<BrokerRegistry>,
        guard: Arc<ReadOnlyGuard>,
        order_execution_enabled: bool,
        poll_seconds: u64,
        call_timeout_seconds: u64,
    ) -> Self {
        ExitExecutor {
            store,
            bus,
            trade_manager,
            registry,
            guard,
            order_execution_enabled,
            poll_interval: std::time::Duration::from_secs(poll_seconds.max(1)),
            call_timeout: std::time::Duration::from_secs(call_timeout_seconds),
        }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.pass().await {
                    error!("Exit executor pass failed: {}", e);
                }
            }
        });
    }

    /// Place every APPROVED exit intent; each item is independent and one
    /// failure never halts the pass.
    pub async fn pass(&self) -> Result<()> {
        let approved = self.store.exit_intents_with_status(ExitIntentStatus::Approved)?;
        for intent in approved {
            if let Err(e) = self.execute(&intent).await {
                if e.is_recoverable() {
                    warn!("Exit placement for {} left to the reconciler: {}", intent.exit_intent_id, e);
                } else {
                    error!("Exit execution failed for {}: {}", intent.exit_intent_id, e);
                }
            }
        }
        Ok(())
    }

    async fn execute(&self, intent: &ExitIntent) -> Result<()> {
        if self.guard.is_read_only() {
            return Err(EngineError::GuardFailed("read-only guard set".to_string()));
        }
        if !self.order_execution_enabled {
            return Err(EngineError::GuardFailed("order execution disabled".to_string()));
        }

        let trade = self
            .store
            .get_trade(&intent.trade_id)?
            .ok_or_else(|| EngineError::NotFound(format!("trade {}", intent.trade_id)))?;

        // Win the APPROVED -> PLACED race before touching the broker
        if !self.store.mark_exit_intent_placed(&intent.exit_intent_id, Utc::now())? {
            debug!("Exit intent {} already taken", intent.exit_intent_id);
            return Ok(());
        }

        let handle = self.registry.get(&intent.user_broker_id)?;
        let request = OrderRequest {
            symbol: trade.symbol.clone(),
            side: trade.direction.closing_side(),
            qty: trade.entry_qty,
            order_type: intent.order_type,
            limit_price: intent.limit_price,
            product_type: "INTRADAY".to_string(),
            client_order_id: intent.client_order_id.clone(),
        };

        let outcome = tokio::time::timeout(self.call_timeout, handle.adapter.place_order(&request))
            .await
            .map_err(|_| EngineError::BrokerTimeout(format!("exit placeOrder {}", intent.client_order_id)))??;

        match outcome {
            PlaceOutcome::Accepted { broker_order_id } => {
                self.store
                    .set_exit_intent_broker_order(&intent.exit_intent_id, &broker_order_id)?;
                self.bus.append(
                    Event::for_user_broker(
                        EventType::ExitIntentPlaced,
                        &trade.user_id,
                        &trade.user_broker_id,
                        EventPayload::ExitIntentPlaced {
                            reason: intent.reason,
                            client_order_id: intent.client_order_id.clone(),
                        },
                    )
                    .with_trade(&trade.trade_id),
                )?;
                self.trade_manager.mark_exiting(&trade.trade_id)?;
                info!(
                    "Exit order placed: trade {} {} (broker order {})",
                    trade.trade_id,
                    intent.reason.as_str(),
                    broker_order_id
                );
            }
            PlaceOutcome::Rejected { code, message } => {
                warn!(
                    "Exit order rejected for trade {}: {} {}",
                    trade.trade_id, code, message
                );
                self.store
                    .mark_exit_intent_failed(&intent.exit_intent_id, &code)?;
            }
        }
        Ok(())
    }
}
