/// Trade manager: the only writer of trade rows. Every transition is a
/// read-modify-CAS cycle against the store; the first writer wins and the
/// loser re-reads. Terminal states absorb further writes silently.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventPayload, EventType};
use crate::store::trades::TradeInsert;
use crate::store::Store;
use crate::types::{round2, Direction, ExitReason, Signal, Trade, TradeIntent, TradeStatus, UserBroker};

const CAS_RETRIES: usize = 3;

pub struct TradeManager {
    store: Store,
    bus: Arc<EventBus>,
}

impl TradeManager {
    pub fn new(store: Store, bus: Arc<EventBus>) -> Self {
        TradeManager { store, bus }
    }

    /// Insert the CREATED row for an approved intent. Idempotent: a second
    /// call with the same intent returns the existing row and emits nothing.
    /// The row exists before any broker call is made.
    pub fn create_for_intent(
        &self,
        intent: &TradeIntent,
        signal: &Signal,
        user_broker: &UserBroker,
    ) -> Result<Trade> {
        let trade_number = self
            .store
            .count_active_trades(&user_broker.user_id, &signal.symbol)?
            + 1;
        let now = Utc::now();
        let trade = Trade {
            trade_id: uuid::Uuid::new_v4().to_string(),
            intent_id: intent.intent_id.clone(),
            client_order_id: intent.intent_id.clone(),
            broker_order_id: None,
            user_id: user_broker.user_id.clone(),
            user_broker_id: user_broker.user_broker_id.clone(),
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            trade_number,
            status: TradeStatus::Created,
            entry_price: None,
            entry_qty: intent.approved_qty,
            entry_value: None,
            entry_timestamp: None,
            exit_target_price: signal.effective_ceiling,
            exit_stop_price: signal.effective_floor,
            trailing_active: false,
            trailing_extremum: None,
            trailing_stop_price: None,
            exit_price: None,
            exit_timestamp: None,
            exit_reason: None,
            realized_pnl: None,
            realized_log_return: None,
            last_broker_update_at: None,
            created_at: now,
            updated_at: now,
            row_version: 1,
        };

        match self.store.insert_trade(&trade)? {
            TradeInsert::Inserted(trade) => {
                self.bus.append(
                    Event::for_user_broker(
                        EventType::TradeCreated,
                        &trade.user_id,
                        &trade.user_broker_id,
                        EventPayload::TradeCreated {
                            symbol: trade.symbol.clone(),
                            direction: trade.direction,
                            status: trade.status,
                            trade_number: trade.trade_number,
                            qty: trade.entry_qty,
                        },
                    )
                    .with_signal(&trade.signal_id)
                    .with_intent(&trade.intent_id)
                    .with_trade(&trade.trade_id),
                )?;
                info!(
                    "Trade {} created: {} {} x{} (#{})",
                    trade.trade_id,
                    trade.direction.as_str(),
                    trade.symbol,
                    trade.entry_qty,
                    trade.trade_number
                );
                Ok(trade)
            }
            TradeInsert::Existing(existing) => {
                debug!("Trade for intent {} already exists", intent.intent_id);
                Ok(existing)
            }
        }
    }

    /// CREATED -> PENDING on broker acceptance; emits ORDER_PLACED
    pub fn mark_pending(&self, trade_id: &str, broker_order_id: &str) -> Result<Trade> {
        self.transition(trade_id, &[TradeStatus::Created], |trade, now| {
            trade.status = TradeStatus::Pending;
            trade.broker_order_id = Some(broker_order_id.to_string());
            trade.last_broker_update_at = Some(now);
            Some(
                Event::for_user_broker(
                    EventType::OrderPlaced,
                    &trade.user_id,
                    &trade.user_broker_id,
                    EventPayload::OrderPlaced {
                        symbol: trade.symbol.clone(),
                        client_order_id: trade.client_order_id.clone(),
                        qty: trade.entry_qty,
                    },
                )
                .with_intent(&trade.intent_id)
                .with_trade(&trade.trade_id),
            )
        })
    }

    /// CREATED/PENDING -> OPEN on fill; emits ORDER_FILLED then TRADE_UPDATED
    pub fn mark_open(
        &self,
        trade_id: &str,
        fill_price: f64,
        fill_qty: i64,
        fill_time: DateTime<Utc>,
    ) -> Result<Trade> {
        let trade = self.transition(
            trade_id,
            &[TradeStatus::Created, TradeStatus::Pending],
            |trade, now| {
                trade.status = TradeStatus::Open;
                trade.entry_price = Some(round2(fill_price));
                trade.entry_qty = fill_qty;
                trade.entry_value = Some(round2(fill_price * fill_qty as f64));
                trade.entry_timestamp = Some(fill_time);
                trade.last_broker_update_at = Some(now);
                Some(
                    Event::for_user_broker(
                        EventType::OrderFilled,
                        &trade.user_id,
                        &trade.user_broker_id,
                        EventPayload::OrderFilled {
                            symbol: trade.symbol.clone(),
                            avg_price: round2(fill_price),
                            filled_qty: fill_qty,
                        },
                    )
                    .with_intent(&trade.intent_id)
                    .with_trade(&trade.trade_id),
                )
            },
        )?;
        if trade.status == TradeStatus::Open {
            self.emit_trade_updated(&trade)?;
        }
        Ok(trade)
    }

    /// Conditional rejection keyed by intent: only a CREATED row changes.
    /// Returns whether anything was updated; emits nothing on miss.
    pub fn mark_rejected_by_intent(&self, intent_id: &str, code: &str, message: &str) -> Result<bool> {
        let updated = self.store.reject_trade_by_intent(intent_id, Utc::now())?;
        if !updated {
            return Ok(false);
        }
        if let Some(trade) = self.store.get_trade_by_intent(intent_id)? {
            self.bus.append(
                Event::for_user_broker(
                    EventType::OrderRejected,
                    &trade.user_id,
                    &trade.user_broker_id,
                    EventPayload::OrderRejected {
                        symbol: trade.symbol.clone(),
                        code: code.to_string(),
                        message: message.to_string(),
                    },
                )
                .with_intent(&trade.intent_id)
                .with_trade(&trade.trade_id),
            )?;
            warn!("Trade {} rejected by broker: {} {}", trade.trade_id, code, message);
        }
        Ok(true)
    }

    /// OPEN -> EXITING once an exit order is on the wire
    pub fn mark_exiting(&self, trade_id: &str) -> Result<Trade> {
        let trade = self.transition(trade_id, &[TradeStatus::Open], |trade, _| {
            trade.status = TradeStatus::Exiting;
            None
        })?;
        if trade.status == TradeStatus::Exiting {
            self.emit_trade_updated(&trade)?;
        }
        Ok(trade)
    }

    /// OPEN/EXITING -> CLOSED with realized P&L; emits TRADE_CLOSED
    pub fn mark_closed(
        &self,
        trade_id: &str,
        exit_price: f64,
        exit_reason: ExitReason,
        exit_time: DateTime<Utc>,
    ) -> Result<Trade> {
        self.transition(
            trade_id,
            &[TradeStatus::Open, TradeStatus::Exiting],
            |trade, now| {
                let entry = trade.entry_price.unwrap_or(exit_price);
                let qty = trade.entry_qty as f64;
                let pnl = match trade.direction {
                    Direction::Buy => (exit_price - entry) * qty,
                    Direction::Sell => (entry - exit_price) * qty,
                };
                let log_return = if entry > 0.0 && exit_price > 0.0 {
                    let raw = (exit_price / entry).ln();
                    match trade.direction {
                        Direction::Buy => raw,
                        Direction::Sell => -raw,
                    }
                } else {
                    0.0
                };
                trade.status = TradeStatus::Closed;
                trade.exit_price = Some(round2(exit_price));
                trade.exit_timestamp = Some(exit_time);
                trade.exit_reason = Some(exit_reason);
                trade.realized_pnl = Some(round2(pnl));
                trade.realized_log_return = Some(log_return);
                trade.last_broker_update_at = Some(now);
                Some(
                    Event::for_user_broker(
                        EventType::TradeClosed,
                        &trade.user_id,
                        &trade.user_broker_id,
                        EventPayload::TradeClosed {
                            symbol: trade.symbol.clone(),
                            exit_price: round2(exit_price),
                            exit_reason,
                            realized_pnl: round2(pnl),
                            realized_log_return: log_return,
                        },
                    )
                    .with_intent(&trade.intent_id)
                    .with_trade(&trade.trade_id),
                )
            },
        )
    }

    /// CREATED/PENDING -> TIMEOUT after prolonged broker silence
    pub fn mark_timeout(&self, trade_id: &str, pending_minutes: i64) -> Result<Trade> {
        self.transition(
            trade_id,
            &[TradeStatus::Created, TradeStatus::Pending],
            |trade, now| {
                trade.status = TradeStatus::Timeout;
                trade.last_broker_update_at = Some(now);
                Some(
                    Event::for_user_broker(
                        EventType::OrderTimeout,
                        &trade.user_id,
                        &trade.user_broker_id,
                        EventPayload::OrderTimeout {
                            symbol: trade.symbol.clone(),
                            pending_minutes,
                        },
                    )
                    .with_intent(&trade.intent_id)
                    .with_trade(&trade.trade_id),
                )
            },
        )
    }

    /// PENDING -> CANCELLED on broker-side cancel or post-acceptance reject
    pub fn mark_cancelled(&self, trade_id: &str) -> Result<Trade> {
        let trade = self.transition(trade_id, &[TradeStatus::Pending], |trade, now| {
            trade.status = TradeStatus::Cancelled;
            trade.last_broker_update_at = Some(now);
            None
        })?;
        if trade.status == TradeStatus::Cancelled {
            self.emit_trade_updated(&trade)?;
        }
        Ok(trade)
    }

    /// Trailing-stop bookkeeping; no event, the exit detector is chatty
    pub fn update_trailing(
        &self,
        trade_id: &str,
        extremum: f64,
        stop_price: f64,
        active: bool,
    ) -> Result<Trade> {
        self.transition(trade_id, &[TradeStatus::Open, TradeStatus::Exiting], |trade, _| {
            trade.trailing_active = active;
            trade.trailing_extremum = Some(extremum);
            trade.trailing_stop_price = Some(stop_price);
            None
        })
    }

    /// Refresh the broker-view timestamp without a state change
    pub fn touch_broker_update(&self, trade_id: &str) -> Result<Trade> {
        self.transition(
            trade_id,
            &[TradeStatus::Created, TradeStatus::Pending, TradeStatus::Open, TradeStatus::Exiting],
            |trade, now| {
                trade.last_broker_update_at = Some(now);
                None
            },
        )
    }

    /// Read-modify-CAS with bounded retries. A row already outside
    /// `allowed_from` is returned untouched: terminal states absorb writes
    /// and a lost race against a forward transition is not an error.
    fn transition<F>(&self, trade_id: &str, allowed_from: &[TradeStatus], mutate: F) -> Result<Trade>
    where
        F: Fn(&mut Trade, DateTime<Utc>) -> Option<Event>,
    {
        for attempt in 0..CAS_RETRIES {
            let mut trade = self
                .store
                .get_trade(trade_id)?
                .ok_or_else(|| EngineError::NotFound(format!("trade {}", trade_id)))?;

            if !allowed_from.contains(&trade.status) {
                if trade.status.is_terminal() {
                    debug!(
                        "Trade {} is terminal ({}), write absorbed",
                        trade_id,
                        trade.status.as_str()
                    );
                    return Ok(trade);
                }
                return Err(EngineError::InvalidTransition(format!(
                    "trade {} is {} (allowed: {:?})",
                    trade_id,
                    trade.status.as_str(),
                    allowed_from.iter().map(|s| s.as_str()).collect::<Vec<_>>()
                )));
            }

            let now = Utc::now();
            let event = mutate(&mut trade, now);
            trade.updated_at = now;

            if self.store.cas_update_trade(&trade)? {
                trade.row_version += 1;
                if let Some(event) = event {
                    self.bus.append(event)?;
                }
                return Ok(trade);
            }
            debug!("CAS miss on trade {} (attempt {})", trade_id, attempt + 1);
        }
        Err(EngineError::StaleVersion(format!("trade {}", trade_id)))
    }

    fn emit_trade_updated(&self, trade: &Trade) -> Result<()> {
        self.bus.append(
            Event::for_user_broker(
                EventType::TradeUpdated,
                &trade.user_id,
                &trade.user_broker_id,
                EventPayload::TradeUpdated {
                    symbol: trade.symbol.clone(),
                    status: trade.status,
                    entry_price: trade.entry_price,
                },
            )
            .with_intent(&trade.intent_id)
            .with_trade(&trade.trade_id),
        )?;
        Ok(())
    }
}
