/// Event envelope and payload definitions
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    Candle, ConfluenceType, Direction, ExitReason, OrderType, StrengthBucket, Timeframe, TradeStatus,
};

/// Delivery scope; routing fields live on the envelope, not in the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventScope {
    Global,
    User,
    UserBroker,
}

impl EventScope {
    pub fn as_str(&self) -> &str {
        match self {
            EventScope::Global => "GLOBAL",
            EventScope::User => "USER",
            EventScope::UserBroker => "USER_BROKER",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GLOBAL" => Some(EventScope::Global),
            "USER" => Some(EventScope::User),
            "USER_BROKER" => Some(EventScope::UserBroker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // Market data
    Tick,
    CandleClosed,

    // Entry signals
    SignalPublished,
    SignalExpired,
    SignalDeliveryCreated,

    // Qualification
    IntentApproved,
    IntentRejected,

    // Trade lifecycle
    TradeCreated,
    TradeUpdated,
    TradeClosed,

    // Entry orders
    OrderPlaced,
    OrderFilled,
    OrderRejected,
    OrderTimeout,

    // Exit lifecycle
    ExitSignalPublished,
    ExitIntentApproved,
    ExitIntentRejected,
    ExitIntentPlaced,
    ExitIntentFilled,

    // System
    EngineStarted,
    FeedConnected,
    FeedDisconnected,
    WatchdogAlarm,
    ReadOnlyGuardSet,
    ReadOnlyGuardCleared,
    ShutdownInitiated,
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Tick => "TICK",
            EventType::CandleClosed => "CANDLE_CLOSED",
            EventType::SignalPublished => "SIGNAL_PUBLISHED",
            EventType::SignalExpired => "SIGNAL_EXPIRED",
            EventType::SignalDeliveryCreated => "SIGNAL_DELIVERY_CREATED",
            EventType::IntentApproved => "INTENT_APPROVED",
            EventType::IntentRejected => "INTENT_REJECTED",
            EventType::TradeCreated => "TRADE_CREATED",
            EventType::TradeUpdated => "TRADE_UPDATED",
            EventType::TradeClosed => "TRADE_CLOSED",
            EventType::OrderPlaced => "ORDER_PLACED",
            EventType::OrderFilled => "ORDER_FILLED",
            EventType::OrderRejected => "ORDER_REJECTED",
            EventType::OrderTimeout => "ORDER_TIMEOUT",
            EventType::ExitSignalPublished => "EXIT_SIGNAL_PUBLISHED",
            EventType::ExitIntentApproved => "EXIT_INTENT_APPROVED",
            EventType::ExitIntentRejected => "EXIT_INTENT_REJECTED",
            EventType::ExitIntentPlaced => "EXIT_INTENT_PLACED",
            EventType::ExitIntentFilled => "EXIT_INTENT_FILLED",
            EventType::EngineStarted => "ENGINE_STARTED",
            EventType::FeedConnected => "FEED_CONNECTED",
            EventType::FeedDisconnected => "FEED_DISCONNECTED",
            EventType::WatchdogAlarm => "WATCHDOG_ALARM",
            EventType::ReadOnlyGuardSet => "READ_ONLY_GUARD_SET",
            EventType::ReadOnlyGuardCleared => "READ_ONLY_GUARD_CLEARED",
            EventType::ShutdownInitiated => "SHUTDOWN_INITIATED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    Tick {
        symbol: String,
        last_price: f64,
        last_qty: i64,
        exchange_timestamp: Option<DateTime<Utc>>,
    },
    CandleClosed {
        candle: Candle,
    },
    SignalPublished {
        symbol: String,
        direction: Direction,
        confluence: ConfluenceType,
        strength: StrengthBucket,
        effective_floor: f64,
        effective_ceiling: f64,
        ref_price: f64,
        p_win: f64,
        kelly: f64,
        expires_at: DateTime<Utc>,
    },
    SignalExpired {
        symbol: String,
        reason: String,
    },
    SignalDeliveryCreated {
        delivery_id: String,
        symbol: String,
    },
    IntentApproved {
        symbol: String,
        qty: i64,
        order_type: OrderType,
        limit_price: Option<f64>,
    },
    IntentRejected {
        symbol: String,
        reasons: Vec<String>,
    },
    TradeCreated {
        symbol: String,
        direction: Direction,
        status: TradeStatus,
        trade_number: i64,
        qty: i64,
    },
    TradeUpdated {
        symbol: String,
        status: TradeStatus,
        entry_price: Option<f64>,
    },
    TradeClosed {
        symbol: String,
        exit_price: f64,
        exit_reason: ExitReason,
        realized_pnl: f64,
        realized_log_return: f64,
    },
    OrderPlaced {
        symbol: String,
        client_order_id: String,
        qty: i64,
    },
    OrderFilled {
        symbol: String,
        avg_price: f64,
        filled_qty: i64,
    },
    OrderRejected {
        symbol: String,
        code: String,
        message: String,
    },
    OrderTimeout {
        symbol: String,
        pending_minutes: i64,
    },
    ExitSignalPublished {
        reason: ExitReason,
        episode_id: i64,
        price: f64,
    },
    ExitIntentApproved {
        reason: ExitReason,
        order_type: OrderType,
        limit_price: Option<f64>,
    },
    ExitIntentRejected {
        reason: ExitReason,
        codes: Vec<String>,
    },
    ExitIntentPlaced {
        reason: ExitReason,
        client_order_id: String,
    },
    ExitIntentFilled {
        reason: ExitReason,
        avg_price: f64,
    },
    EngineStarted {
        release: String,
        symbols: Vec<String>,
    },
    FeedConnected {
        url: String,
    },
    FeedDisconnected {
        reason: String,
        reconnect_attempt: u32,
    },
    WatchdogAlarm {
        check: String,
        detail: String,
    },
    ReadOnlyGuard {
        reason: String,
    },
    ShutdownInitiated {
        reason: String,
    },
    CandleLiveness {
        symbol: String,
        timeframe: Timeframe,
    },
}

/// Event log row. `seq` is assigned by the store on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: Option<i64>,
    pub event_type: EventType,
    pub scope: EventScope,
    pub user_id: Option<String>,
    pub user_broker_id: Option<String>,
    pub signal_id: Option<String>,
    pub intent_id: Option<String>,
    pub trade_id: Option<String>,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn global(event_type: EventType, payload: EventPayload) -> Self {
        Event {
            seq: None,
            event_type,
            scope: EventScope::Global,
            user_id: None,
            user_broker_id: None,
            signal_id: None,
            intent_id: None,
            trade_id: None,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn for_user(event_type: EventType, user_id: &str, payload: EventPayload) -> Self {
        Event {
            scope: EventScope::User,
            user_id: Some(user_id.to_string()),
            ..Event::global(event_type, payload)
        }
    }

    pub fn for_user_broker(
        event_type: EventType,
        user_id: &str,
        user_broker_id: &str,
        payload: EventPayload,
    ) -> Self {
        Event {
            scope: EventScope::UserBroker,
            user_id: Some(user_id.to_string()),
            user_broker_id: Some(user_broker_id.to_string()),
            ..Event::global(event_type, payload)
        }
    }

    pub fn with_signal(mut self, signal_id: &str) -> Self {
        self.signal_id = Some(signal_id.to_string());
        self
    }

    pub fn with_intent(mut self, intent_id: &str) -> Self {
        self.intent_id = Some(intent_id.to_string());
        self
    }

    pub fn with_trade(mut self, trade_id: &str) -> Self {
        self.trade_id = Some(trade_id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for t in [
            EventType::Tick,
            EventType::CandleClosed,
            EventType::SignalPublished,
            EventType::ExitIntentFilled,
            EventType::WatchdogAlarm,
        ] {
            assert_eq!(EventType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_scope_builders() {
        let e = Event::for_user_broker(
            EventType::IntentApproved,
            "u1",
            "ub1",
            EventPayload::IntentApproved {
                symbol: "NSE:X".to_string(),
                qty: 4,
                order_type: OrderType::Limit,
                limit_price: Some(2450.0),
            },
        )
        .with_signal("sig1")
        .with_intent("i1");

        assert_eq!(e.scope, EventScope::UserBroker);
        assert_eq!(e.user_id.as_deref(), Some("u1"));
        assert_eq!(e.user_broker_id.as_deref(), Some("ub1"));
        assert_eq!(e.signal_id.as_deref(), Some("sig1"));
        assert!(e.seq.is_none());
    }
}
