/// Core type definitions for the trading runtime
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Live tick from the data-broker feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub last_price: f64,
    pub last_qty: i64,
    /// Exchange-supplied timestamp; absent on some feeds
    pub exchange_timestamp: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// Candle timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M25,
    M125,
    Daily,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Timeframe::M1, Timeframe::M25, Timeframe::M125, Timeframe::Daily];

    pub fn as_str(&self) -> &str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M25 => "25m",
            Timeframe::M125 => "125m",
            Timeframe::Daily => "1d",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Timeframe::M1),
            "25m" => Some(Timeframe::M25),
            "125m" => Some(Timeframe::M125),
            "1d" => Some(Timeframe::Daily),
            _ => None,
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M25 => 25,
            Timeframe::M125 => 125,
            Timeframe::Daily => 375, // full session
        }
    }
}

/// Immutable OHLCV candle, unique by (symbol, timeframe, start_time)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl Candle {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Direction::Buy),
            "SELL" => Some(Direction::Sell),
            _ => None,
        }
    }

    /// Side that closes a position opened in this direction
    pub fn closing_side(&self) -> Direction {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

/// Buy-zone alignment across HTF/ITF/LTF. Variant order defines rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfluenceType {
    None,
    Single,
    Double,
    Triple,
}

impl ConfluenceType {
    pub fn as_str(&self) -> &str {
        match self {
            ConfluenceType::None => "NONE",
            ConfluenceType::Single => "SINGLE",
            ConfluenceType::Double => "DOUBLE",
            ConfluenceType::Triple => "TRIPLE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(ConfluenceType::None),
            "SINGLE" => Some(ConfluenceType::Single),
            "DOUBLE" => Some(ConfluenceType::Double),
            "TRIPLE" => Some(ConfluenceType::Triple),
            _ => None,
        }
    }
}

/// Composite-score bucket driving the sizing multiplier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrengthBucket {
    Weak,
    Moderate,
    Strong,
    VeryStrong,
}

impl StrengthBucket {
    pub fn as_str(&self) -> &str {
        match self {
            StrengthBucket::Weak => "WEAK",
            StrengthBucket::Moderate => "MODERATE",
            StrengthBucket::Strong => "STRONG",
            StrengthBucket::VeryStrong => "VERY_STRONG",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WEAK" => Some(StrengthBucket::Weak),
            "MODERATE" => Some(StrengthBucket::Moderate),
            "STRONG" => Some(StrengthBucket::Strong),
            "VERY_STRONG" => Some(StrengthBucket::VeryStrong),
            _ => None,
        }
    }
}

/// Per-timeframe buy zone
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Zone {
    pub floor: f64,
    pub ceiling: f64,
}

impl Zone {
    pub fn in_buy_zone(&self, price: f64) -> bool {
        self.floor <= price && price <= self.ceiling
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Published,
    Expired,
    Invalidated,
}

impl SignalStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SignalStatus::Published => "PUBLISHED",
            SignalStatus::Expired => "EXPIRED",
            SignalStatus::Invalidated => "INVALIDATED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PUBLISHED" => Some(SignalStatus::Published),
            "EXPIRED" => Some(SignalStatus::Expired),
            "INVALIDATED" => Some(SignalStatus::Invalidated),
            _ => None,
        }
    }
}

/// Symbol-scope entry signal from confluence detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub confluence: ConfluenceType,
    pub score: f64,
    pub strength: StrengthBucket,
    pub htf_low: f64,
    pub htf_high: f64,
    pub itf_low: f64,
    pub itf_high: f64,
    pub ltf_low: f64,
    pub ltf_high: f64,
    /// max of the three lows, stored at two decimals
    pub effective_floor: f64,
    /// min of the three highs, stored at two decimals
    pub effective_ceiling: f64,
    pub ref_price: f64,
    pub p_win: f64,
    pub kelly: f64,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: SignalStatus,
    pub signal_day: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Processed,
    Rejected,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Processed => "PROCESSED",
            DeliveryStatus::Rejected => "REJECTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DeliveryStatus::Pending),
            "PROCESSED" => Some(DeliveryStatus::Processed),
            "REJECTED" => Some(DeliveryStatus::Rejected),
            _ => None,
        }
    }
}

/// Per-(signal, user-broker) fan-out record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDelivery {
    pub delivery_id: String,
    pub signal_id: String,
    pub user_broker_id: String,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            _ => None,
        }
    }
}

/// Qualification outcome for one delivery; intent_id doubles as the
/// client order id and the downstream idempotency key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub intent_id: String,
    pub signal_id: String,
    pub user_broker_id: String,
    pub validation_passed: bool,
    pub approved_qty: i64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub product_type: String,
    pub rejection_reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Created,
    Pending,
    Open,
    Exiting,
    Closed,
    Rejected,
    Cancelled,
    Timeout,
}

impl TradeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TradeStatus::Created => "CREATED",
            TradeStatus::Pending => "PENDING",
            TradeStatus::Open => "OPEN",
            TradeStatus::Exiting => "EXITING",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::Rejected => "REJECTED",
            TradeStatus::Cancelled => "CANCELLED",
            TradeStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(TradeStatus::Created),
            "PENDING" => Some(TradeStatus::Pending),
            "OPEN" => Some(TradeStatus::Open),
            "EXITING" => Some(TradeStatus::Exiting),
            "CLOSED" => Some(TradeStatus::Closed),
            "REJECTED" => Some(TradeStatus::Rejected),
            "CANCELLED" => Some(TradeStatus::Cancelled),
            "TIMEOUT" => Some(TradeStatus::Timeout),
            _ => None,
        }
    }

    /// Terminal states absorb further writes
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Closed | TradeStatus::Rejected | TradeStatus::Cancelled | TradeStatus::Timeout
        )
    }
}

/// Lifecycle object from order placement to closure with P&L.
/// Written exclusively by the trade manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub intent_id: String,
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub user_id: String,
    pub user_broker_id: String,
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    /// 1 = NEWBUY, >1 = REBUY
    pub trade_number: i64,
    pub status: TradeStatus,
    pub entry_price: Option<f64>,
    pub entry_qty: i64,
    pub entry_value: Option<f64>,
    pub entry_timestamp: Option<DateTime<Utc>>,
    pub exit_target_price: f64,
    pub exit_stop_price: f64,
    pub trailing_active: bool,
    pub trailing_extremum: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_timestamp: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
    pub realized_log_return: Option<f64>,
    pub last_broker_update_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency version; bumped on every write
    pub row_version: i64,
}

impl Trade {
    /// Per-trade stop log-return ln(stop/entry), negative for a viable long
    pub fn stop_log_return(&self) -> Option<f64> {
        let entry = self.entry_price?;
        if entry <= 0.0 || self.exit_stop_price <= 0.0 {
            return None;
        }
        let raw = (self.exit_stop_price / entry).ln();
        Some(match self.direction {
            Direction::Buy => raw,
            Direction::Sell => -raw,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TargetHit,
    StopLoss,
    TimeBased,
    TrailingStop,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &str {
        match self {
            ExitReason::TargetHit => "TARGET_HIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TimeBased => "TIME_BASED",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::Manual => "MANUAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TARGET_HIT" => Some(ExitReason::TargetHit),
            "STOP_LOSS" => Some(ExitReason::StopLoss),
            "TIME_BASED" => Some(ExitReason::TimeBased),
            "TRAILING_STOP" => Some(ExitReason::TrailingStop),
            "MANUAL" => Some(ExitReason::Manual),
            _ => None,
        }
    }
}

/// Per-trade detection fact; unique by (trade_id, reason, episode_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSignal {
    pub exit_signal_id: String,
    pub trade_id: String,
    pub reason: ExitReason,
    pub episode_id: i64,
    pub price: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitIntentStatus {
    Pending,
    Approved,
    Rejected,
    Placed,
    Filled,
    Failed,
}

impl ExitIntentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ExitIntentStatus::Pending => "PENDING",
            ExitIntentStatus::Approved => "APPROVED",
            ExitIntentStatus::Rejected => "REJECTED",
            ExitIntentStatus::Placed => "PLACED",
            ExitIntentStatus::Filled => "FILLED",
            ExitIntentStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ExitIntentStatus::Pending),
            "APPROVED" => Some(ExitIntentStatus::Approved),
            "REJECTED" => Some(ExitIntentStatus::Rejected),
            "PLACED" => Some(ExitIntentStatus::Placed),
            "FILLED" => Some(ExitIntentStatus::Filled),
            "FAILED" => Some(ExitIntentStatus::Failed),
            _ => None,
        }
    }

    /// A live intent blocks further exit intents for the same trade
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ExitIntentStatus::Pending
                | ExitIntentStatus::Approved
                | ExitIntentStatus::Placed
                | ExitIntentStatus::Filled
        )
    }
}

/// Per-exit-signal qualification and execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitIntent {
    pub exit_intent_id: String,
    pub exit_signal_id: String,
    pub trade_id: String,
    pub user_broker_id: String,
    pub reason: ExitReason,
    pub episode_id: i64,
    pub status: ExitIntentStatus,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub rejection_reasons: Vec<String>,
    pub placed_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerRole {
    Data,
    Exec,
}

impl BrokerRole {
    pub fn as_str(&self) -> &str {
        match self {
            BrokerRole::Data => "DATA",
            BrokerRole::Exec => "EXEC",
        }
    }
}

/// Execution endpoint record with per-broker risk caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBroker {
    pub user_broker_id: String,
    pub user_id: String,
    pub name: String,
    pub role: BrokerRole,
    pub enabled: bool,
    /// Opaque handle; token acquisition happens outside the core
    pub credentials_handle: String,
    pub capital: f64,
    pub max_exposure: f64,
    pub max_per_trade: f64,
    pub min_trade_value: f64,
    pub max_open_trades: i64,
    pub max_daily_loss: f64,
    pub max_weekly_loss: f64,
    pub cooldown_minutes: i64,
    pub watchlist: Vec<String>,
}

/// Candidate produced by the analyzer, before signal-store dedupe
#[derive(Debug, Clone)]
pub struct SignalCandidate {
    pub symbol: String,
    pub direction: Direction,
    pub confluence: ConfluenceType,
    pub score: f64,
    pub strength: StrengthBucket,
    pub htf: Zone,
    pub itf: Zone,
    pub ltf: Zone,
    pub effective_floor: f64,
    pub effective_ceiling: f64,
    pub ref_price: f64,
    pub p_win: f64,
    pub kelly: f64,
    pub generated_at: DateTime<Utc>,
    /// TTL expiry clamped to the session close
    pub expires_at: DateTime<Utc>,
}

/// Candidate produced by the exit detector, before episode allocation
#[derive(Debug, Clone)]
pub struct ExitCandidate {
    pub trade_id: String,
    pub reason: ExitReason,
    pub price: f64,
    pub detected_at: DateTime<Utc>,
}

/// Round half-away-from-zero to two decimals (storage boundary for money)
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
