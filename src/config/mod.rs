pub mod loader;

pub use loader::load_config;

use serde::Deserialize;

use crate::types::{BrokerRole, ConfluenceType, UserBroker};

/// Release readiness level checked by the startup gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseReadiness {
    Beta,
    ProdReady,
}

/// Top-level runtime configuration, loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub session: SessionConfig,
    pub strategy: StrategyConfig,
    pub sizing: SizingConfig,
    pub exits: ExitConfig,
    pub feed: FeedConfig,
    pub store: StoreConfig,
    pub hub: HubConfig,
    #[serde(default)]
    pub user_brokers: Vec<UserBrokerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub production_mode: bool,
    pub order_execution_enabled: bool,
    pub async_event_writer_enabled: bool,
    pub persist_tick_events: bool,
    pub release_readiness: ReleaseReadiness,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_minutes: i64,
    #[serde(default = "default_broker_concurrency")]
    pub broker_call_concurrency: usize,
    #[serde(default = "default_broker_timeout")]
    pub broker_call_timeout_seconds: u64,
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_seconds: u64,
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// IANA timezone of the exchange, e.g. "Asia/Kolkata"
    pub timezone: String,
    /// "HH:MM" exchange-local
    pub open_time: String,
    /// "HH:MM" exchange-local
    pub close_time: String,
    #[serde(default)]
    pub holidays: Vec<chrono::NaiveDate>,
    #[serde(default = "default_candle_grace")]
    pub candle_grace_seconds: i64,
    /// Weekends count as trading days (24/7 venues)
    #[serde(default)]
    pub weekend_trading: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub min_confluence_type: ConfluenceType,
    pub min_win_prob: f64,
    pub min_kelly: f64,
    /// Analyzer window lengths, in completed candles per timeframe
    pub htf_window: usize,
    pub itf_window: usize,
    pub ltf_window: usize,
    /// λ in the utility-asymmetry rule
    pub advantage_ratio: f64,
    /// α exponent on the target log-return
    pub utility_alpha: f64,
    /// β exponent on the stop log-return
    pub utility_beta: f64,
    pub strength_thresholds: StrengthThresholds,
    pub signal_ttl_minutes: i64,
}

/// Composite-score cutoffs for the strength buckets
#[derive(Debug, Clone, Deserialize)]
pub struct StrengthThresholds {
    pub moderate: f64,
    pub strong: f64,
    pub very_strong: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    pub kelly_fraction: f64,
    pub kelly_cap: f64,
    pub strength_multipliers: StrengthMultipliers,
    /// Maximum tolerated portfolio log-loss (positive magnitude)
    pub portfolio_budget: f64,
    /// Maximum tolerated per-symbol log-loss (positive magnitude)
    pub symbol_budget: f64,
    /// Maximum tolerated position-weighted log-loss (positive magnitude)
    pub position_budget: f64,
    pub velocity_gamma: f64,
    pub velocity_min: f64,
    pub velocity_table: Vec<VelocityStep>,
    pub reentry_spacing_atr: f64,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrengthMultipliers {
    pub weak: f64,
    pub moderate: f64,
    pub strong: f64,
    pub very_strong: f64,
}

/// One step of the velocity lookup: applies while range/ATR ≤ ratio_ceiling
#[derive(Debug, Clone, Deserialize)]
pub struct VelocityStep {
    pub ratio_ceiling: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    #[serde(default = "default_exit_cooldown")]
    pub exit_cooldown_seconds: i64,
    pub max_hold_days: i64,
    /// Final minutes before close during which target/manual exits are blocked
    pub exit_cutoff_minutes: i64,
    /// Minimum absolute move between successive exit attempts
    pub brick_min_abs: f64,
    /// Minimum relative move between successive exit attempts
    pub brick_min_pct: f64,
    pub trailing_enabled: bool,
    /// Favorable move from entry that arms the trailing stop
    pub trailing_activation_pct: f64,
    /// Distance of the trailing stop from the extremum
    pub trailing_distance_pct: f64,
    #[serde(default = "default_exit_poll")]
    pub exit_poll_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_seconds: Vec<u64>,
    #[serde(default = "default_stale_feed")]
    pub stale_feed_seconds: i64,
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub bind_addr: String,
    pub auth_token: String,
    #[serde(default = "default_hub_batch_interval")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_hub_batch_max")]
    pub batch_max: usize,
    #[serde(default = "default_hub_queue")]
    pub queue_capacity: usize,
}

/// Which adapter implementation backs a user-broker endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Paper,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserBrokerConfig {
    pub user_broker_id: String,
    pub user_id: String,
    pub name: String,
    pub role: BrokerRole,
    pub enabled: bool,
    pub adapter: AdapterKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub credentials_handle: String,
    pub capital: f64,
    pub max_exposure: f64,
    pub max_per_trade: f64,
    #[serde(default)]
    pub min_trade_value: f64,
    pub max_open_trades: i64,
    pub max_daily_loss: f64,
    pub max_weekly_loss: f64,
    #[serde(default)]
    pub cooldown_minutes: i64,
    #[serde(default)]
    pub watchlist: Vec<String>,
}

impl UserBrokerConfig {
    pub fn to_record(&self) -> UserBroker {
        UserBroker {
            user_broker_id: self.user_broker_id.clone(),
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            role: self.role,
            enabled: self.enabled,
            credentials_handle: self.credentials_handle.clone(),
            capital: self.capital,
            max_exposure: self.max_exposure,
            max_per_trade: self.max_per_trade,
            min_trade_value: self.min_trade_value,
            max_open_trades: self.max_open_trades,
            max_daily_loss: self.max_daily_loss,
            max_weekly_loss: self.max_weekly_loss,
            cooldown_minutes: self.cooldown_minutes,
            watchlist: self.watchlist.clone(),
        }
    }
}

impl Config {
    /// Union of watchlists across enabled DATA subscribers
    pub fn shared_watchlist(&self) -> Vec<String> {
        let mut symbols: Vec<String> = Vec::new();
        for ub in self.user_brokers.iter().filter(|b| b.enabled) {
            for s in &ub.watchlist {
                if !symbols.contains(s) {
                    symbols.push(s.clone());
                }
            }
        }
        symbols
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_reconcile_interval() -> u64 {
    30
}
fn default_pending_timeout() -> i64 {
    10
}
fn default_broker_concurrency() -> usize {
    5
}
fn default_broker_timeout() -> u64 {
    10
}
fn default_validation_timeout() -> u64 {
    5
}
fn default_watchdog_interval() -> u64 {
    120
}
fn default_candle_grace() -> i64 {
    15
}
fn default_atr_period() -> usize {
    14
}
fn default_exit_cooldown() -> i64 {
    30
}
fn default_exit_poll() -> u64 {
    5
}
fn default_backoff() -> Vec<u64> {
    vec![1, 2, 5, 10, 30]
}
fn default_stale_feed() -> i64 {
    300
}
fn default_dedupe_window() -> i64 {
    60
}
fn default_hub_batch_interval() -> u64 {
    100
}
fn default_hub_batch_max() -> usize {
    2000
}
fn default_hub_queue() -> usize {
    16384
}
