/// Entry qualification: operational gates layered around the position
/// sizer. Checks run in order; the earliest failure names the rejection but
/// every failure is recorded on the intent.
use std::sync::Arc;

use chrono::{Datelike, Duration, Utc};
use tracing::{debug, info};

use crate::analysis::calculate_atr;
use crate::config::{SizingConfig, StrategyConfig};
use crate::error::Result;
use crate::market::CandleStore;
use crate::sizing::{OpenPosition, PositionSizer, SizerInputs};
use crate::store::Store;
use crate::time::SessionClock;
use crate::types::{OrderType, Signal, Timeframe, Trade, TradeIntent, UserBroker};
use crate::utils::generate_idempotency_key;

/// Runtime connectivity view of one user-broker
#[derive(Debug, Clone, Copy)]
pub struct BrokerState {
    pub connected: bool,
    pub paused: bool,
}

pub struct ValidationService {
    store: Store,
    candle_store: Arc<CandleStore>,
    sizer: PositionSizer,
    strategy_cfg: StrategyConfig,
    sizing_cfg: SizingConfig,
    clock: Arc<SessionClock>,
}

impl ValidationService {
    pub fn new(
        store: Store,
        candle_store: Arc<CandleStore>,
        strategy_cfg: StrategyConfig,
        sizing_cfg: SizingConfig,
        clock: Arc<SessionClock>,
    ) -> Self {
        ValidationService {
            store,
            candle_store,
            sizer: PositionSizer::new(sizing_cfg.clone()),
            strategy_cfg,
            sizing_cfg,
            clock,
        }
    }

    /// Deterministic intent id for one (signal, user-broker) pair; the same
    /// delivery always qualifies to the same idempotency key.
    pub fn intent_id_for(signal_id: &str, user_broker_id: &str) -> String {
        generate_idempotency_key(&[signal_id, user_broker_id])
    }

    /// Qualify one delivery. Persists and returns the APPROVED or REJECTED
    /// intent; an existing intent for the pair short-circuits idempotently.
    pub async fn qualify(
        &self,
        signal: &Signal,
        user_broker: &UserBroker,
        state: BrokerState,
    ) -> Result<TradeIntent> {
        let intent_id = Self::intent_id_for(&signal.signal_id, &user_broker.user_broker_id);
        if let Some(existing) = self.store.get_intent(&intent_id)? {
            debug!("Intent {} already persisted; returning as-is", intent_id);
            return Ok(existing);
        }

        let mut failures: Vec<String> = Vec::new();
        let now = Utc::now();

        // Gate 1: endpoint operational
        if !user_broker.enabled {
            failures.push("BROKER_DISABLED".to_string());
        }
        if !state.connected {
            failures.push("BROKER_DISCONNECTED".to_string());
        }
        if state.paused {
            failures.push("PORTFOLIO_PAUSED".to_string());
        }

        // Gate 2: symbol whitelisted for this broker
        if !user_broker.watchlist.iter().any(|s| s == &signal.symbol) {
            failures.push("SYMBOL_NOT_WHITELISTED".to_string());
        }

        // Gate 3: confluence floor
        if signal.confluence < self.strategy_cfg.min_confluence_type {
            failures.push("CONFLUENCE_BELOW_MINIMUM".to_string());
        }

        // Gate 4/5: edge floors
        if signal.p_win < self.strategy_cfg.min_win_prob {
            failures.push("WIN_PROB_BELOW_MINIMUM".to_string());
        }
        if signal.kelly < self.strategy_cfg.min_kelly {
            failures.push("KELLY_BELOW_MINIMUM".to_string());
        }

        // Portfolio context feeds the sizer and the later gates
        let open_trades = self.store.open_trades_for_user_broker(&user_broker.user_broker_id)?;
        let view = self.portfolio_view(user_broker, &open_trades, &signal.symbol)?;
        let (atr, last_range) = self.sizing_candles(&signal.symbol).await?;

        let sizer_inputs = SizerInputs {
            direction: signal.direction,
            entry_price: signal.ref_price,
            stop_price: signal.effective_floor,
            strength: signal.strength,
            kelly: signal.kelly,
            p_fill: fill_probability(signal),
            cash: view.cash,
            reserved_capital: view.reserved,
            positions_on_symbol: open_trades
                .iter()
                .filter(|t| t.symbol == signal.symbol)
                .filter_map(|t| t.entry_price.map(|p| OpenPosition { entry_price: p, qty: t.entry_qty }))
                .collect(),
            r_portfolio: view.r_portfolio,
            r_symbol: view.r_symbol,
            atr,
            last_range,
        };
        let sized = self.sizer.size_rebuy(&sizer_inputs);

        // Gate 6: sizer accepted
        if sized.rejected {
            failures.push(format!(
                "SIZER_REJECTED:{}",
                sized.reason.clone().unwrap_or_else(|| sized.constraint_binding.clone())
            ));
        }

        // Gate 7/8: quantity and value bounds
        let value = sized.qty as f64 * signal.ref_price;
        if sized.qty < 1 {
            failures.push("QTY_BELOW_ONE".to_string());
        }
        if user_broker.min_trade_value > 0.0 && value < user_broker.min_trade_value {
            failures.push("VALUE_BELOW_MINIMUM".to_string());
        }
        if value > user_broker.max_per_trade {
            failures.push("VALUE_ABOVE_MAX_PER_TRADE".to_string());
        }

        // Gate 9: exposure and log-loss headroom
        if view.reserved + value > user_broker.max_exposure {
            failures.push("EXPOSURE_EXCEEDED".to_string());
        }
        if view.r_portfolio >= self.sizing_cfg.portfolio_budget
            || view.r_symbol >= self.sizing_cfg.symbol_budget
        {
            failures.push("LOG_LOSS_BUDGET_EXCEEDED".to_string());
        }

        // Gate 10: open-trade count
        if view.open_count >= user_broker.max_open_trades {
            failures.push("MAX_OPEN_TRADES".to_string());
        }

        // Gate 11: daily/weekly loss limits
        let day_start = self.clock.session_bounds(now).0;
        let daily = self.store.realized_pnl_since(&user_broker.user_broker_id, day_start)?;
        if daily <= -user_broker.max_daily_loss {
            failures.push("DAILY_LOSS_LIMIT".to_string());
        }
        let week_start = day_start
            - Duration::days(self.clock.local_date(now).weekday().num_days_from_monday() as i64);
        let weekly = self.store.realized_pnl_since(&user_broker.user_broker_id, week_start)?;
        if weekly <= -user_broker.max_weekly_loss {
            failures.push("WEEKLY_LOSS_LIMIT".to_string());
        }

        // Gate 12: post-loss cooldown
        if user_broker.cooldown_minutes > 0 {
            if let Some(last_loss) = self.store.last_losing_close(&user_broker.user_broker_id)? {
                if now - last_loss < Duration::minutes(user_broker.cooldown_minutes) {
                    failures.push("COOLDOWN_ACTIVE".to_string());
                }
            }
        }

        let passed = failures.is_empty();
        let intent = TradeIntent {
            intent_id: intent_id.clone(),
            signal_id: signal.signal_id.clone(),
            user_broker_id: user_broker.user_broker_id.clone(),
            validation_passed: passed,
            approved_qty: if passed { sized.qty } else { 0 },
            order_type: OrderType::Limit,
            limit_price: Some(signal.ref_price),
            product_type: "INTRADAY".to_string(),
            rejection_reasons: failures,
            created_at: now,
        };
        self.store.insert_intent(&intent)?;

        if intent.validation_passed {
            info!(
                "Intent {} APPROVED: {} x{} @ {:.2} (binding {})",
                intent.intent_id, signal.symbol, intent.approved_qty, signal.ref_price, sized.constraint_binding
            );
        } else {
            info!(
                "Intent {} REJECTED: {} [{}]",
                intent.intent_id,
                signal.symbol,
                intent.rejection_reasons.join(", ")
            );
        }
        Ok(intent)
    }

    /// Persist a REJECTED intent for a validation that never completed
    pub fn reject_with_code(&self, signal: &Signal, user_broker_id: &str, code: &str) -> Result<TradeIntent> {
        let intent = TradeIntent {
            intent_id: Self::intent_id_for(&signal.signal_id, user_broker_id),
            signal_id: signal.signal_id.clone(),
            user_broker_id: user_broker_id.to_string(),
            validation_passed: false,
            approved_qty: 0,
            order_type: OrderType::Limit,
            limit_price: Some(signal.ref_price),
            product_type: "INTRADAY".to_string(),
            rejection_reasons: vec![code.to_string()],
            created_at: Utc::now(),
        };
        self.store.insert_intent(&intent)?;
        Ok(intent)
    }

    fn portfolio_view(
        &self,
        user_broker: &UserBroker,
        open_trades: &[Trade],
        symbol: &str,
    ) -> Result<PortfolioView> {
        let reserved: f64 = open_trades.iter().filter_map(|t| t.entry_value).sum();
        let realized = self.store.realized_pnl_total(&user_broker.user_broker_id)?;
        let r_portfolio: f64 = open_trades
            .iter()
            .filter_map(|t| t.stop_log_return())
            .map(f64::abs)
            .sum();
        let r_symbol: f64 = open_trades
            .iter()
            .filter(|t| t.symbol == symbol)
            .filter_map(|t| t.stop_log_return())
            .map(f64::abs)
            .sum();
        let open_count = self
            .store
            .count_open_trades_for_user_broker(&user_broker.user_broker_id)?;
        Ok(PortfolioView {
            cash: user_broker.capital + realized - reserved,
            reserved,
            r_portfolio,
            r_symbol,
            open_count,
        })
    }

    async fn sizing_candles(&self, symbol: &str) -> Result<(Option<f64>, f64)> {
        let candles = self
            .candle_store
            .recent(symbol, Timeframe::M25, self.sizing_cfg.atr_period + 1)
            .await?;
        let atr = calculate_atr(&candles, self.sizing_cfg.atr_period);
        let last_range = candles.last().map(|c| c.range()).unwrap_or(0.0);
        Ok((atr, last_range))
    }
}

struct PortfolioView {
    cash: f64,
    reserved: f64,
    r_portfolio: f64,
    r_symbol: f64,
    open_count: i64,
}

/// Fill probability for a limit entry: deeper in the zone fills easier
fn fill_probability(signal: &Signal) -> f64 {
    let width = signal.effective_ceiling - signal.effective_floor;
    if width <= 0.0 {
        return 1.0;
    }
    ((signal.effective_ceiling - signal.ref_price) / width).clamp(0.1, 1.0)
}
