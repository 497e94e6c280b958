/// Position sizing: quantity is the floor of the minimum over seven
/// constraints. Any constraint with no room rejects the entry.
use tracing::debug;

use crate::config::SizingConfig;
use crate::types::{Direction, StrengthBucket};

/// Existing open position on the same symbol for the same user-broker
#[derive(Debug, Clone, Copy)]
pub struct OpenPosition {
    pub entry_price: f64,
    pub qty: i64,
}

#[derive(Debug, Clone)]
pub struct SizerInputs {
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub strength: StrengthBucket,
    /// Kelly fraction carried on the signal
    pub kelly: f64,
    /// Fill probability estimate for the intended order type
    pub p_fill: f64,
    pub cash: f64,
    pub reserved_capital: f64,
    pub positions_on_symbol: Vec<OpenPosition>,
    /// Current portfolio log-loss, positive magnitude
    pub r_portfolio: f64,
    /// Current symbol log-loss, positive magnitude
    pub r_symbol: f64,
    /// ATR of the sizing timeframe, when enough candles exist
    pub atr: Option<f64>,
    /// Range of the latest completed sizing candle
    pub last_range: f64,
}

#[derive(Debug, Clone)]
pub struct SizerOutcome {
    pub qty: i64,
    pub constraint_binding: String,
    pub rejected: bool,
    pub reason: Option<String>,
    /// Every constraint's admitted quantity, for the audit trail
    pub constraints: Vec<(String, f64)>,
}

impl SizerOutcome {
    fn reject(reason: &str, constraints: Vec<(String, f64)>) -> Self {
        SizerOutcome {
            qty: 0,
            constraint_binding: reason.to_string(),
            rejected: true,
            reason: Some(reason.to_string()),
            constraints,
        }
    }
}

pub struct PositionSizer {
    cfg: SizingConfig,
}

impl PositionSizer {
    pub fn new(cfg: SizingConfig) -> Self {
        PositionSizer { cfg }
    }

    /// First entry on a symbol (NEWBUY)
    pub fn size_entry(&self, inputs: &SizerInputs) -> SizerOutcome {
        if inputs.entry_price <= 0.0 || inputs.stop_price <= 0.0 {
            return SizerOutcome::reject("INVALID_PRICES", vec![]);
        }
        let ell_new = stop_log_return(inputs);
        if ell_new >= 0.0 {
            return SizerOutcome::reject("STOP_NOT_PROTECTIVE", vec![]);
        }

        let q_kelly = self.kelly_qty(inputs);
        let constraints = vec![
            ("LOG_SAFE".to_string(), self.log_safe_qty(inputs)),
            ("KELLY".to_string(), q_kelly),
            ("FILL_WEIGHTED".to_string(), q_kelly * inputs.p_fill.clamp(0.0, 1.0)),
            ("CASH".to_string(), (inputs.cash - inputs.reserved_capital) / inputs.entry_price),
            (
                "PORT_BUDGET".to_string(),
                budget_qty(self.cfg.portfolio_budget, inputs.r_portfolio, ell_new),
            ),
            (
                "SYM_BUDGET".to_string(),
                budget_qty(self.cfg.symbol_budget, inputs.r_symbol, ell_new),
            ),
            ("VELOCITY".to_string(), q_kelly * self.velocity(inputs)),
        ];

        let (binding, admitted) = constraints
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .cloned()
            .unwrap_or(("NONE".to_string(), 0.0));

        let qty = admitted.floor() as i64;
        debug!(
            "Sizer: binding={} admitted={:.2} qty={}",
            binding, admitted, qty
        );
        if qty < 1 {
            return SizerOutcome {
                qty: 0,
                constraint_binding: binding.clone(),
                rejected: true,
                reason: Some(format!("NO_ROOM:{}", binding)),
                constraints,
            };
        }
        SizerOutcome {
            qty,
            constraint_binding: binding,
            rejected: false,
            reason: None,
            constraints,
        }
    }

    /// Subsequent entry on a symbol (REBUY). Two structural gates run before
    /// any sizing: the new price must improve on the nearest existing entry,
    /// and the gap must clear the configured ATR spacing.
    pub fn size_rebuy(&self, inputs: &SizerInputs) -> SizerOutcome {
        let nearest = match nearest_entry(inputs) {
            Some(p) => p,
            None => return self.size_entry(inputs),
        };
        let atr = match inputs.atr {
            Some(a) if a > 0.0 => a,
            _ => return SizerOutcome::reject("REBUY_NO_ATR", vec![]),
        };

        let (improves, gap) = match inputs.direction {
            Direction::Buy => (inputs.entry_price <= nearest, nearest - inputs.entry_price),
            Direction::Sell => (inputs.entry_price >= nearest, inputs.entry_price - nearest),
        };
        if !improves {
            return SizerOutcome::reject("REBUY_PRICE_NOT_IMPROVED", vec![]);
        }
        if gap < self.cfg.reentry_spacing_atr * atr {
            return SizerOutcome::reject("REBUY_SPACING_TOO_TIGHT", vec![]);
        }
        self.size_entry(inputs)
    }

    /// Constraint 2: fractional Kelly scaled by strength and the cap
    fn kelly_qty(&self, inputs: &SizerInputs) -> f64 {
        let mult = self.strength_multiplier(inputs.strength);
        (inputs.cash * inputs.kelly.max(0.0) * self.cfg.kelly_fraction * mult * self.cfg.kelly_cap)
            / inputs.entry_price
    }

    fn strength_multiplier(&self, strength: StrengthBucket) -> f64 {
        let m = &self.cfg.strength_multipliers;
        match strength {
            StrengthBucket::Weak => m.weak,
            StrengthBucket::Moderate => m.moderate,
            StrengthBucket::Strong => m.strong,
            StrengthBucket::VeryStrong => m.very_strong,
        }
    }

    /// Constraint 1: largest qty whose position-weighted entry still keeps
    /// the stop log-return inside the position budget. Monotone in qty, so a
    /// binary search over [0, hi] suffices.
    fn log_safe_qty(&self, inputs: &SizerInputs) -> f64 {
        let budget = self.cfg.position_budget;
        let existing_qty: i64 = inputs.positions_on_symbol.iter().map(|p| p.qty).sum();
        let existing_value: f64 = inputs
            .positions_on_symbol
            .iter()
            .map(|p| p.entry_price * p.qty as f64)
            .sum();

        let ok = |q: i64| -> bool {
            let total_qty = existing_qty + q;
            if total_qty == 0 {
                return true;
            }
            let weighted = (existing_value + inputs.entry_price * q as f64) / total_qty as f64;
            let ell = match inputs.direction {
                Direction::Buy => (inputs.stop_price / weighted).ln(),
                Direction::Sell => (weighted / inputs.stop_price).ln(),
            };
            ell >= -budget
        };

        let hi = ((inputs.cash / inputs.entry_price).ceil() as i64 + existing_qty + 1).max(1);
        if ok(hi) {
            return hi as f64;
        }
        if !ok(0) {
            return 0.0;
        }
        let (mut lo, mut hi) = (0i64, hi);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if ok(mid) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo as f64
    }

    /// Constraint 7 multiplier: V = V_base(range/ATR) * max(V_min, (1-stress)^gamma)
    fn velocity(&self, inputs: &SizerInputs) -> f64 {
        let ratio = match inputs.atr {
            Some(atr) if atr > 0.0 => inputs.last_range / atr,
            _ => 1.0,
        };
        let v_base = self
            .cfg
            .velocity_table
            .iter()
            .find(|step| ratio <= step.ratio_ceiling)
            .or_else(|| self.cfg.velocity_table.last())
            .map(|step| step.multiplier)
            .unwrap_or(1.0);

        let stress = if self.cfg.portfolio_budget > 0.0 {
            (inputs.r_portfolio / self.cfg.portfolio_budget).clamp(0.0, 1.0)
        } else {
            1.0
        };
        v_base * self.cfg.velocity_min.max((1.0 - stress).powf(self.cfg.velocity_gamma))
    }
}

/// Stop log-return of the new entry, negative when protective
fn stop_log_return(inputs: &SizerInputs) -> f64 {
    match inputs.direction {
        Direction::Buy => (inputs.stop_price / inputs.entry_price).ln(),
        Direction::Sell => (inputs.entry_price / inputs.stop_price).ln(),
    }
}

/// Constraints 5 and 6: remaining log-loss headroom over the new entry's
/// per-trade stop log-return
fn budget_qty(budget: f64, used: f64, ell_new: f64) -> f64 {
    let headroom = budget - used;
    if headroom <= 0.0 {
        return 0.0;
    }
    headroom / ell_new.abs()
}

/// Nearest existing entry to the candidate price
fn nearest_entry(inputs: &SizerInputs) -> Option<f64> {
    inputs
        .positions_on_symbol
        .iter()
        .map(|p| p.entry_price)
        .min_by(|a, b| {
            let da = (a - inputs.entry_price).abs();
            let db = (b - inputs.entry_price).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
}
