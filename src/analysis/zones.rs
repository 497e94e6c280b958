/// Zone computation and confluence classification across HTF/ITF/LTF.
/// HTF = 125m, ITF = 25m, LTF = 1m candle windows.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::analysis::utility_gate::UtilityGate;
use crate::config::StrategyConfig;
use crate::error::Result;
use crate::market::CandleStore;
use crate::time::SessionClock;
use crate::types::{
    round2, Candle, ConfluenceType, Direction, SignalCandidate, StrengthBucket, Timeframe, Zone,
};

pub struct ZoneAnalyzer {
    cfg: StrategyConfig,
    candle_store: Arc<CandleStore>,
    clock: Arc<SessionClock>,
    gate: UtilityGate,
}

impl ZoneAnalyzer {
    pub fn new(cfg: StrategyConfig, candle_store: Arc<CandleStore>, clock: Arc<SessionClock>) -> Self {
        let gate = UtilityGate::new(cfg.utility_alpha, cfg.utility_beta, cfg.advantage_ratio);
        ZoneAnalyzer {
            cfg,
            candle_store,
            clock,
            gate,
        }
    }

    /// Evaluate the symbol at `price`; None when no emittable candidate.
    pub async fn evaluate(
        &self,
        symbol: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<SignalCandidate>> {
        let htf = match self.zone_for(symbol, Timeframe::M125, self.cfg.htf_window).await? {
            Some(z) => z,
            None => return Ok(None),
        };
        let itf = match self.zone_for(symbol, Timeframe::M25, self.cfg.itf_window).await? {
            Some(z) => z,
            None => return Ok(None),
        };
        let ltf = match self.zone_for(symbol, Timeframe::M1, self.cfg.ltf_window).await? {
            Some(z) => z,
            None => return Ok(None),
        };

        let confluence = classify(
            htf.in_buy_zone(price),
            itf.in_buy_zone(price),
            ltf.in_buy_zone(price),
        );
        if confluence == ConfluenceType::None {
            return Ok(None);
        }

        let effective_floor = round2(htf.floor.max(itf.floor).max(ltf.floor));
        let effective_ceiling = round2(htf.ceiling.min(itf.ceiling).min(ltf.ceiling));
        if effective_floor >= effective_ceiling {
            debug!(
                "{}: effective zone inverted ({:.2} >= {:.2}), no signal",
                symbol, effective_floor, effective_ceiling
            );
            return Ok(None);
        }

        let gate = self
            .gate
            .evaluate(Direction::Buy, price, effective_floor, effective_ceiling);
        if !gate.passed {
            debug!("{}: utility asymmetry failed (pi={:.5} ell={:.5})", symbol, gate.pi, gate.ell);
            return Ok(None);
        }

        let score = composite_score(confluence, price, effective_floor, effective_ceiling);
        let strength = bucket_for(score, &self.cfg.strength_thresholds);
        let p_win = p_win_estimate(score);
        let payoff = gate.pi / gate.ell.abs();
        let kelly = kelly_fraction(p_win, payoff);

        let ttl = Duration::minutes(self.cfg.signal_ttl_minutes);
        let expires_at = (now + ttl).min(self.clock.eod(now));

        Ok(Some(SignalCandidate {
            symbol: symbol.to_string(),
            direction: Direction::Buy,
            confluence,
            score,
            strength,
            htf,
            itf,
            ltf,
            effective_floor,
            effective_ceiling,
            ref_price: price,
            p_win,
            kelly,
            generated_at: now,
            expires_at,
        }))
    }

    /// Current zone for one timeframe: min low / max high over the most
    /// recent completed window. None until the window is full.
    async fn zone_for(&self, symbol: &str, timeframe: Timeframe, window: usize) -> Result<Option<Zone>> {
        let candles = self.candle_store.recent(symbol, timeframe, window).await?;
        if candles.len() < window {
            return Ok(None);
        }
        Ok(Some(zone_of(&candles)))
    }
}

pub fn zone_of(candles: &[Candle]) -> Zone {
    let floor = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let ceiling = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    Zone { floor, ceiling }
}

/// TRIPLE iff all three aligned; DOUBLE iff HTF+ITF; SINGLE iff HTF only
pub fn classify(htf: bool, itf: bool, ltf: bool) -> ConfluenceType {
    match (htf, itf, ltf) {
        (true, true, true) => ConfluenceType::Triple,
        (true, true, false) => ConfluenceType::Double,
        (true, false, _) => ConfluenceType::Single,
        _ => ConfluenceType::None,
    }
}

/// Weighted composite: alignment dominates, zone depth and zone tightness
/// refine the bucket.
pub fn composite_score(confluence: ConfluenceType, price: f64, floor: f64, ceiling: f64) -> f64 {
    let aligned = match confluence {
        ConfluenceType::None => 0.0,
        ConfluenceType::Single => 1.0 / 3.0,
        ConfluenceType::Double => 2.0 / 3.0,
        ConfluenceType::Triple => 1.0,
    };
    let width = ceiling - floor;
    let depth = if width > 0.0 {
        ((ceiling - price) / width).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let tightness = if price > 0.0 {
        (1.0 - (width / price) / 0.10).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (0.5 * aligned + 0.3 * depth + 0.2 * tightness).clamp(0.0, 1.0)
}

pub fn bucket_for(score: f64, thresholds: &crate::config::StrengthThresholds) -> StrengthBucket {
    if score >= thresholds.very_strong {
        StrengthBucket::VeryStrong
    } else if score >= thresholds.strong {
        StrengthBucket::Strong
    } else if score >= thresholds.moderate {
        StrengthBucket::Moderate
    } else {
        StrengthBucket::Weak
    }
}

/// Score-anchored win probability, kept inside sane bounds
fn p_win_estimate(score: f64) -> f64 {
    (0.45 + 0.25 * score).clamp(0.0, 0.95)
}

/// Kelly fraction for win probability p and payoff ratio b, floored at zero
fn kelly_fraction(p_win: f64, payoff: f64) -> f64 {
    if payoff <= 0.0 {
        return 0.0;
    }
    ((p_win * (payoff + 1.0) - 1.0) / payoff).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, StrengthThresholds};
    use crate::store::Store;
    use chrono::TimeZone;

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
            strength_thresholds: StrengthThresholds {
                moderate: 0.4,
                strong: 0.6,
                very_strong: 0.8,
            },
            signal_ttl_minutes: 60,
        }
    }

    fn clock() -> Arc<SessionClock> {
        Arc::new(
            SessionClock::from_config(&SessionConfig {
                timezone: "Asia/Kolkata".to_string(),
                open_time: "09:15".to_string(),
                close_time: "15:30".to_string(),
                holidays: vec![],
                candle_grace_seconds: 15,
                weekend_trading: false,
            })
            .unwrap(),
        )
    }

    fn candle(tf: Timeframe, minute: i64, low: f64, high: f64) -> Candle {
        Candle {
            symbol: "NSE:X".to_string(),
            timeframe: tf,
            start_time: Utc.with_ymd_and_hms(2024, 10, 1, 3, 45, 0).unwrap() + Duration::minutes(minute),
            open: (low + high) / 2.0,
            high,
            low,
            close: (low + high) / 2.0,
            volume: 100,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(true, true, true), ConfluenceType::Triple);
        assert_eq!(classify(true, true, false), ConfluenceType::Double);
        assert_eq!(classify(true, false, true), ConfluenceType::Single);
        assert_eq!(classify(false, true, true), ConfluenceType::None);
    }

    #[tokio::test]
    async fn test_triple_confluence_candidate() {
        let store = Arc::new(CandleStore::new(Store::open_in_memory().unwrap()));
        let analyzer = ZoneAnalyzer::new(strategy_cfg(), Arc::clone(&store), clock());

        // All three timeframes hold the price inside their zones
        store.insert(candle(Timeframe::M125, 0, 2380.0, 2520.0)).await.unwrap();
        store.insert(candle(Timeframe::M125, 125, 2385.0, 2515.0)).await.unwrap();
        store.insert(candle(Timeframe::M25, 0, 2390.0, 2510.0)).await.unwrap();
        store.insert(candle(Timeframe::M25, 25, 2395.0, 2505.0)).await.unwrap();
        store.insert(candle(Timeframe::M1, 0, 2400.0, 2495.0)).await.unwrap();
        store.insert(candle(Timeframe::M1, 1, 2405.0, 2500.0)).await.unwrap();
        store.insert(candle(Timeframe::M1, 2, 2400.0, 2490.0)).await.unwrap();

        let now = Utc.with_ymd_and_hms(2024, 10, 1, 4, 0, 0).unwrap();
        let candidate = analyzer.evaluate("NSE:X", 2450.0, now).await.unwrap().unwrap();
        assert_eq!(candidate.confluence, ConfluenceType::Triple);
        assert_eq!(candidate.effective_floor, 2400.0);
        assert_eq!(candidate.effective_ceiling, 2500.0);
        assert!(candidate.p_win > 0.5);
        assert!(candidate.kelly > 0.0);
        // Expiry never crosses the session close (15:30 IST == 10:00 UTC)
        assert!(candidate.generated_at < candidate.expires_at);
        assert!(candidate.expires_at <= Utc.with_ymd_and_hms(2024, 10, 1, 10, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_inverted_effective_zone_suppressed() {
        let store = Arc::new(CandleStore::new(Store::open_in_memory().unwrap()));
        let analyzer = ZoneAnalyzer::new(strategy_cfg(), Arc::clone(&store), clock());

        // HTF zone sits entirely above the LTF zone: max(lows) >= min(highs)
        store.insert(candle(Timeframe::M125, 0, 2480.0, 2520.0)).await.unwrap();
        store.insert(candle(Timeframe::M125, 125, 2480.0, 2520.0)).await.unwrap();
        store.insert(candle(Timeframe::M25, 0, 2430.0, 2505.0)).await.unwrap();
        store.insert(candle(Timeframe::M25, 25, 2430.0, 2505.0)).await.unwrap();
        store.insert(candle(Timeframe::M1, 0, 2400.0, 2470.0)).await.unwrap();
        store.insert(candle(Timeframe::M1, 1, 2400.0, 2470.0)).await.unwrap();
        store.insert(candle(Timeframe::M1, 2, 2400.0, 2470.0)).await.unwrap();

        let now = Utc.with_ymd_and_hms(2024, 10, 1, 4, 0, 0).unwrap();
        // 2490 is inside HTF and ITF but effective floor (2480) >= ceiling (2470)
        assert!(analyzer.evaluate("NSE:X", 2490.0, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insufficient_window_no_candidate() {
        let store = Arc::new(CandleStore::new(Store::open_in_memory().unwrap()));
        let analyzer = ZoneAnalyzer::new(strategy_cfg(), Arc::clone(&store), clock());
        store.insert(candle(Timeframe::M125, 0, 2380.0, 2520.0)).await.unwrap();
        let now = Utc.with_ymd_and_hms(2024, 10, 1, 4, 0, 0).unwrap();
        assert!(analyzer.evaluate("NSE:X", 2450.0, now).await.unwrap().is_none());
    }
}
