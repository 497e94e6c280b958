/// Event-driven roll-up: each sealed 1-minute candle folds into the
/// containing 25m, 125m and daily partials; those seal on their own
/// session-anchored boundaries.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::market::partial::PartialCandle;
use crate::time::SessionClock;
use crate::types::{Candle, Timeframe};

const DERIVED: [Timeframe; 3] = [Timeframe::M25, Timeframe::M125, Timeframe::Daily];

pub struct TimeframeAggregator {
    symbol: String,
    clock: Arc<SessionClock>,
    partials: HashMap<Timeframe, PartialCandle>,
}

impl TimeframeAggregator {
    pub fn new(symbol: String, clock: Arc<SessionClock>) -> Self {
        TimeframeAggregator {
            symbol,
            clock,
            partials: HashMap::new(),
        }
    }

    /// Fold one sealed 1m candle; returns higher-timeframe candles sealed
    /// by the boundary crossing, in timeframe order.
    pub fn on_m1_close(&mut self, m1: &Candle) -> Vec<Candle> {
        let mut sealed = Vec::new();
        for timeframe in DERIVED {
            let period_start = self.clock.period_start(timeframe, m1.start_time);
            match self.partials.get_mut(&timeframe) {
                Some(partial) if partial.start_time != period_start => {
                    sealed.push(partial.seal(&self.symbol, timeframe));
                    *partial = PartialCandle::from_candle(m1, period_start);
                }
                Some(partial) => partial.merge_candle(m1),
                None => {
                    self.partials
                        .insert(timeframe, PartialCandle::from_candle(m1, period_start));
                }
            }
        }
        sealed
    }

    /// Boundary recovery: seal partials whose period ended more than
    /// `grace` ago even without a trailing candle.
    pub fn sweep(&mut self, now: DateTime<Utc>, grace_seconds: i64) -> Vec<Candle> {
        let mut sealed = Vec::new();
        let mut expired: Vec<Timeframe> = Vec::new();
        for (timeframe, partial) in &self.partials {
            let period_end = self.clock.period_end(*timeframe, partial.start_time);
            if now > period_end + Duration::seconds(grace_seconds) {
                sealed.push(partial.seal(&self.symbol, *timeframe));
                expired.push(*timeframe);
            }
        }
        for timeframe in expired {
            self.partials.remove(&timeframe);
        }
        sealed.sort_by_key(|c| c.timeframe.duration_minutes());
        sealed
    }

    /// Whether a partial currently covers `now` for the given timeframe
    pub fn has_current_partial(&self, timeframe: Timeframe, now: DateTime<Utc>) -> bool {
        self.partials
            .get(&timeframe)
            .map(|p| p.start_time == self.clock.period_start(timeframe, now))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use chrono::TimeZone;

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

    fn m1(minute_from_open: i64, close: f64) -> Candle {
        // Session open 09:15 IST == 03:45 UTC
        let open = Utc.with_ymd_and_hms(2024, 10, 1, 3, 45, 0).unwrap();
        Candle {
            symbol: "NSE:X".to_string(),
            timeframe: Timeframe::M1,
            start_time: open + Duration::minutes(minute_from_open),
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10,
        }
    }

    #[test]
    fn test_25m_seals_on_boundary() {
        let mut agg = TimeframeAggregator::new("NSE:X".to_string(), clock());
        for minute in 0..25 {
            let sealed = agg.on_m1_close(&m1(minute, 100.0 + minute as f64));
            assert!(sealed.is_empty(), "no seal inside the first period");
        }
        // Minute 25 crosses into the second 25m period
        let sealed = agg.on_m1_close(&m1(25, 130.0));
        assert_eq!(sealed.len(), 1);
        let candle = &sealed[0];
        assert_eq!(candle.timeframe, Timeframe::M25);
        assert_eq!(candle.open, 99.5);
        assert_eq!(candle.close, 124.0);
        assert_eq!(candle.high, 125.0);
        assert_eq!(candle.volume, 250);
    }

    #[test]
    fn test_sweep_seals_stale_partial() {
        let mut agg = TimeframeAggregator::new("NSE:X".to_string(), clock());
        agg.on_m1_close(&m1(0, 100.0));
        let open = Utc.with_ymd_and_hms(2024, 10, 1, 3, 45, 0).unwrap();

        // Well past the 25m period end plus grace; 125m and daily still open
        let sealed = agg.sweep(open + Duration::minutes(26), 15);
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].timeframe, Timeframe::M25);

        // Nothing left to sweep for that timeframe
        assert!(agg.sweep(open + Duration::minutes(27), 15).is_empty());
    }

    #[test]
    fn test_has_current_partial() {
        let mut agg = TimeframeAggregator::new("NSE:X".to_string(), clock());
        let open = Utc.with_ymd_and_hms(2024, 10, 1, 3, 45, 0).unwrap();
        assert!(!agg.has_current_partial(Timeframe::M25, open));
        agg.on_m1_close(&m1(0, 100.0));
        assert!(agg.has_current_partial(Timeframe::M25, open + Duration::minutes(5)));
        assert!(!agg.has_current_partial(Timeframe::M25, open + Duration::minutes(30)));
    }
}
