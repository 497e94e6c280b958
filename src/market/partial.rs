/// Mutable per-period accumulator; sealed into an immutable Candle at the
/// period boundary and replaced. One logical writer per symbol.
use chrono::{DateTime, Utc};

use crate::types::{Candle, Timeframe};

#[derive(Debug, Clone)]
pub struct PartialCandle {
    pub start_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub tick_count: usize,
}

impl PartialCandle {
    pub fn new(start_time: DateTime<Utc>, price: f64, qty: i64) -> Self {
        PartialCandle {
            start_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: qty,
            tick_count: 1,
        }
    }

    /// Seed a higher-timeframe partial from a sealed lower-timeframe candle
    pub fn from_candle(candle: &Candle, start_time: DateTime<Utc>) -> Self {
        PartialCandle {
            start_time,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            tick_count: 1,
        }
    }

    pub fn update_tick(&mut self, price: f64, qty: i64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += qty;
        self.tick_count += 1;
    }

    /// Fold a sealed lower-timeframe candle into this accumulator
    pub fn merge_candle(&mut self, candle: &Candle) {
        self.close = candle.close;
        self.high = self.high.max(candle.high);
        self.low = self.low.min(candle.low);
        self.volume += candle.volume;
        self.tick_count += 1;
    }

    pub fn seal(&self, symbol: &str, timeframe: Timeframe) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timeframe,
            start_time: self.start_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_updates() {
        let start = Utc::now();
        let mut p = PartialCandle::new(start, 100.0, 1000);
        p.update_tick(102.0, 500);
        assert_eq!(p.high, 102.0);
        assert_eq!(p.close, 102.0);
        p.update_tick(98.0, 300);
        assert_eq!(p.low, 98.0);
        assert_eq!(p.close, 98.0);
        assert_eq!(p.volume, 1800);

        let sealed = p.seal("NSE:X", Timeframe::M1);
        assert_eq!(sealed.open, 100.0);
        assert_eq!(sealed.start_time, start);
    }

    #[test]
    fn test_candle_merge() {
        let start = Utc::now();
        let base = Candle {
            symbol: "NSE:X".to_string(),
            timeframe: Timeframe::M1,
            start_time: start,
            open: 100.0,
            high: 101.0,
            low: 99.5,
            close: 100.5,
            volume: 10,
        };
        let mut p = PartialCandle::from_candle(&base, start);
        let next = Candle {
            high: 103.0,
            low: 100.0,
            close: 102.5,
            volume: 20,
            ..base.clone()
        };
        p.merge_candle(&next);
        assert_eq!(p.open, 100.0);
        assert_eq!(p.high, 103.0);
        assert_eq!(p.low, 99.5);
        assert_eq!(p.close, 102.5);
        assert_eq!(p.volume, 30);
    }
}
