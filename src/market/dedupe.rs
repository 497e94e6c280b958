/// Two-window tick deduplication.
/// Membership is a pair of hash sets each covering one window; at a window
/// boundary the previous set is discarded and the current one takes its
/// place, so memory stays bounded by two windows of traffic.
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::types::Tick;

pub struct TickDeduper {
    window_seconds: i64,
    window_start: i64,
    current: HashSet<u64>,
    previous: HashSet<u64>,
    dropped: u64,
    fallback_keys: u64,
}

impl TickDeduper {
    pub fn new(window_seconds: i64) -> Self {
        TickDeduper {
            window_seconds,
            window_start: 0,
            current: HashSet::new(),
            previous: HashSet::new(),
            dropped: 0,
            fallback_keys: 0,
        }
    }

    /// Returns true when the tick is fresh; duplicates are counted and dropped
    pub fn observe(&mut self, tick: &Tick) -> bool {
        let now_sec = tick.received_at.timestamp();
        self.rotate(now_sec);

        let key = self.key_for(tick);
        if self.current.contains(&key) || self.previous.contains(&key) {
            self.dropped += 1;
            return false;
        }
        self.current.insert(key);
        true
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn fallback_keys(&self) -> u64 {
        self.fallback_keys
    }

    fn rotate(&mut self, now_sec: i64) {
        if self.window_start == 0 {
            self.window_start = now_sec;
            return;
        }
        let elapsed = now_sec - self.window_start;
        if elapsed >= 2 * self.window_seconds {
            // Long gap: both windows are stale
            self.previous.clear();
            self.current.clear();
            self.window_start = now_sec;
        } else if elapsed >= self.window_seconds {
            self.previous = std::mem::take(&mut self.current);
            self.window_start += self.window_seconds;
        }
    }

    fn key_for(&mut self, tick: &Tick) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        tick.symbol.hash(&mut hasher);
        match tick.exchange_timestamp {
            Some(ts) => ts.timestamp_millis().hash(&mut hasher),
            None => {
                // Exchange timestamp missing: fall back to the system second
                self.fallback_keys += 1;
                tick.received_at.timestamp().hash(&mut hasher);
            }
        }
        tick.last_price.to_bits().hash(&mut hasher);
        tick.last_qty.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn tick(millis_offset: i64, price: f64, with_exchange_ts: bool) -> Tick {
        tick_late(millis_offset, millis_offset, price, with_exchange_ts)
    }

    /// Same exchange timestamp can arrive again later over the wire
    fn tick_late(exch_millis: i64, recv_millis: i64, price: f64, with_exchange_ts: bool) -> Tick {
        let base = Utc.with_ymd_and_hms(2024, 10, 1, 4, 0, 0).unwrap();
        Tick {
            symbol: "NSE:X".to_string(),
            last_price: price,
            last_qty: 10,
            exchange_timestamp: with_exchange_ts.then_some(base + Duration::milliseconds(exch_millis)),
            received_at: base + Duration::milliseconds(recv_millis),
        }
    }

    #[test]
    fn test_duplicate_dropped_once() {
        let mut d = TickDeduper::new(60);
        assert!(d.observe(&tick(0, 100.0, true)));
        assert!(!d.observe(&tick(0, 100.0, true)));
        assert_eq!(d.dropped(), 1);
        // Different price is a different key
        assert!(d.observe(&tick(0, 100.05, true)));
    }

    #[test]
    fn test_fallback_key_counted() {
        let mut d = TickDeduper::new(60);
        assert!(d.observe(&tick(0, 100.0, false)));
        assert!(!d.observe(&tick(500, 100.0, false))); // same system second
        assert_eq!(d.fallback_keys(), 2);
        assert_eq!(d.dropped(), 1);
    }

    #[test]
    fn test_duplicate_survives_one_rotation() {
        let mut d = TickDeduper::new(60);
        assert!(d.observe(&tick(0, 100.0, true)));
        // Redelivered 70s later: window rotated to previous, key still held
        assert!(!d.observe(&tick_late(0, 70_000, 100.0, true)));
    }

    #[test]
    fn test_key_expires_after_two_windows() {
        let mut d = TickDeduper::new(60);
        assert!(d.observe(&tick(0, 100.0, true)));
        // 130s later both windows have been discarded
        assert!(d.observe(&tick_late(0, 130_000, 100.0, true)));
    }
}
