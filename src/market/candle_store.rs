/// Hybrid candle storage - ring buffer (memory) + durable rows (sqlite).
/// Optimized for O(1) append and fast analyzer-window reads.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::store::Store;
use crate::types::{Candle, Timeframe};

/// Ring length per timeframe, sized for the analyzer windows
fn ring_capacity(timeframe: Timeframe) -> usize {
    match timeframe {
        Timeframe::M1 => 512,
        Timeframe::M25 => 128,
        Timeframe::M125 => 64,
        Timeframe::Daily => 32,
    }
}

pub struct CandleStore {
    store: Store,
    rings: Arc<RwLock<HashMap<(String, Timeframe), VecDeque<Candle>>>>,
}

impl CandleStore {
    pub fn new(store: Store) -> Self {
        CandleStore {
            store,
            rings: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Persist a sealed candle and mirror it into the memory ring.
    /// A repeated close for the same (symbol, timeframe, start) collapses
    /// to an upsert in both tiers.
    pub async fn insert(&self, candle: Candle) -> Result<()> {
        self.store.upsert_candle(&candle)?;

        let mut rings = self.rings.write().await;
        let ring = rings
            .entry((candle.symbol.clone(), candle.timeframe))
            .or_insert_with(|| VecDeque::with_capacity(ring_capacity(candle.timeframe)));

        if let Some(last) = ring.back_mut() {
            if last.start_time == candle.start_time {
                *last = candle;
                return Ok(());
            }
        }
        if ring.len() >= ring_capacity(candle.timeframe) {
            ring.pop_front();
        }
        ring.push_back(candle);
        Ok(())
    }

    /// Most recent `n` candles, ascending. Memory first; the durable tier
    /// only answers when the ring cannot.
    pub async fn recent(&self, symbol: &str, timeframe: Timeframe, n: usize) -> Result<Vec<Candle>> {
        {
            let rings = self.rings.read().await;
            if let Some(ring) = rings.get(&(symbol.to_string(), timeframe)) {
                if ring.len() >= n {
                    return Ok(ring.iter().rev().take(n).rev().cloned().collect());
                }
            }
        }
        self.store.recent_candles(symbol, timeframe, n)
    }

    pub async fn latest(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Candle>> {
        {
            let rings = self.rings.read().await;
            if let Some(ring) = rings.get(&(symbol.to_string(), timeframe)) {
                if let Some(last) = ring.back() {
                    return Ok(Some(last.clone()));
                }
            }
        }
        Ok(self.store.recent_candles(symbol, timeframe, 1)?.pop())
    }

    /// Warm the rings from the durable tier on startup
    pub async fn warm_up(&self, symbols: &[String]) -> Result<()> {
        let mut rings = self.rings.write().await;
        for symbol in symbols {
            for timeframe in Timeframe::ALL {
                let candles = self.store.recent_candles(symbol, timeframe, ring_capacity(timeframe))?;
                if candles.is_empty() {
                    continue;
                }
                debug!(
                    "Warmed {} {} candles for {}",
                    candles.len(),
                    timeframe.as_str(),
                    symbol
                );
                rings.insert((symbol.clone(), timeframe), candles.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candle(minute: i64, close: f64) -> Candle {
        Candle {
            symbol: "NSE:X".to_string(),
            timeframe: Timeframe::M1,
            start_time: Utc.with_ymd_and_hms(2024, 10, 1, 4, 0, 0).unwrap() + Duration::minutes(minute),
            open: close,
            high: close,
            low: close,
            close,
            volume: 10,
        }
    }

    #[tokio::test]
    async fn test_ring_and_durable_agree() {
        let cs = CandleStore::new(Store::open_in_memory().unwrap());
        for i in 0..5 {
            cs.insert(candle(i, 100.0 + i as f64)).await.unwrap();
        }
        let from_ring = cs.recent("NSE:X", Timeframe::M1, 3).await.unwrap();
        assert_eq!(from_ring.len(), 3);
        assert_eq!(from_ring[2].close, 104.0);

        // A fresh store instance reads the durable tier
        let latest = cs.latest("NSE:X", Timeframe::M1).await.unwrap().unwrap();
        assert_eq!(latest.close, 104.0);
    }

    #[tokio::test]
    async fn test_duplicate_seal_upserts_in_ring() {
        let cs = CandleStore::new(Store::open_in_memory().unwrap());
        cs.insert(candle(0, 100.0)).await.unwrap();
        cs.insert(candle(0, 101.5)).await.unwrap();
        let rows = cs.recent("NSE:X", Timeframe::M1, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 101.5);
    }

    #[tokio::test]
    async fn test_warm_up_restores_rings() {
        let store = Store::open_in_memory().unwrap();
        {
            let cs = CandleStore::new(store.clone());
            for i in 0..4 {
                cs.insert(candle(i, 100.0 + i as f64)).await.unwrap();
            }
        }
        let cs2 = CandleStore::new(store);
        cs2.warm_up(&["NSE:X".to_string()]).await.unwrap();
        let rows = cs2.recent("NSE:X", Timeframe::M1, 4).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3].close, 103.0);
    }
}
