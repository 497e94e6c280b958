/// Latest-tick cache and feed liveness tracking.
/// One writer per symbol; reads are concurrent and cheap.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::Tick;

#[derive(Clone, Default)]
pub struct TickCache {
    inner: Arc<RwLock<HashMap<String, Tick>>>,
}

impl TickCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, tick: &Tick) {
        self.inner.write().insert(tick.symbol.clone(), tick.clone());
    }

    pub fn last(&self, symbol: &str) -> Option<Tick> {
        self.inner.read().get(symbol).cloned()
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.inner.read().get(symbol).map(|t| t.last_price)
    }
}

/// Watchdog input: per-symbol last tick time plus the feed session flag
#[derive(Clone, Default)]
pub struct FeedLiveness {
    last_tick_at: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    connected: Arc<AtomicBool>,
}

impl FeedLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, symbol: &str, at: DateTime<Utc>) {
        self.last_tick_at.write().insert(symbol.to_string(), at);
    }

    pub fn last_tick_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.last_tick_at.read().get(symbol).copied()
    }

    /// Most recent tick across the whole universe
    pub fn most_recent(&self) -> Option<DateTime<Utc>> {
        self.last_tick_at.read().values().max().copied()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
