/// Watchdog: periodic liveness checks over storage, the tick feed, the
/// hub queue and candle production. A failing critical check raises the
/// read-only guard, which makes both executors refuse to place orders.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::events::{Event, EventBus, EventPayload, EventType};
use crate::market::{CandleStore, FeedLiveness};
use crate::store::Store;
use crate::time::SessionClock;
use crate::types::Timeframe;

/// The core's safety switch. Executors check this before any placeOrder.
#[derive(Default)]
pub struct ReadOnlyGuard {
    read_only: AtomicBool,
}

impl ReadOnlyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}

pub struct Watchdog {
    store: Store,
    bus: Arc<EventBus>,
    candle_store: Arc<CandleStore>,
    liveness: FeedLiveness,
    clock: Arc<SessionClock>,
    guard: Arc<ReadOnlyGuard>,
    hub_depth: Arc<AtomicUsize>,
    hub_capacity: usize,
    stale_feed_seconds: i64,
    interval_seconds: u64,
    watchlist: Vec<String>,
}

impl Watchdog {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        candle_store: Arc<CandleStore>,
        liveness: FeedLiveness,
        clock: Arc<SessionClock>,
        guard: Arc<ReadOnlyGuard>,
        hub_depth: Arc<AtomicUsize>,
        hub_capacity: usize,
        stale_feed_seconds: i64,
        interval_seconds: u64,
        watchlist: Vec<String>,
    ) -> Self {
        Watchdog {
            store,
            bus,
            candle_store,
            liveness,
            clock,
            guard,
            hub_depth,
            hub_capacity,
            stale_feed_seconds,
            interval_seconds,
            watchlist,
        }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(self.interval_seconds.max(1)));
            loop {
                ticker.tick().await;
                if let Err(e) = self.check_once().await {
                    error!("Watchdog pass failed: {}", e);
                }
            }
        });
    }

    /// One full pass. Critical failures (storage, stale feed, dead data
    /// session) raise the guard; recovery clears it.
    pub async fn check_once(&self) -> Result<()> {
        let now = Utc::now();
        let in_session = self.clock.is_market_open(now);
        let mut alarms: Vec<(String, String)> = Vec::new();
        let mut critical = false;

        // Storage reachability
        if let Err(e) = self.store.ping() {
            alarms.push(("STORAGE".to_string(), e.to_string()));
            critical = true;
        }

        // Data-broker session validity
        if in_session && !self.liveness.is_connected() {
            alarms.push(("FEED_SESSION".to_string(), "data broker disconnected".to_string()));
            critical = true;
        }

        // Tick liveness across the universe
        if in_session {
            match self.liveness.most_recent() {
                Some(last) if now - last > Duration::seconds(self.stale_feed_seconds) => {
                    alarms.push((
                        "FEED_STALE".to_string(),
                        format!("no ticks for {}s", (now - last).num_seconds()),
                    ));
                    critical = true;
                }
                None => {
                    alarms.push(("FEED_STALE".to_string(), "no ticks received yet".to_string()));
                    critical = true;
                }
                _ => {}
            }
        }

        // Hub queue depth
        let depth = self.hub_depth.load(Ordering::Relaxed);
        if self.hub_capacity > 0 && depth * 10 >= self.hub_capacity * 8 {
            alarms.push((
                "HUB_BACKLOG".to_string(),
                format!("queue at {}/{}", depth, self.hub_capacity),
            ));
        }

        // Candle liveness: a current-period 1m bar should exist in session
        if in_session {
            for symbol in &self.watchlist {
                let fresh = match self.candle_store.latest(symbol, Timeframe::M1).await? {
                    Some(candle) => now - candle.start_time < Duration::minutes(5),
                    None => false,
                };
                if !fresh {
                    alarms.push((
                        "CANDLE_LIVENESS".to_string(),
                        format!("no recent 1m candle for {}", symbol),
                    ));
                }
            }
        }

        for (check, detail) in &alarms {
            warn!("Watchdog alarm [{}]: {}", check, detail);
            self.bus.append(Event::global(
                EventType::WatchdogAlarm,
                EventPayload::WatchdogAlarm {
                    check: check.clone(),
                    detail: detail.clone(),
                },
            ))?;
        }

        if critical && !self.guard.is_read_only() {
            self.guard.set(true);
            warn!("Read-only guard SET: executors will refuse new orders");
            self.bus.append(Event::global(
                EventType::ReadOnlyGuardSet,
                EventPayload::ReadOnlyGuard {
                    reason: alarms
                        .iter()
                        .map(|(c, _)| c.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                },
            ))?;
        } else if !critical && self.guard.is_read_only() {
            self.guard.set(false);
            info!("Read-only guard cleared");
            self.bus.append(Event::global(
                EventType::ReadOnlyGuardCleared,
                EventPayload::ReadOnlyGuard {
                    reason: "checks healthy".to_string(),
                },
            ))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn always_open_clock() -> Arc<SessionClock> {
        Arc::new(
            SessionClock::from_config(&SessionConfig {
                timezone: "UTC".to_string(),
                open_time: "00:00".to_string(),
                close_time: "23:59".to_string(),
                holidays: vec![],
                candle_grace_seconds: 15,
                weekend_trading: true,
            })
            .unwrap(),
        )
    }

    fn watchdog(store: &Store, liveness: FeedLiveness, guard: Arc<ReadOnlyGuard>) -> Watchdog {
        Watchdog::new(
            store.clone(),
            Arc::new(EventBus::new(store.clone())),
            Arc::new(CandleStore::new(store.clone())),
            liveness,
            always_open_clock(),
            guard,
            Arc::new(AtomicUsize::new(0)),
            1000,
            300,
            120,
            vec![],
        )
    }

    #[tokio::test]
    async fn test_stale_feed_raises_guard() {
        let store = Store::open_in_memory().unwrap();
        let liveness = FeedLiveness::new();
        liveness.set_connected(true);
        liveness.record("NSE:X", Utc::now() - Duration::seconds(600));
        let guard = Arc::new(ReadOnlyGuard::new());

        let wd = watchdog(&store, liveness.clone(), Arc::clone(&guard));
        wd.check_once().await.unwrap();
        assert!(guard.is_read_only());

        // A fresh tick clears the guard on the next pass
        liveness.record("NSE:X", Utc::now());
        wd.check_once().await.unwrap();
        assert!(!guard.is_read_only());
    }

    #[tokio::test]
    async fn test_disconnected_feed_is_critical() {
        let store = Store::open_in_memory().unwrap();
        let liveness = FeedLiveness::new();
        liveness.record("NSE:X", Utc::now());
        let guard = Arc::new(ReadOnlyGuard::new());

        let wd = watchdog(&store, liveness, Arc::clone(&guard));
        wd.check_once().await.unwrap();
        assert!(guard.is_read_only());
    }
}
