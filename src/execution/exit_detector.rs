/// Exit detector: per-tick inspection of open trades for target, stop,
/// time and trailing conditions. Detection is direction-aware and gated by
/// the brick-movement filter; the signal manager applies the episode
/// cooldown downstream. Open trades come from the store, not a cache.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::ExitConfig;
use crate::error::Result;
use crate::store::Store;
use crate::trades::TradeManager;
use crate::types::{Direction, ExitCandidate, ExitReason, Tick, Trade};

pub struct ExitDetector {
    store: Store,
    trade_manager: Arc<TradeManager>,
    cfg: ExitConfig,
    exit_tx: mpsc::Sender<ExitCandidate>,
    /// Last attempted exit price per (symbol, direction) for the brick filter
    last_attempt: Mutex<HashMap<(String, Direction), f64>>,
}

impl ExitDetector {
    pub fn new(
        store: Store,
        trade_manager: Arc<TradeManager>,
        cfg: ExitConfig,
        exit_tx: mpsc::Sender<ExitCandidate>,
    ) -> Self {
        ExitDetector {
            store,
            trade_manager,
            cfg,
            exit_tx,
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self: Arc<Self>, mut tick_rx: mpsc::Receiver<Tick>) {
        tokio::spawn(async move {
            while let Some(tick) = tick_rx.recv().await {
                if let Err(e) = self.on_tick(&tick).await {
                    error!("Exit detection error for {}: {}", tick.symbol, e);
                }
            }
            warn!("Exit detector ended");
        });
    }

    pub async fn on_tick(&self, tick: &Tick) -> Result<()> {
        let open_trades = self.store.open_trades_for_symbol(&tick.symbol)?;
        if open_trades.is_empty() {
            return Ok(());
        }
        let price = tick.last_price;
        let now = tick.received_at;

        for trade in open_trades {
            let trade = self.advance_trailing(trade, price)?;

            // Fixed evaluation order; the first reason to clear the brick
            // filter wins the tick and suppresses the rest for this trade.
            let mut detected: Option<ExitReason> = None;
            for reason in [
                ExitReason::StopLoss,
                ExitReason::TrailingStop,
                ExitReason::TargetHit,
                ExitReason::TimeBased,
            ] {
                if !condition_holds(&trade, reason, price, now, &self.cfg) {
                    continue;
                }
                if !self.brick_filter_passes(&trade.symbol, trade.direction, price) {
                    debug!(
                        "Brick filter suppressed {} on trade {} @ {:.2}",
                        reason.as_str(),
                        trade.trade_id,
                        price
                    );
                    continue;
                }
                detected = Some(reason);
                break;
            }

            if let Some(reason) = detected {
                self.record_attempt(&trade.symbol, trade.direction, price);
                let candidate = ExitCandidate {
                    trade_id: trade.trade_id.clone(),
                    reason,
                    price,
                    detected_at: now,
                };
                if self.exit_tx.send(candidate).await.is_err() {
                    warn!("Exit coordinator channel closed");
                }
            }
        }
        Ok(())
    }

    /// Activate and ratchet the trailing stop; the stop only ever moves in
    /// the favorable direction. Persisted through the trade manager.
    fn advance_trailing(&self, trade: Trade, price: f64) -> Result<Trade> {
        if !self.cfg.trailing_enabled {
            return Ok(trade);
        }
        let entry = match trade.entry_price {
            Some(p) if p > 0.0 => p,
            _ => return Ok(trade),
        };

        let activation = self.cfg.trailing_activation_pct;
        let distance = self.cfg.trailing_distance_pct;

        match trade.direction {
            Direction::Buy => {
                if !trade.trailing_active {
                    if price >= entry * (1.0 + activation) {
                        let stop = price * (1.0 - distance);
                        return self.trade_manager.update_trailing(&trade.trade_id, price, stop, true);
                    }
                    return Ok(trade);
                }
                let extremum = trade.trailing_extremum.unwrap_or(price).max(price);
                let proposed = extremum * (1.0 - distance);
                let stop = trade.trailing_stop_price.unwrap_or(proposed).max(proposed);
                if Some(extremum) != trade.trailing_extremum || Some(stop) != trade.trailing_stop_price {
                    return self.trade_manager.update_trailing(&trade.trade_id, extremum, stop, true);
                }
                Ok(trade)
            }
            Direction::Sell => {
                if !trade.trailing_active {
                    if price <= entry * (1.0 - activation) {
                        let stop = price * (1.0 + distance);
                        return self.trade_manager.update_trailing(&trade.trade_id, price, stop, true);
                    }
                    return Ok(trade);
                }
                let extremum = trade.trailing_extremum.unwrap_or(price).min(price);
                let proposed = extremum * (1.0 + distance);
                let stop = trade.trailing_stop_price.unwrap_or(proposed).min(proposed);
                if Some(extremum) != trade.trailing_extremum || Some(stop) != trade.trailing_stop_price {
                    return self.trade_manager.update_trailing(&trade.trade_id, extremum, stop, true);
                }
                Ok(trade)
            }
        }
    }

    /// Minimum move from the last attempted exit on this (symbol, direction);
    /// oscillation below the floor is suppressed.
    fn brick_filter_passes(&self, symbol: &str, direction: Direction, price: f64) -> bool {
        let attempts = self.last_attempt.lock();
        match attempts.get(&(symbol.to_string(), direction)) {
            Some(last) => {
                let min_move = self.cfg.brick_min_abs.max(last.abs() * self.cfg.brick_min_pct);
                (price - last).abs() >= min_move
            }
            None => true,
        }
    }

    fn record_attempt(&self, symbol: &str, direction: Direction, price: f64) {
        self.last_attempt
            .lock()
            .insert((symbol.to_string(), direction), price);
    }
}

fn condition_holds(
    trade: &Trade,
    reason: ExitReason,
    price: f64,
    now: chrono::DateTime<chrono::Utc>,
    cfg: &ExitConfig,
) -> bool {
    match reason {
        ExitReason::TargetHit => match trade.direction {
            Direction::Buy => price >= trade.exit_target_price,
            Direction::Sell => price <= trade.exit_target_price,
        },
        ExitReason::StopLoss => match trade.direction {
            Direction::Buy => price <= trade.exit_stop_price,
            Direction::Sell => price >= trade.exit_stop_price,
        },
        ExitReason::TimeBased => trade
            .entry_timestamp
            .map(|entry| now - entry > Duration::days(cfg.max_hold_days))
            .unwrap_or(false),
        ExitReason::TrailingStop => {
            if !trade.trailing_active {
                return false;
            }
            match (trade.trailing_stop_price, trade.direction) {
                (Some(stop), Direction::Buy) => price <= stop,
                (Some(stop), Direction::Sell) => price >= stop,
                (None, _) => false,
            }
        }
        ExitReason::Manual => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::trades::TradeInsert;
    use crate::types::{TradeStatus, Trade};

    fn exit_cfg() -> ExitConfig {
        ExitConfig {
            exit_cooldown_seconds: 30,
            max_hold_days: 5,
            exit_cutoff_minutes: 15,
            brick_min_abs: 0.05,
            brick_min_pct: 0.0,
            trailing_enabled: true,
            trailing_activation_pct: 0.02,
            trailing_distance_pct: 0.01,
            exit_poll_seconds: 5,
        }
    }

    fn open_trade(store: &Store, trade_id: &str, direction: Direction, entry: f64, stop: f64, target: f64) {
        let now = Utc::now();
        let trade = Trade {
            trade_id: trade_id.to_string(),
            intent_id: format!("i-{}", trade_id),
            client_order_id: format!("c-{}", trade_id),
            broker_order_id: Some(format!("b-{}", trade_id)),
            user_id: "u1".to_string(),
            user_broker_id: "ub1".to_string(),
            signal_id: "sig1".to_string(),
            symbol: "NSE:X".to_string(),
            direction,
            trade_number: 1,
            status: TradeStatus::Open,
            entry_price: Some(entry),
            entry_qty: 4,
            entry_value: Some(entry * 4.0),
            entry_timestamp: Some(now),
            exit_target_price: target,
            exit_stop_price: stop,
            trailing_active: false,
            trailing_extremum: None,
            trailing_stop_price: None,
            exit_price: None,
            exit_timestamp: None,
            exit_reason: None,
            realized_pnl: None,
            realized_log_return: None,
            last_broker_update_at: None,
            created_at: now,
            updated_at: now,
            row_version: 1,
        };
        match store.insert_trade(&trade).unwrap() {
            TradeInsert::Inserted(_) => {}
            TradeInsert::Existing(_) => panic!("fixture trade already present"),
        }
    }

    fn detector(store: &Store) -> (Arc<ExitDetector>, mpsc::Receiver<ExitCandidate>) {
        let bus = Arc::new(EventBus::new(store.clone()));
        let trade_manager = Arc::new(TradeManager::new(store.clone(), bus));
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(ExitDetector::new(store.clone(), trade_manager, exit_cfg(), tx)),
            rx,
        )
    }

    fn tick(price: f64) -> Tick {
        Tick {
            symbol: "NSE:X".to_string(),
            last_price: price,
            last_qty: 1,
            exchange_timestamp: Some(Utc::now()),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_target_hit_long() {
        let store = Store::open_in_memory().unwrap();
        open_trade(&store, "t1", Direction::Buy, 2450.0, 2400.0, 2500.0);
        let (detector, mut rx) = detector(&store);

        detector.on_tick(&tick(2500.05)).await.unwrap();
        let candidate = rx.recv().await.unwrap();
        assert_eq!(candidate.reason, ExitReason::TargetHit);
        assert_eq!(candidate.trade_id, "t1");
    }

    #[tokio::test]
    async fn test_stop_loss_short_mirrored() {
        let store = Store::open_in_memory().unwrap();
        open_trade(&store, "t1", Direction::Sell, 100.0, 103.0, 96.0);
        let (detector, mut rx) = detector(&store);

        detector.on_tick(&tick(102.5)).await.unwrap();
        assert!(rx.try_recv().is_err(), "no exit below the stop");

        detector.on_tick(&tick(103.1)).await.unwrap();
        let candidate = rx.recv().await.unwrap();
        assert_eq!(candidate.reason, ExitReason::StopLoss);
    }

    #[tokio::test]
    async fn test_brick_filter_suppresses_oscillation() {
        let store = Store::open_in_memory().unwrap();
        open_trade(&store, "t1", Direction::Buy, 2450.0, 2400.0, 2500.0);
        let (detector, mut rx) = detector(&store);

        detector.on_tick(&tick(2500.05)).await.unwrap();
        assert!(rx.recv().await.is_some());

        // 2500.07 is within the 0.05 brick of the last attempt
        detector.on_tick(&tick(2500.07)).await.unwrap();
        assert!(rx.try_recv().is_err());

        // A clear move re-arms detection
        detector.on_tick(&tick(2500.15)).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_trailing_activates_ratchets_and_triggers() {
        let store = Store::open_in_memory().unwrap();
        open_trade(&store, "t1", Direction::Buy, 100.0, 95.0, 120.0);
        let (detector, mut rx) = detector(&store);

        // +2% activates the trail at 102 * 0.99 = 100.98
        detector.on_tick(&tick(102.0)).await.unwrap();
        let t = store.get_trade("t1").unwrap().unwrap();
        assert!(t.trailing_active);
        assert!((t.trailing_stop_price.unwrap() - 100.98).abs() < 1e-9);

        // New high ratchets the stop up
        detector.on_tick(&tick(104.0)).await.unwrap();
        let t = store.get_trade("t1").unwrap().unwrap();
        assert!((t.trailing_stop_price.unwrap() - 102.96).abs() < 1e-9);

        // Pullback through the stop triggers TRAILING_STOP
        detector.on_tick(&tick(102.5)).await.unwrap();
        let candidate = rx.recv().await.unwrap();
        assert_eq!(candidate.reason, ExitReason::TrailingStop);

        // The stop never moved back down
        let t = store.get_trade("t1").unwrap().unwrap();
        assert!((t.trailing_stop_price.unwrap() - 102.96).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_first_reason_wins_the_tick() {
        let store = Store::open_in_memory().unwrap();
        // Stop above target floor: a single price can satisfy both trailing
        // and target; evaluation order resolves the winner.
        open_trade(&store, "t1", Direction::Buy, 100.0, 95.0, 103.0);
        let (detector, mut rx) = detector(&store);

        detector.on_tick(&tick(104.0)).await.unwrap(); // activates trailing, target hit
        let candidate = rx.recv().await.unwrap();
        // Target holds and trailing has no trigger yet: TARGET_HIT wins
        assert_eq!(candidate.reason, ExitReason::TargetHit);
        assert!(rx.try_recv().is_err(), "only one candidate per tick per trade");
    }
}
