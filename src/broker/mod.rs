pub mod feed;
pub mod http;
pub mod paper;

pub use feed::MarketDataFeed;
pub use http::HttpBroker;
pub use paper::PaperBroker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{EngineError, Result};
use crate::types::{BrokerRole, Candle, Direction, OrderType, Timeframe, UserBroker};
use crate::validation::BrokerState;

/// Outbound order as the adapters see it
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Direction,
    pub qty: i64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub product_type: String,
    /// Idempotency key across retries; intents own this
    pub client_order_id: String,
}

/// Synchronous response to placeOrder
#[derive(Debug, Clone)]
pub enum PlaceOutcome {
    Accepted { broker_order_id: String },
    Rejected { code: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOrderState {
    Pending,
    Filled,
    Rejected,
    Cancelled,
    NotFound,
}

/// Broker-side view of one order, keyed by client order id
#[derive(Debug, Clone)]
pub struct OrderStatusSnapshot {
    pub state: BrokerOrderState,
    pub filled_qty: i64,
    pub avg_price: Option<f64>,
    pub reject_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Minimal capability set every broker integration implements.
/// Per-broker quirks stay inside the adapter.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlaceOutcome>;
    async fn modify_order(&self, broker_order_id: &str, new_price: Option<f64>, new_qty: Option<i64>) -> Result<()>;
    async fn cancel_order(&self, broker_order_id: &str) -> Result<()>;
    async fn order_status(&self, client_order_id: &str) -> Result<OrderStatusSnapshot>;
    async fn historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;
    async fn is_connected(&self) -> bool;
}

pub struct BrokerHandle {
    pub record: UserBroker,
    pub adapter: Arc<dyn BrokerAdapter>,
}

/// All configured user-broker endpoints, DATA and EXEC
pub struct BrokerRegistry {
    entries: HashMap<String, BrokerHandle>,
    paused: RwLock<HashSet<String>>,
}

impl BrokerRegistry {
    pub fn new(handles: Vec<BrokerHandle>) -> Self {
        let entries = handles
            .into_iter()
            .map(|h| (h.record.user_broker_id.clone(), h))
            .collect();
        BrokerRegistry {
            entries,
            paused: RwLock::new(HashSet::new()),
        }
    }

    pub fn get(&self, user_broker_id: &str) -> Result<&BrokerHandle> {
        self.entries
            .get(user_broker_id)
            .ok_or_else(|| EngineError::BrokerNotRegistered(user_broker_id.to_string()))
    }

    /// Enabled EXEC endpoints, fan-out targets for entry signals
    pub fn exec_brokers(&self) -> Vec<&BrokerHandle> {
        self.entries
            .values()
            .filter(|h| h.record.enabled && h.record.role == BrokerRole::Exec)
            .collect()
    }

    /// The single enabled DATA broker; the startup gate enforces exactly one
    pub fn data_broker(&self) -> Option<&BrokerHandle> {
        self.entries
            .values()
            .find(|h| h.record.enabled && h.record.role == BrokerRole::Data)
    }

    pub async fn state(&self, user_broker_id: &str) -> Result<BrokerState> {
        let handle = self.get(user_broker_id)?;
        Ok(BrokerState {
            connected: handle.adapter.is_connected().await,
            paused: self.paused.read().contains(user_broker_id),
        })
    }

    pub fn set_paused(&self, user_broker_id: &str, paused: bool) {
        if paused {
            self.paused.write().insert(user_broker_id.to_string());
        } else {
            self.paused.write().remove(user_broker_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, role: BrokerRole, enabled: bool) -> UserBroker {
        UserBroker {
            user_broker_id: id.to_string(),
            user_id: "u1".to_string(),
            name: id.to_string(),
            role,
            enabled,
            credentials_handle: String::new(),
            capital: 100_000.0,
            max_exposure: 50_000.0,
            max_per_trade: 25_000.0,
            min_trade_value: 0.0,
            max_open_trades: 5,
            max_daily_loss: 5_000.0,
            max_weekly_loss: 15_000.0,
            cooldown_minutes: 0,
            watchlist: vec!["NSE:X".to_string()],
        }
    }

    fn handle(id: &str, role: BrokerRole, enabled: bool) -> BrokerHandle {
        BrokerHandle {
            record: record(id, role, enabled),
            adapter: Arc::new(PaperBroker::new(true, 5.0)),
        }
    }

    #[tokio::test]
    async fn test_registry_roles() {
        let registry = BrokerRegistry::new(vec![
            handle("data1", BrokerRole::Data, true),
            handle("exec1", BrokerRole::Exec, true),
            handle("exec2", BrokerRole::Exec, false),
        ]);
        assert_eq!(registry.exec_brokers().len(), 1);
        assert_eq!(
            registry.data_broker().unwrap().record.user_broker_id,
            "data1"
        );

        let state = registry.state("exec1").await.unwrap();
        assert!(state.connected);
        assert!(!state.paused);

        registry.set_paused("exec1", true);
        assert!(registry.state("exec1").await.unwrap().paused);
        assert!(registry.get("missing").is_err());
    }
}
