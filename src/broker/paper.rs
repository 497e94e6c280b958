/// Paper trading (simulation mode) adapter. Auto-fill mode fills at the
/// limit price plus slippage; manual mode keeps orders pending until the
/// test or operator fills them, which is how broker-silence scenarios are
/// reproduced.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::broker::{
    BrokerAdapter, BrokerOrderState, OrderRequest, OrderStatusSnapshot, PlaceOutcome,
};
use crate::error::{EngineError, Result};
use crate::types::{Candle, Direction, Timeframe};

#[derive(Debug, Clone)]
struct SimulatedOrder {
    request: OrderRequest,
    broker_order_id: String,
    fill_price: Option<f64>,
    filled_qty: i64,
    state: BrokerOrderState,
    updated_at: DateTime<Utc>,
}

pub struct PaperBroker {
    orders: Arc<RwLock<HashMap<String, SimulatedOrder>>>,
    auto_fill: bool,
    slippage_bps: f64,
    /// Next place_order returns a synchronous rejection with this code
    reject_next: Arc<RwLock<Option<String>>>,
    /// Next place_order fails as if the network dropped
    fail_next: Arc<RwLock<bool>>,
}

impl PaperBroker {
    pub fn new(auto_fill: bool, slippage_bps: f64) -> Self {
        PaperBroker {
            orders: Arc::new(RwLock::new(HashMap::new())),
            auto_fill,
            slippage_bps,
            reject_next: Arc::new(RwLock::new(None)),
            fail_next: Arc::new(RwLock::new(false)),
        }
    }

    fn fill_price_for(&self, req: &OrderRequest) -> f64 {
        let base = req.limit_price.unwrap_or(100.0);
        let slippage = base * (self.slippage_bps / 10_000.0);
        match req.side {
            Direction::Buy => base + slippage,
            Direction::Sell => base - slippage,
        }
    }

    /// Simulate a broker-side fill for a still-pending order
    pub async fn fill(&self, client_order_id: &str, avg_price: f64) {
        let mut orders = self.orders.write().await;
        if let Some(order) = orders.get_mut(client_order_id) {
            order.fill_price = Some(avg_price);
            order.filled_qty = order.request.qty;
            order.state = BrokerOrderState::Filled;
            order.updated_at = Utc::now();
            info!("[PAPER] Filled {} @ {:.2}", client_order_id, avg_price);
        }
    }

    /// Arm a one-shot synchronous rejection
    pub async fn reject_next(&self, code: &str) {
        *self.reject_next.write().await = Some(code.to_string());
    }

    /// Arm a one-shot network failure
    pub async fn fail_next(&self) {
        *self.fail_next.write().await = true;
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlaceOutcome> {
        let fail = std::mem::take(&mut *self.fail_next.write().await);
        if fail {
            return Err(EngineError::BrokerUnavailable("[PAPER] simulated outage".to_string()));
        }
        if let Some(code) = self.reject_next.write().await.take() {
            warn!("[PAPER] Rejecting {}: {}", req.client_order_id, code);
            return Ok(PlaceOutcome::Rejected {
                code,
                message: "simulated rejection".to_string(),
            });
        }

        let mut orders = self.orders.write().await;
        // Idempotent on client order id: a retry returns the original ack
        if let Some(existing) = orders.get(&req.client_order_id) {
            return Ok(PlaceOutcome::Accepted {
                broker_order_id: existing.broker_order_id.clone(),
            });
        }

        let broker_order_id = format!("PAPER-{}", uuid::Uuid::new_v4());
        let mut order = SimulatedOrder {
            request: req.clone(),
            broker_order_id: broker_order_id.clone(),
            fill_price: None,
            filled_qty: 0,
            state: BrokerOrderState::Pending,
            updated_at: Utc::now(),
        };
        if self.auto_fill {
            order.fill_price = Some(self.fill_price_for(req));
            order.filled_qty = req.qty;
            order.state = BrokerOrderState::Filled;
        }
        info!(
            "[PAPER] Order placed: {} {} x{} ({})",
            req.side.as_str(),
            req.symbol,
            req.qty,
            req.client_order_id
        );
        orders.insert(req.client_order_id.clone(), order);
        Ok(PlaceOutcome::Accepted { broker_order_id })
    }

    async fn modify_order(&self, broker_order_id: &str, new_price: Option<f64>, _new_qty: Option<i64>) -> Result<()> {
        let mut orders = self.orders.write().await;
        for order in orders.values_mut() {
            if order.broker_order_id == broker_order_id {
                if let Some(price) = new_price {
                    order.request.limit_price = Some(price);
                }
                order.updated_at = Utc::now();
                return Ok(());
            }
        }
        Err(EngineError::NotFound(broker_order_id.to_string()))
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<()> {
        let mut orders = self.orders.write().await;
        for order in orders.values_mut() {
            if order.broker_order_id == broker_order_id {
                order.state = BrokerOrderState::Cancelled;
                order.updated_at = Utc::now();
                return Ok(());
            }
        }
        Err(EngineError::NotFound(broker_order_id.to_string()))
    }

    async fn order_status(&self, client_order_id: &str) -> Result<OrderStatusSnapshot> {
        let orders = self.orders.read().await;
        match orders.get(client_order_id) {
            Some(order) => Ok(OrderStatusSnapshot {
                state: order.state,
                filled_qty: order.filled_qty,
                avg_price: order.fill_price,
                reject_reason: None,
                updated_at: order.updated_at,
            }),
            None => Ok(OrderStatusSnapshot {
                state: BrokerOrderState::NotFound,
                filled_qty: 0,
                avg_price: None,
                reject_reason: None,
                updated_at: Utc::now(),
            }),
        }
    }

    async fn historical_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;

    fn request(id: &str) -> OrderRequest {
        OrderRequest {
            symbol: "NSE:X".to_string(),
            side: Direction::Buy,
            qty: 4,
            order_type: OrderType::Limit,
            limit_price: Some(2450.0),
            product_type: "INTRADAY".to_string(),
            client_order_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_auto_fill_with_slippage() {
        let broker = PaperBroker::new(true, 5.0);
        let outcome = broker.place_order(&request("c1")).await.unwrap();
        assert!(matches!(outcome, PlaceOutcome::Accepted { .. }));

        let status = broker.order_status("c1").await.unwrap();
        assert_eq!(status.state, BrokerOrderState::Filled);
        assert!(status.avg_price.unwrap() > 2450.0);
    }

    #[tokio::test]
    async fn test_place_is_idempotent_on_client_order_id() {
        let broker = PaperBroker::new(true, 0.0);
        let first = broker.place_order(&request("c1")).await.unwrap();
        let second = broker.place_order(&request("c1")).await.unwrap();
        let (a, b) = match (first, second) {
            (PlaceOutcome::Accepted { broker_order_id: a }, PlaceOutcome::Accepted { broker_order_id: b }) => (a, b),
            other => panic!("unexpected outcomes: {:?}", other),
        };
        assert_eq!(a, b);
        assert_eq!(broker.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_silent_broker_then_late_fill() {
        let broker = PaperBroker::new(false, 0.0);
        broker.place_order(&request("c1")).await.unwrap();
        assert_eq!(
            broker.order_status("c1").await.unwrap().state,
            BrokerOrderState::Pending
        );
        broker.fill("c1", 2451.30).await;
        let status = broker.order_status("c1").await.unwrap();
        assert_eq!(status.state, BrokerOrderState::Filled);
        assert_eq!(status.avg_price, Some(2451.30));
        assert_eq!(status.filled_qty, 4);
    }

    #[tokio::test]
    async fn test_armed_rejection_and_outage() {
        let broker = PaperBroker::new(true, 0.0);
        broker.reject_next("MARGIN_SHORTFALL").await;
        match broker.place_order(&request("c1")).await.unwrap() {
            PlaceOutcome::Rejected { code, .. } => assert_eq!(code, "MARGIN_SHORTFALL"),
            other => panic!("expected rejection, got {:?}", other),
        }

        broker.fail_next().await;
        assert!(broker.place_order(&request("c2")).await.is_err());
        // The armed failure is one-shot
        assert!(broker.place_order(&request("c2")).await.is_ok());
    }
}
