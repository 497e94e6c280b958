/// Generic REST execution adapter. Speaks a plain JSON order API; broker
/// specifics (auth headers, paths) are configuration of this adapter, not
/// of the core.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::{
    BrokerAdapter, BrokerOrderState, OrderRequest, OrderStatusSnapshot, PlaceOutcome,
};
use crate::error::{EngineError, Result};
use crate::types::{Candle, Timeframe};

#[derive(Debug, Serialize)]
struct PlaceOrderBody<'a> {
    symbol: &'a str,
    side: &'a str,
    quantity: i64,
    order_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<f64>,
    product_type: &'a str,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    status: bool,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    status: String,
    #[serde(default)]
    filled_qty: i64,
    #[serde(default)]
    avg_price: Option<f64>,
    #[serde(default)]
    reject_reason: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    start_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
}

pub struct HttpBroker {
    client: Client,
    base_url: String,
    credentials_handle: String,
}

impl HttpBroker {
    pub fn new(base_url: String, credentials_handle: String, timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| EngineError::Config(format!("HTTP client build failed: {}", e)))?;
        Ok(HttpBroker {
            client,
            base_url,
            credentials_handle,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl BrokerAdapter for HttpBroker {
    async fn place_order(&self, req: &OrderRequest) -> Result<PlaceOutcome> {
        let body = PlaceOrderBody {
            symbol: &req.symbol,
            side: req.side.as_str(),
            quantity: req.qty,
            order_type: req.order_type.as_str(),
            limit_price: req.limit_price,
            product_type: &req.product_type,
            client_order_id: &req.client_order_id,
        };
        let response = self
            .client
            .post(self.url("/orders"))
            .bearer_auth(&self.credentials_handle)
            .json(&body)
            .send()
            .await?;
        let parsed: PlaceOrderResponse = response.json().await?;

        if parsed.status {
            let broker_order_id = parsed
                .order_id
                .ok_or_else(|| EngineError::Internal("acceptance without order id".to_string()))?;
            debug!("Order accepted: {} -> {}", req.client_order_id, broker_order_id);
            Ok(PlaceOutcome::Accepted { broker_order_id })
        } else {
            let code = parsed.error_code.unwrap_or_else(|| "UNKNOWN".to_string());
            let message = parsed.message.unwrap_or_default();
            warn!("Order rejected: {} ({} {})", req.client_order_id, code, message);
            Ok(PlaceOutcome::Rejected { code, message })
        }
    }

    async fn modify_order(&self, broker_order_id: &str, new_price: Option<f64>, new_qty: Option<i64>) -> Result<()> {
        self.client
            .put(self.url(&format!("/orders/{}", broker_order_id)))
            .bearer_auth(&self.credentials_handle)
            .json(&serde_json::json!({ "limit_price": new_price, "quantity": new_qty }))
            .send()
            .await?
            .error_for_status()
            .map_err(EngineError::from)?;
        Ok(())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<()> {
        self.client
            .delete(self.url(&format!("/orders/{}", broker_order_id)))
            .bearer_auth(&self.credentials_handle)
            .send()
            .await?
            .error_for_status()
            .map_err(EngineError::from)?;
        Ok(())
    }

    async fn order_status(&self, client_order_id: &str) -> Result<OrderStatusSnapshot> {
        let response = self
            .client
            .get(self.url(&format!("/orders/by-client-id/{}", client_order_id)))
            .bearer_auth(&self.credentials_handle)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(OrderStatusSnapshot {
                state: BrokerOrderState::NotFound,
                filled_qty: 0,
                avg_price: None,
                reject_reason: None,
                updated_at: Utc::now(),
            });
        }
        let parsed: OrderStatusResponse = response.json().await?;
        Ok(OrderStatusSnapshot {
            state: map_status(&parsed.status),
            filled_qty: parsed.filled_qty,
            avg_price: parsed.avg_price,
            reject_reason: parsed.reject_reason,
            updated_at: parsed.updated_at,
        })
    }

    async fn historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let response = self
            .client
            .get(self.url("/candles"))
            .bearer_auth(&self.credentials_handle)
            .query(&[
                ("symbol", symbol),
                ("timeframe", timeframe.as_str()),
                ("from", &from.to_rfc3339()),
                ("to", &to.to_rfc3339()),
            ])
            .send()
            .await?;
        let rows: Vec<CandleRow> = response.json().await?;
        Ok(rows
            .into_iter()
            .map(|row| Candle {
                symbol: symbol.to_string(),
                timeframe,
                start_time: row.start_time,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            })
            .collect())
    }

    async fn is_connected(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Map broker status strings onto the core's order states
fn map_status(status: &str) -> BrokerOrderState {
    match status.to_ascii_uppercase().as_str() {
        "FILLED" | "COMPLETE" => BrokerOrderState::Filled,
        "REJECTED" => BrokerOrderState::Rejected,
        "CANCELLED" | "CANCELED" => BrokerOrderState::Cancelled,
        "PENDING" | "OPEN" | "TRIGGER_PENDING" => BrokerOrderState::Pending,
        _ => BrokerOrderState::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("COMPLETE"), BrokerOrderState::Filled);
        assert_eq!(map_status("filled"), BrokerOrderState::Filled);
        assert_eq!(map_status("REJECTED"), BrokerOrderState::Rejected);
        assert_eq!(map_status("TRIGGER_PENDING"), BrokerOrderState::Pending);
        assert_eq!(map_status("whatever"), BrokerOrderState::Pending);
    }

    #[test]
    fn test_url_join() {
        let broker = HttpBroker::new("https://api.broker.example/".to_string(), "tok".to_string(), 10).unwrap();
        assert_eq!(broker.url("/orders"), "https://api.broker.example/orders");
    }
}
