/// Data-broker tick stream: one WebSocket session feeding the tick
/// pipeline, with bounded reconnect backoff and resubscription of the
/// shared watchlist on every reconnect.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::error::Result;
use crate::events::{Event, EventBus, EventPayload, EventType};
use crate::market::FeedLiveness;
use crate::types::Tick;

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    action: &'a str,
    symbols: &'a [String],
}

#[derive(Debug, Deserialize)]
struct TickFrame {
    symbol: String,
    last_price: f64,
    #[serde(default)]
    last_qty: i64,
    #[serde(default)]
    exchange_timestamp: Option<DateTime<Utc>>,
}

pub struct MarketDataFeed {
    cfg: FeedConfig,
    watchlist: Vec<String>,
    liveness: FeedLiveness,
    bus: Arc<EventBus>,
    tick_tx: mpsc::Sender<Tick>,
}

impl MarketDataFeed {
    pub fn new(
        cfg: FeedConfig,
        watchlist: Vec<String>,
        liveness: FeedLiveness,
        bus: Arc<EventBus>,
        tick_tx: mpsc::Sender<Tick>,
    ) -> Self {
        MarketDataFeed {
            cfg,
            watchlist,
            liveness,
            bus,
            tick_tx,
        }
    }

    /// Run the session forever; each disconnect backs off along the
    /// configured ladder and reconnects.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut attempt: usize = 0;
            loop {
                match self.run_session().await {
                    Ok(()) => {
                        attempt = 0;
                    }
                    Err(e) => {
                        attempt += 1;
                        let backoff = self
                            .cfg
                            .reconnect_backoff_seconds
                            .get(attempt.saturating_sub(1))
                            .or_else(|| self.cfg.reconnect_backoff_seconds.last())
                            .copied()
                            .unwrap_or(30);
                        warn!(
                            "Feed session ended ({}); reconnect {} in {}s",
                            e, attempt, backoff
                        );
                        let _ = self.bus.append(Event::global(
                            EventType::FeedDisconnected,
                            EventPayload::FeedDisconnected {
                                reason: e.to_string(),
                                reconnect_attempt: attempt as u32,
                            },
                        ));
                        tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                    }
                }
            }
        });
    }

    async fn run_session(&self) -> Result<()> {
        info!("Connecting to data feed {}", self.cfg.url);
        let (ws_stream, _) = connect_async(&self.cfg.url)
            .await
            .map_err(|e| crate::error::EngineError::WebSocket(format!("connect failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        // Resubscribe the shared watchlist on every (re)connect
        let subscribe = SubscribeFrame {
            action: "subscribe",
            symbols: &self.watchlist,
        };
        write
            .send(Message::Text(serde_json::to_string(&subscribe)?))
            .await
            .map_err(|e| crate::error::EngineError::WebSocket(format!("subscribe failed: {}", e)))?;

        self.liveness.set_connected(true);
        self.bus.append(Event::global(
            EventType::FeedConnected,
            EventPayload::FeedConnected {
                url: self.cfg.url.clone(),
            },
        ))?;
        info!("Feed connected, {} symbols subscribed", self.watchlist.len());

        let result = self.read_loop(&mut read, &mut write).await;
        self.liveness.set_connected(false);
        result
    }

    async fn read_loop<R, W>(&self, read: &mut R, write: &mut W) -> Result<()>
    where
        R: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
        W: SinkExt<Message> + Unpin,
    {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Ok(frame) = serde_json::from_str::<TickFrame>(&text) {
                        let tick = Tick {
                            symbol: frame.symbol,
                            last_price: frame.last_price,
                            last_qty: frame.last_qty,
                            exchange_timestamp: frame.exchange_timestamp,
                            received_at: Utc::now(),
                        };
                        if self.tick_tx.send(tick).await.is_err() {
                            return Err(crate::error::EngineError::FeedDisconnected(
                                "tick pipeline closed".to_string(),
                            ));
                        }
                    } else {
                        debug!("Unparseable feed frame ignored");
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => {
                    return Err(crate::error::EngineError::FeedDisconnected(
                        "server closed".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Feed read error: {}", e);
                    return Err(crate::error::EngineError::WebSocket(e.to_string()));
                }
            }
        }
        Err(crate::error::EngineError::FeedDisconnected("stream ended".to_string()))
    }
}
