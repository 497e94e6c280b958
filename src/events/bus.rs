/// Event bus: durable append-only log in front of in-process fan-out.
/// Persistence completes before any subscriber can observe the event.
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::error::{EngineError, Result};
use crate::events::types::Event;
use crate::store::Store;

const BROADCAST_CAPACITY: usize = 8192;

pub struct EventBus {
    store: Store,
    broadcast_tx: broadcast::Sender<Event>,
    /// High-volume writer lane (tick persistence); same persist-then-emit
    /// contract, applied inside the writer task
    async_tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventBus {
    pub fn new(store: Store) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        EventBus {
            store,
            broadcast_tx,
            async_tx: None,
        }
    }

    /// Spawn the async writer lane used by `enqueue`
    pub fn with_async_writer(store: Store) -> Self {
        let mut bus = EventBus::new(store);
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let writer_store = bus.store.clone();
        let writer_broadcast = bus.broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(mut event) = rx.recv().await {
                match writer_store.append_event(&event) {
                    Ok(seq) => {
                        event.seq = Some(seq);
                        let _ = writer_broadcast.send(event);
                    }
                    Err(e) => {
                        error!("Async event write failed: {} ({})", e, e.error_code());
                    }
                }
            }
            warn!("Async event writer lane ended");
        });
        bus.async_tx = Some(tx);
        bus
    }

    pub fn async_writer_enabled(&self) -> bool {
        self.async_tx.is_some()
    }

    /// Persist then publish. On persist failure nothing is emitted and the
    /// caller must not proceed with the associated state change.
    pub fn append(&self, mut event: Event) -> Result<i64> {
        let seq = self.store.append_event(&event)?;
        event.seq = Some(seq);
        debug!("Event {} persisted at seq {}", event.event_type.as_str(), seq);
        // No live subscribers is not an error
        let _ = self.broadcast_tx.send(event);
        Ok(seq)
    }

    /// Queue onto the async writer lane; hot-path callers use this so tick
    /// persistence never blocks the symbol worker
    pub fn enqueue(&self, event: Event) -> Result<()> {
        match &self.async_tx {
            Some(tx) => tx
                .send(event)
                .map_err(|e| EngineError::EventDispatchFailed(format!("writer lane closed: {}", e))),
            None => self.append(event).map(|_| ()),
        }
    }

    /// In-process subscription; the hub and tests consume this
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    /// Ordered replay of the durable log strictly after `after_seq`
    pub fn replay(&self, after_seq: i64, limit: usize) -> Result<Vec<Event>> {
        self.store.events_after(after_seq, limit)
    }

    pub fn last_seq(&self) -> Result<i64> {
        self.store.last_event_seq()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{EventPayload, EventType};

    #[tokio::test]
    async fn test_persist_then_emit() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new(store.clone());
        let mut rx = bus.subscribe();

        let seq = bus
            .append(Event::global(
                EventType::FeedConnected,
                EventPayload::FeedConnected {
                    url: "wss://feed".to_string(),
                },
            ))
            .unwrap();

        let observed = rx.recv().await.unwrap();
        assert_eq!(observed.seq, Some(seq));

        // Durable log already contains what the subscriber saw
        let persisted = store.events_after(seq - 1, 10).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].seq, Some(seq));
        assert_eq!(persisted[0].event_type, EventType::FeedConnected);
    }

    #[tokio::test]
    async fn test_async_lane_preserves_order() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::with_async_writer(store.clone());
        assert!(bus.async_writer_enabled());

        for i in 0..5 {
            bus.enqueue(Event::global(
                EventType::Tick,
                EventPayload::Tick {
                    symbol: "NSE:X".to_string(),
                    last_price: 100.0 + i as f64,
                    last_qty: 1,
                    exchange_timestamp: None,
                },
            ))
            .unwrap();
        }

        // Writer task drains in order
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let persisted = store.events_after(0, 10).unwrap();
        assert_eq!(persisted.len(), 5);
        let seqs: Vec<i64> = persisted.iter().map(|e| e.seq.unwrap()).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }
}
