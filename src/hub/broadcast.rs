/// Broadcast hub: bounded intake queue, batched flusher, per-session
/// scope filtering. On overflow the newest events are kept and every
/// session is flagged for resync so clients recover via replay(after_seq).
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::events::{Event, EventBus, EventScope};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
        #[serde(default)]
        user_broker_ids: Vec<String>,
        #[serde(default)]
        after_seq: Option<i64>,
    },
    Ack { seq: i64 },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Batch { events: Vec<Event> },
    Ack { seq: i64 },
    Pong,
    /// The hub dropped events for this session; resume via replay
    Resync { last_seq: i64 },
}

pub struct SessionHandle {
    pub user_id: String,
    pub topics: HashSet<String>,
    pub user_broker_ids: HashSet<String>,
    pub tx: mpsc::Sender<ServerFrame>,
    pub last_seq: i64,
    pub resync_needed: bool,
}

pub struct BroadcastHub {
    sessions: RwLock<HashMap<u64, SessionHandle>>,
    next_session_id: AtomicU64,
    depth: Arc<AtomicUsize>,
    queue_capacity: usize,
    batch_max: usize,
    batch_interval: std::time::Duration,
}

impl BroadcastHub {
    pub fn new(cfg: &HubConfig) -> Arc<Self> {
        Arc::new(BroadcastHub {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            depth: Arc::new(AtomicUsize::new(0)),
            queue_capacity: cfg.queue_capacity,
            batch_max: cfg.batch_max,
            batch_interval: std::time::Duration::from_millis(cfg.batch_interval_ms.max(1)),
        })
    }

    /// Queue-depth gauge shared with the watchdog
    pub fn depth_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.depth)
    }

    /// Start the intake + flusher task over the bus subscription
    pub fn start(self: &Arc<Self>, bus: &EventBus) {
        let hub = Arc::clone(self);
        let mut bus_rx = bus.subscribe();
        tokio::spawn(async move {
            let mut buffer: VecDeque<Event> = VecDeque::new();
            let mut ticker = tokio::time::interval(hub.batch_interval);
            loop {
                tokio::select! {
                    received = bus_rx.recv() => {
                        match received {
                            Ok(event) => {
                                if buffer.len() >= hub.queue_capacity {
                                    // Keep the newest; everyone resyncs
                                    buffer.pop_front();
                                    hub.mark_all_resync().await;
                                }
                                buffer.push_back(event);
                                hub.depth.store(buffer.len(), Ordering::Relaxed);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("Hub lagged {} events behind the bus", missed);
                                hub.mark_all_resync().await;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                                warn!("Event bus closed; hub intake ending");
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        hub.flush(&mut buffer).await;
                        hub.depth.store(buffer.len(), Ordering::Relaxed);
                    }
                }
            }
        });
    }

    pub async fn register_session(&self, user_id: &str, tx: mpsc::Sender<ServerFrame>) -> u64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle {
            user_id: user_id.to_string(),
            topics: HashSet::new(),
            user_broker_ids: HashSet::new(),
            tx,
            last_seq: 0,
            resync_needed: false,
        };
        self.sessions.write().await.insert(session_id, handle);
        info!("Hub session {} registered for user {}", session_id, user_id);
        session_id
    }

    pub async fn subscribe_session(
        &self,
        session_id: u64,
        topics: Vec<String>,
        user_broker_ids: Vec<String>,
        after_seq: Option<i64>,
    ) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            session.topics = topics.into_iter().collect();
            session.user_broker_ids = user_broker_ids.into_iter().collect();
            if let Some(seq) = after_seq {
                session.last_seq = seq;
            }
        }
    }

    pub async fn ack(&self, session_id: u64, seq: i64) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            session.last_seq = session.last_seq.max(seq);
        }
    }

    pub async fn unregister(&self, session_id: u64) {
        self.sessions.write().await.remove(&session_id);
        debug!("Hub session {} removed", session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn mark_all_resync(&self) {
        for session in self.sessions.write().await.values_mut() {
            session.resync_needed = true;
        }
    }

    /// Drain up to batch_max events and dispatch per-session filtered
    /// batches. A full session channel flags that session for resync
    /// instead of blocking the flusher.
    async fn flush(&self, buffer: &mut VecDeque<Event>) {
        if buffer.is_empty() {
            return;
        }
        let take = buffer.len().min(self.batch_max);
        let batch: Vec<Event> = buffer.drain(..take).collect();

        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            if session.resync_needed {
                session.resync_needed = false;
                session.last_seq = 0;
                let _ = session.tx.try_send(ServerFrame::Resync { last_seq: 0 });
            }

            let filtered: Vec<Event> = batch
                .iter()
                .filter(|event| visible_to(event, session))
                .cloned()
                .collect();
            if filtered.is_empty() {
                continue;
            }
            let top_seq = filtered.iter().filter_map(|e| e.seq).max().unwrap_or(0);
            match session.tx.try_send(ServerFrame::Batch { events: filtered }) {
                Ok(()) => {
                    session.last_seq = session.last_seq.max(top_seq);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    session.resync_needed = true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The socket task cleans the session up on its way out
                }
            }
        }
    }
}

/// GLOBAL always; USER on user match; USER_BROKER additionally on the
/// session's broker filter. Topic subscriptions narrow by event type.
fn visible_to(event: &Event, session: &SessionHandle) -> bool {
    let scope_ok = match event.scope {
        EventScope::Global => true,
        EventScope::User => event.user_id.as_deref() == Some(session.user_id.as_str()),
        EventScope::UserBroker => {
            event.user_id.as_deref() == Some(session.user_id.as_str())
                && event
                    .user_broker_id
                    .as_deref()
                    .map(|ub| session.user_broker_ids.contains(ub))
                    .unwrap_or(false)
        }
    };
    if !scope_ok {
        return false;
    }
    session.topics.is_empty() || session.topics.contains(event.event_type.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, EventType};

    fn hub_cfg() -> HubConfig {
        HubConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            auth_token: "secret".to_string(),
            batch_interval_ms: 10,
            batch_max: 100,
            queue_capacity: 4,
        }
    }

    fn global_event(seq: i64) -> Event {
        let mut event = Event::global(
            EventType::SignalExpired,
            EventPayload::SignalExpired {
                symbol: "NSE:X".to_string(),
                reason: "TTL_ELAPSED".to_string(),
            },
        );
        event.seq = Some(seq);
        event
    }

    fn user_broker_event(seq: i64, user: &str, ub: &str) -> Event {
        let mut event = Event::for_user_broker(
            EventType::IntentApproved,
            user,
            ub,
            EventPayload::IntentApproved {
                symbol: "NSE:X".to_string(),
                qty: 4,
                order_type: crate::types::OrderType::Limit,
                limit_price: Some(2450.0),
            },
        );
        event.seq = Some(seq);
        event
    }

    #[tokio::test]
    async fn test_scope_filtering() {
        let hub = BroadcastHub::new(&hub_cfg());
        let (tx1, mut rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        let s1 = hub.register_session("u1", tx1).await;
        let s2 = hub.register_session("u2", tx2).await;
        hub.subscribe_session(s1, vec![], vec!["ub1".to_string()], None).await;
        hub.subscribe_session(s2, vec![], vec!["ub9".to_string()], None).await;

        let mut buffer: VecDeque<Event> =
            vec![global_event(1), user_broker_event(2, "u1", "ub1")].into();
        hub.flush(&mut buffer).await;

        match rx1.recv().await.unwrap() {
            ServerFrame::Batch { events } => {
                assert_eq!(events.len(), 2);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        // u2 sees only the GLOBAL event
        match rx2.recv().await.unwrap() {
            ServerFrame::Batch { events } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].seq, Some(1));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_topic_narrowing() {
        let hub = BroadcastHub::new(&hub_cfg());
        let (tx, mut rx) = mpsc::channel(16);
        let sid = hub.register_session("u1", tx).await;
        hub.subscribe_session(sid, vec!["SIGNAL_EXPIRED".to_string()], vec![], None).await;

        let mut buffer: VecDeque<Event> =
            vec![global_event(1), user_broker_event(2, "u1", "ub1")].into();
        hub.flush(&mut buffer).await;

        match rx.recv().await.unwrap() {
            ServerFrame::Batch { events } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].event_type, EventType::SignalExpired);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overflow_keeps_newest_and_resyncs() {
        let hub = BroadcastHub::new(&hub_cfg());
        let (tx, mut rx) = mpsc::channel(16);
        let sid = hub.register_session("u1", tx).await;
        hub.subscribe_session(sid, vec![], vec![], None).await;

        // Simulate intake overflow: capacity 4, push 6
        let mut buffer: VecDeque<Event> = VecDeque::new();
        for seq in 1..=6 {
            if buffer.len() >= 4 {
                buffer.pop_front();
                hub.mark_all_resync().await;
            }
            buffer.push_back(global_event(seq));
        }
        hub.flush(&mut buffer).await;

        // Resync precedes the surviving batch
        match rx.recv().await.unwrap() {
            ServerFrame::Resync { .. } => {}
            other => panic!("expected resync, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ServerFrame::Batch { events } => {
                let seqs: Vec<i64> = events.iter().filter_map(|e| e.seq).collect();
                assert_eq!(seqs, vec![3, 4, 5, 6]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
