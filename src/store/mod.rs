/// Durable store: sqlite-backed source of truth for every aggregate.
/// Single bundled connection behind a mutex; WAL keeps readers cheap.
pub mod candles;
pub mod exits;
pub mod schema;
pub mod signals;
pub mod trades;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::{EngineError, Result};
use crate::events::types::{Event, EventScope, EventType};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::apply_schema(&conn)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::apply_schema(&conn)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Cheap reachability probe for the watchdog
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn verify_schema(&self) -> Result<()> {
        schema::verify_schema(&self.lock())
    }

    // -------------------------------------------------------------------
    // Event log (process-wide writer assigns seq)
    // -------------------------------------------------------------------

    /// Append to the durable log and return the assigned seq.
    /// Persistence completes before the caller may emit anywhere.
    pub fn append_event(&self, event: &Event) -> Result<i64> {
        let payload = serde_json::to_string(&event.payload)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events (event_type, scope, user_id, user_broker_id, signal_id, intent_id, trade_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.event_type.as_str(),
                event.scope.as_str(),
                event.user_id,
                event.user_broker_id,
                event.signal_id,
                event.intent_id,
                event.trade_id,
                payload,
                ts(event.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Ordered replay of persisted events strictly after `after_seq`
    pub fn events_after(&self, after_seq: i64, limit: usize) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT seq, event_type, scope, user_id, user_broker_id, signal_id, intent_id, trade_id, payload, created_at
             FROM events WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_seq, limit as i64], event_from_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn last_event_seq(&self) -> Result<i64> {
        let conn = self.lock();
        let seq: Option<i64> = conn.query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let type_str: String = row.get(1)?;
    let scope_str: String = row.get(2)?;
    let payload_str: String = row.get(8)?;
    let created_str: String = row.get(9)?;
    Ok(Event {
        seq: Some(row.get(0)?),
        event_type: EventType::from_str(&type_str)
            .ok_or_else(|| bad_column(1, format!("unknown event type {}", type_str)))?,
        scope: EventScope::from_str(&scope_str)
            .ok_or_else(|| bad_column(2, format!("unknown scope {}", scope_str)))?,
        user_id: row.get(3)?,
        user_broker_id: row.get(4)?,
        signal_id: row.get(5)?,
        intent_id: row.get(6)?,
        trade_id: row.get(7)?,
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| bad_column(8, format!("payload decode: {}", e)))?,
        created_at: parse_ts_col(9, &created_str)?,
    })
}

// -----------------------------------------------------------------------
// Column codecs shared by the per-aggregate store modules
// -----------------------------------------------------------------------

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn ts_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Persist(format!("bad timestamp '{}': {}", s, e)))
}

pub(crate) fn parse_ts_col(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| bad_column(idx, format!("bad timestamp: {}", e)))
}

pub(crate) fn parse_ts_opt_col(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match s {
        Some(v) => Ok(Some(parse_ts_col(idx, &v)?)),
        None => Ok(None),
    }
}

pub(crate) fn date_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date_col(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| bad_column(idx, format!("bad date: {}", e)))
}

pub(crate) fn bad_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::EventPayload;

    #[test]
    fn test_append_assigns_monotone_seq() {
        let store = Store::open_in_memory().unwrap();
        let e1 = Event::global(
            EventType::EngineStarted,
            EventPayload::EngineStarted {
                release: "BETA".to_string(),
                symbols: vec!["NSE:X".to_string()],
            },
        );
        let e2 = Event::global(
            EventType::FeedConnected,
            EventPayload::FeedConnected {
                url: "wss://feed".to_string(),
            },
        );
        let s1 = store.append_event(&e1).unwrap();
        let s2 = store.append_event(&e2).unwrap();
        assert!(s2 > s1);
        assert_eq!(store.last_event_seq().unwrap(), s2);
    }

    #[test]
    fn test_replay_matches_persisted_content() {
        let store = Store::open_in_memory().unwrap();
        let event = Event::for_user(
            EventType::IntentRejected,
            "u1",
            EventPayload::IntentRejected {
                symbol: "NSE:X".to_string(),
                reasons: vec!["LOSS_LIMIT".to_string()],
            },
        );
        let seq = store.append_event(&event).unwrap();

        let replayed = store.events_after(0, 100).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].seq, Some(seq));
        assert_eq!(replayed[0].event_type, EventType::IntentRejected);
        assert_eq!(replayed[0].user_id.as_deref(), Some("u1"));

        // Strictly-after semantics
        assert!(store.events_after(seq, 100).unwrap().is_empty());
    }

    #[test]
    fn test_schema_verifies() {
        let store = Store::open_in_memory().unwrap();
        store.verify_schema().unwrap();
    }

    #[test]
    fn test_reopen_preserves_log_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let seq = {
            let store = Store::open(&path).unwrap();
            store
                .append_event(&Event::global(
                    EventType::EngineStarted,
                    EventPayload::EngineStarted {
                        release: "BETA".to_string(),
                        symbols: vec![],
                    },
                ))
                .unwrap()
        };

        let reopened = Store::open(&path).unwrap();
        reopened.verify_schema().unwrap();
        assert_eq!(reopened.last_event_seq().unwrap(), seq);
        let events = reopened.events_after(0, 10).unwrap();
        assert_eq!(events[0].event_type, EventType::EngineStarted);
    }
}
