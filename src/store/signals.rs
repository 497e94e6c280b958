/// Signal, delivery and trade-intent rows
use rusqlite::params;

use super::{date_str, parse_date_col, parse_ts_col, ts, Store};
use crate::error::Result;
use crate::types::{
    ConfluenceType, DeliveryStatus, Direction, OrderType, Signal, SignalDelivery, SignalStatus,
    StrengthBucket, TradeIntent,
};

/// Outcome of persisting a candidate under the identity key
#[derive(Debug, Clone)]
pub enum SignalUpsert {
    /// New signal row; caller emits SIGNAL_PUBLISHED
    Inserted(Signal),
    /// Active signal already covers the zone; last_seen_at advanced, no emit
    Touched(Signal),
}

impl Store {
    /// Persist under (symbol, confluence, signal_day, floor, ceiling).
    /// An existing PUBLISHED row absorbs the candidate.
    pub fn publish_or_touch_signal(&self, signal: &Signal) -> Result<SignalUpsert> {
        let conn = self.lock();
        let existing: Option<Signal> = conn
            .query_row(
                &format!(
                    "SELECT {} FROM signals
                     WHERE symbol = ?1 AND confluence = ?2 AND signal_day = ?3
                       AND effective_floor = ?4 AND effective_ceiling = ?5
                       AND status = 'PUBLISHED'",
                    SIGNAL_COLS
                ),
                params![
                    signal.symbol,
                    signal.confluence.as_str(),
                    date_str(signal.signal_day),
                    signal.effective_floor,
                    signal.effective_ceiling,
                ],
                signal_from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if let Some(mut row) = existing {
            conn.execute(
                "UPDATE signals SET last_seen_at = ?1 WHERE signal_id = ?2",
                params![ts(signal.last_seen_at), row.signal_id],
            )?;
            row.last_seen_at = signal.last_seen_at;
            return Ok(SignalUpsert::Touched(row));
        }

        conn.execute(
            "INSERT INTO signals (signal_id, symbol, direction, confluence, score, strength,
                 htf_low, htf_high, itf_low, itf_high, ltf_low, ltf_high,
                 effective_floor, effective_ceiling, ref_price, p_win, kelly,
                 generated_at, expires_at, last_seen_at, status, signal_day)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                signal.signal_id,
                signal.symbol,
                signal.direction.as_str(),
                signal.confluence.as_str(),
                signal.score,
                signal.strength.as_str(),
                signal.htf_low,
                signal.htf_high,
                signal.itf_low,
                signal.itf_high,
                signal.ltf_low,
                signal.ltf_high,
                signal.effective_floor,
                signal.effective_ceiling,
                signal.ref_price,
                signal.p_win,
                signal.kelly,
                ts(signal.generated_at),
                ts(signal.expires_at),
                ts(signal.last_seen_at),
                signal.status.as_str(),
                date_str(signal.signal_day),
            ],
        )?;
        Ok(SignalUpsert::Inserted(signal.clone()))
    }

    pub fn get_signal(&self, signal_id: &str) -> Result<Option<Signal>> {
        let conn = self.lock();
        optional(conn.query_row(
            &format!("SELECT {} FROM signals WHERE signal_id = ?1", SIGNAL_COLS),
            params![signal_id],
            signal_from_row,
        ))
    }

    pub fn active_signals(&self) -> Result<Vec<Signal>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM signals WHERE status = 'PUBLISHED' ORDER BY generated_at ASC",
            SIGNAL_COLS
        ))?;
        let rows = stmt.query_map([], signal_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// Flip a PUBLISHED signal to EXPIRED/INVALIDATED; returns whether it changed
    pub fn retire_signal(&self, signal_id: &str, status: SignalStatus) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE signals SET status = ?1 WHERE signal_id = ?2 AND status = 'PUBLISHED'",
            params![status.as_str(), signal_id],
        )?;
        Ok(changed == 1)
    }

    // -------------------------------------------------------------------
    // Deliveries
    // -------------------------------------------------------------------

    /// Insert the fan-out record; false when (signal, user-broker) already exists
    pub fn insert_delivery(&self, delivery: &SignalDelivery) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO signal_deliveries (delivery_id, signal_id, user_broker_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                delivery.delivery_id,
                delivery.signal_id,
                delivery.user_broker_id,
                delivery.status.as_str(),
                ts(delivery.created_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn pending_deliveries(&self) -> Result<Vec<SignalDelivery>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT delivery_id, signal_id, user_broker_id, status, created_at
             FROM signal_deliveries WHERE status = 'PENDING' ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], delivery_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    pub fn set_delivery_status(&self, delivery_id: &str, status: DeliveryStatus) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE signal_deliveries SET status = ?1 WHERE delivery_id = ?2",
            params![status.as_str(), delivery_id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Trade intents
    // -------------------------------------------------------------------

    /// Persist the qualification outcome; false when intent_id already exists
    pub fn insert_intent(&self, intent: &TradeIntent) -> Result<bool> {
        let reasons = serde_json::to_string(&intent.rejection_reasons)?;
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO trade_intents (intent_id, signal_id, user_broker_id, validation_passed,
                 approved_qty, order_type, limit_price, product_type, rejection_reasons, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                intent.intent_id,
                intent.signal_id,
                intent.user_broker_id,
                intent.validation_passed as i64,
                intent.approved_qty,
                intent.order_type.as_str(),
                intent.limit_price,
                intent.product_type,
                reasons,
                ts(intent.created_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_intent(&self, intent_id: &str) -> Result<Option<TradeIntent>> {
        let conn = self.lock();
        optional(conn.query_row(
            &format!("SELECT {} FROM trade_intents WHERE intent_id = ?1", INTENT_COLS),
            params![intent_id],
            intent_from_row,
        ))
    }

    /// Approved intents with no trade row yet; entry-executor startup healing
    pub fn approved_intents_without_trade(&self) -> Result<Vec<TradeIntent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM trade_intents i
             LEFT JOIN trades t ON t.intent_id = i.intent_id
             WHERE i.validation_passed = 1 AND t.trade_id IS NULL
             ORDER BY i.created_at ASC",
            INTENT_COLS_QUALIFIED
        ))?;
        let rows = stmt.query_map([], intent_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }
}

const SIGNAL_COLS: &str = "signal_id, symbol, direction, confluence, score, strength, \
    htf_low, htf_high, itf_low, itf_high, ltf_low, ltf_high, \
    effective_floor, effective_ceiling, ref_price, p_win, kelly, \
    generated_at, expires_at, last_seen_at, status, signal_day";

const INTENT_COLS: &str = "intent_id, signal_id, user_broker_id, validation_passed, \
    approved_qty, order_type, limit_price, product_type, rejection_reasons, created_at";

const INTENT_COLS_QUALIFIED: &str = "i.intent_id, i.signal_id, i.user_broker_id, i.validation_passed, \
    i.approved_qty, i.order_type, i.limit_price, i.product_type, i.rejection_reasons, i.created_at";

fn signal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Signal> {
    let direction: String = row.get(2)?;
    let confluence: String = row.get(3)?;
    let strength: String = row.get(5)?;
    let generated: String = row.get(17)?;
    let expires: String = row.get(18)?;
    let last_seen: String = row.get(19)?;
    let status: String = row.get(20)?;
    let day: String = row.get(21)?;
    Ok(Signal {
        signal_id: row.get(0)?,
        symbol: row.get(1)?,
        direction: Direction::from_str(&direction)
            .ok_or_else(|| super::bad_column(2, format!("unknown direction {}", direction)))?,
        confluence: ConfluenceType::from_str(&confluence)
            .ok_or_else(|| super::bad_column(3, format!("unknown confluence {}", confluence)))?,
        score: row.get(4)?,
        strength: StrengthBucket::from_str(&strength)
            .ok_or_else(|| super::bad_column(5, format!("unknown strength {}", strength)))?,
        htf_low: row.get(6)?,
        htf_high: row.get(7)?,
        itf_low: row.get(8)?,
        itf_high: row.get(9)?,
        ltf_low: row.get(10)?,
        ltf_high: row.get(11)?,
        effective_floor: row.get(12)?,
        effective_ceiling: row.get(13)?,
        ref_price: row.get(14)?,
        p_win: row.get(15)?,
        kelly: row.get(16)?,
        generated_at: parse_ts_col(17, &generated)?,
        expires_at: parse_ts_col(18, &expires)?,
        last_seen_at: parse_ts_col(19, &last_seen)?,
        status: SignalStatus::from_str(&status)
            .ok_or_else(|| super::bad_column(20, format!("unknown status {}", status)))?,
        signal_day: parse_date_col(21, &day)?,
    })
}

fn delivery_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignalDelivery> {
    let status: String = row.get(3)?;
    let created: String = row.get(4)?;
    Ok(SignalDelivery {
        delivery_id: row.get(0)?,
        signal_id: row.get(1)?,
        user_broker_id: row.get(2)?,
        status: DeliveryStatus::from_str(&status)
            .ok_or_else(|| super::bad_column(3, format!("unknown status {}", status)))?,
        created_at: parse_ts_col(4, &created)?,
    })
}

fn intent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeIntent> {
    let order_type: String = row.get(5)?;
    let reasons: String = row.get(8)?;
    let created: String = row.get(9)?;
    let passed: i64 = row.get(3)?;
    Ok(TradeIntent {
        intent_id: row.get(0)?,
        signal_id: row.get(1)?,
        user_broker_id: row.get(2)?,
        validation_passed: passed != 0,
        approved_qty: row.get(4)?,
        order_type: OrderType::from_str(&order_type)
            .ok_or_else(|| super::bad_column(5, format!("unknown order type {}", order_type)))?,
        limit_price: row.get(6)?,
        product_type: row.get(7)?,
        rejection_reasons: serde_json::from_str(&reasons)
            .map_err(|e| super::bad_column(8, format!("reasons decode: {}", e)))?,
        created_at: parse_ts_col(9, &created)?,
    })
}

pub(crate) fn optional<T>(r: rusqlite::Result<T>) -> Result<Option<T>> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::round2;
    use chrono::{NaiveDate, Utc};

    fn sample_signal(floor: f64, ceiling: f64) -> Signal {
        let now = Utc::now();
        Signal {
            signal_id: uuid::Uuid::new_v4().to_string(),
            symbol: "NSE:X".to_string(),
            direction: Direction::Buy,
            confluence: ConfluenceType::Triple,
            score: 0.82,
            strength: StrengthBucket::Strong,
            htf_low: 2380.0,
            htf_high: 2520.0,
            itf_low: 2390.0,
            itf_high: 2510.0,
            ltf_low: 2400.0,
            ltf_high: 2500.0,
            effective_floor: round2(floor),
            effective_ceiling: round2(ceiling),
            ref_price: 2450.0,
            p_win: 0.6,
            kelly: 0.05,
            generated_at: now,
            expires_at: now + chrono::Duration::minutes(60),
            last_seen_at: now,
            status: SignalStatus::Published,
            signal_day: NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
        }
    }

    #[test]
    fn test_duplicate_signal_touches_not_inserts() {
        let store = Store::open_in_memory().unwrap();
        let first = sample_signal(2400.0, 2500.0);
        match store.publish_or_touch_signal(&first).unwrap() {
            SignalUpsert::Inserted(_) => {}
            SignalUpsert::Touched(_) => panic!("first publish must insert"),
        }

        let mut second = sample_signal(2400.0, 2500.0);
        second.last_seen_at = first.last_seen_at + chrono::Duration::seconds(30);
        match store.publish_or_touch_signal(&second).unwrap() {
            SignalUpsert::Touched(existing) => {
                assert_eq!(existing.signal_id, first.signal_id);
                assert_eq!(existing.last_seen_at, second.last_seen_at);
            }
            SignalUpsert::Inserted(_) => panic!("duplicate must touch"),
        }
        assert_eq!(store.active_signals().unwrap().len(), 1);
    }

    #[test]
    fn test_expired_signal_frees_identity() {
        let store = Store::open_in_memory().unwrap();
        let first = sample_signal(2400.0, 2500.0);
        store.publish_or_touch_signal(&first).unwrap();
        assert!(store.retire_signal(&first.signal_id, SignalStatus::Expired).unwrap());
        // Retiring twice is a no-op
        assert!(!store.retire_signal(&first.signal_id, SignalStatus::Expired).unwrap());

        match store.publish_or_touch_signal(&sample_signal(2400.0, 2500.0)).unwrap() {
            SignalUpsert::Inserted(_) => {}
            SignalUpsert::Touched(_) => panic!("identity must be free after expiry"),
        }
    }

    #[test]
    fn test_delivery_uniqueness() {
        let store = Store::open_in_memory().unwrap();
        let delivery = SignalDelivery {
            delivery_id: "d1".to_string(),
            signal_id: "sig1".to_string(),
            user_broker_id: "ub1".to_string(),
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
        };
        assert!(store.insert_delivery(&delivery).unwrap());
        let mut dup = delivery.clone();
        dup.delivery_id = "d2".to_string();
        assert!(!store.insert_delivery(&dup).unwrap());
    }

    #[test]
    fn test_intent_idempotency() {
        let store = Store::open_in_memory().unwrap();
        let intent = TradeIntent {
            intent_id: "i1".to_string(),
            signal_id: "sig1".to_string(),
            user_broker_id: "ub1".to_string(),
            validation_passed: true,
            approved_qty: 4,
            order_type: OrderType::Limit,
            limit_price: Some(2450.0),
            product_type: "DELIVERY".to_string(),
            rejection_reasons: vec![],
            created_at: Utc::now(),
        };
        assert!(store.insert_intent(&intent).unwrap());
        assert!(!store.insert_intent(&intent).unwrap());
        let loaded = store.get_intent("i1").unwrap().unwrap();
        assert_eq!(loaded.approved_qty, 4);
        assert!(loaded.validation_passed);
    }
}
