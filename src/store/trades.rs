/// Trade rows with optimistic row-version concurrency.
/// Only the trade manager calls the write paths here.
use chrono::{DateTime, Utc};
use rusqlite::params;

use super::signals::optional;
use super::{parse_ts_col, parse_ts_opt_col, ts, ts_opt, Store};
use crate::error::Result;
use crate::types::{Direction, ExitReason, Trade, TradeStatus};

/// Outcome of the idempotent insert keyed by intent_id
#[derive(Debug, Clone)]
pub enum TradeInsert {
    Inserted(Trade),
    /// A row for this intent already exists; returned unchanged
    Existing(Trade),
}

impl Store {
    pub fn insert_trade(&self, trade: &Trade) -> Result<TradeInsert> {
        {
            let conn = self.lock();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO trades (trade_id, intent_id, client_order_id, broker_order_id,
                     user_id, user_broker_id, signal_id, symbol, direction, trade_number, status,
                     entry_price, entry_qty, entry_value, entry_timestamp,
                     exit_target_price, exit_stop_price,
                     trailing_active, trailing_extremum, trailing_stop_price,
                     exit_price, exit_timestamp, exit_reason, realized_pnl, realized_log_return,
                     last_broker_update_at, created_at, updated_at, row_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)",
                params![
                    trade.trade_id,
                    trade.intent_id,
                    trade.client_order_id,
                    trade.broker_order_id,
                    trade.user_id,
                    trade.user_broker_id,
                    trade.signal_id,
                    trade.symbol,
                    trade.direction.as_str(),
                    trade.trade_number,
                    trade.status.as_str(),
                    trade.entry_price,
                    trade.entry_qty,
                    trade.entry_value,
                    ts_opt(trade.entry_timestamp),
                    trade.exit_target_price,
                    trade.exit_stop_price,
                    trade.trailing_active as i64,
                    trade.trailing_extremum,
                    trade.trailing_stop_price,
                    trade.exit_price,
                    ts_opt(trade.exit_timestamp),
                    trade.exit_reason.map(|r| r.as_str().to_string()),
                    trade.realized_pnl,
                    trade.realized_log_return,
                    ts_opt(trade.last_broker_update_at),
                    ts(trade.created_at),
                    ts(trade.updated_at),
                    trade.row_version,
                ],
            )?;
            if inserted == 1 {
                return Ok(TradeInsert::Inserted(trade.clone()));
            }
        }
        let existing = self
            .get_trade_by_intent(&trade.intent_id)?
            .ok_or_else(|| crate::error::EngineError::Internal("trade insert conflict without row".to_string()))?;
        Ok(TradeInsert::Existing(existing))
    }

    /// Compare-and-swap full-row update: succeeds only when the stored
    /// row_version still equals `trade.row_version`, and bumps it by one.
    pub fn cas_update_trade(&self, trade: &Trade) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE trades SET
                 broker_order_id = ?1, status = ?2,
                 entry_price = ?3, entry_value = ?4, entry_timestamp = ?5,
                 trailing_active = ?6, trailing_extremum = ?7, trailing_stop_price = ?8,
                 exit_price = ?9, exit_timestamp = ?10, exit_reason = ?11,
                 realized_pnl = ?12, realized_log_return = ?13,
                 last_broker_update_at = ?14, updated_at = ?15,
                 row_version = row_version + 1
             WHERE trade_id = ?16 AND row_version = ?17",
            params![
                trade.broker_order_id,
                trade.status.as_str(),
                trade.entry_price,
                trade.entry_value,
                ts_opt(trade.entry_timestamp),
                trade.trailing_active as i64,
                trade.trailing_extremum,
                trade.trailing_stop_price,
                trade.exit_price,
                ts_opt(trade.exit_timestamp),
                trade.exit_reason.map(|r| r.as_str().to_string()),
                trade.realized_pnl,
                trade.realized_log_return,
                ts_opt(trade.last_broker_update_at),
                ts(trade.updated_at),
                trade.trade_id,
                trade.row_version,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Conditional rejection: only rows still in CREATED are affected
    pub fn reject_trade_by_intent(&self, intent_id: &str, updated_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE trades SET status = 'REJECTED', updated_at = ?1, row_version = row_version + 1
             WHERE intent_id = ?2 AND status = 'CREATED'",
            params![ts(updated_at), intent_id],
        )?;
        Ok(changed == 1)
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<Option<Trade>> {
        let conn = self.lock();
        optional(conn.query_row(
            &format!("SELECT {} FROM trades WHERE trade_id = ?1", TRADE_COLS),
            params![trade_id],
            trade_from_row,
        ))
    }

    pub fn get_trade_by_intent(&self, intent_id: &str) -> Result<Option<Trade>> {
        let conn = self.lock();
        optional(conn.query_row(
            &format!("SELECT {} FROM trades WHERE intent_id = ?1", TRADE_COLS),
            params![intent_id],
            trade_from_row,
        ))
    }

    pub fn get_trade_by_client_order(&self, client_order_id: &str) -> Result<Option<Trade>> {
        let conn = self.lock();
        optional(conn.query_row(
            &format!("SELECT {} FROM trades WHERE client_order_id = ?1", TRADE_COLS),
            params![client_order_id],
            trade_from_row,
        ))
    }

    pub fn open_trades_for_symbol(&self, symbol: &str) -> Result<Vec<Trade>> {
        self.trades_where("symbol = ?1 AND status = 'OPEN'", params![symbol])
    }

    pub fn open_trades(&self) -> Result<Vec<Trade>> {
        self.trades_where("status = 'OPEN'", params![])
    }

    pub fn open_trades_for_user_broker(&self, user_broker_id: &str) -> Result<Vec<Trade>> {
        self.trades_where("user_broker_id = ?1 AND status = 'OPEN'", params![user_broker_id])
    }

    /// Non-terminal entry-side trades whose broker view is stale
    pub fn trades_awaiting_broker(&self, stale_before: DateTime<Utc>) -> Result<Vec<Trade>> {
        self.trades_where(
            "status IN ('CREATED', 'PENDING')
               AND (last_broker_update_at IS NULL OR last_broker_update_at < ?1)",
            params![ts(stale_before)],
        )
    }

    /// Active non-rejected rows for (user, symbol); trade_number = this + 1
    pub fn count_active_trades(&self, user_id: &str, symbol: &str) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades
             WHERE user_id = ?1 AND symbol = ?2
               AND status NOT IN ('REJECTED', 'CANCELLED', 'TIMEOUT', 'CLOSED')",
            params![user_id, symbol],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_open_trades_for_user_broker(&self, user_broker_id: &str) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades
             WHERE user_broker_id = ?1 AND status NOT IN ('REJECTED', 'CANCELLED', 'TIMEOUT', 'CLOSED')",
            params![user_broker_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Lifetime realized P&L for one user-broker
    pub fn realized_pnl_total(&self, user_broker_id: &str) -> Result<f64> {
        let conn = self.lock();
        let total: Option<f64> = conn.query_row(
            "SELECT SUM(realized_pnl) FROM trades WHERE user_broker_id = ?1 AND status = 'CLOSED'",
            params![user_broker_id],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0.0))
    }

    /// When the user-broker last closed a losing trade; drives the cooldown gate
    pub fn last_losing_close(&self, user_broker_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(exit_timestamp) FROM trades
             WHERE user_broker_id = ?1 AND status = 'CLOSED' AND realized_pnl < 0",
            params![user_broker_id],
            |row| row.get(0),
        )?;
        match raw {
            Some(s) => Ok(Some(super::parse_ts(&s)?)),
            None => Ok(None),
        }
    }

    /// Sum of realized P&L closed at or after `since` for one user-broker
    pub fn realized_pnl_since(&self, user_broker_id: &str, since: DateTime<Utc>) -> Result<f64> {
        let conn = self.lock();
        let total: Option<f64> = conn.query_row(
            "SELECT SUM(realized_pnl) FROM trades
             WHERE user_broker_id = ?1 AND status = 'CLOSED' AND exit_timestamp >= ?2",
            params![user_broker_id, ts(since)],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0.0))
    }

    fn trades_where(&self, clause: &str, args: impl rusqlite::Params) -> Result<Vec<Trade>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM trades WHERE {} ORDER BY created_at ASC",
            TRADE_COLS, clause
        ))?;
        let rows = stmt.query_map(args, trade_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }
}

const TRADE_COLS: &str = "trade_id, intent_id, client_order_id, broker_order_id, user_id, user_broker_id, \
    signal_id, symbol, direction, trade_number, status, entry_price, entry_qty, entry_value, \
    entry_timestamp, exit_target_price, exit_stop_price, trailing_active, trailing_extremum, \
    trailing_stop_price, exit_price, exit_timestamp, exit_reason, realized_pnl, realized_log_return, \
    last_broker_update_at, created_at, updated_at, row_version";

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    let direction: String = row.get(8)?;
    let status: String = row.get(10)?;
    let exit_reason: Option<String> = row.get(22)?;
    let created: String = row.get(26)?;
    let updated: String = row.get(27)?;
    let trailing: i64 = row.get(17)?;
    Ok(Trade {
        trade_id: row.get(0)?,
        intent_id: row.get(1)?,
        client_order_id: row.get(2)?,
        broker_order_id: row.get(3)?,
        user_id: row.get(4)?,
        user_broker_id: row.get(5)?,
        signal_id: row.get(6)?,
        symbol: row.get(7)?,
        direction: Direction::from_str(&direction)
            .ok_or_else(|| super::bad_column(8, format!("unknown direction {}", direction)))?,
        trade_number: row.get(9)?,
        status: TradeStatus::from_str(&status)
            .ok_or_else(|| super::bad_column(10, format!("unknown status {}", status)))?,
        entry_price: row.get(11)?,
        entry_qty: row.get(12)?,
        entry_value: row.get(13)?,
        entry_timestamp: parse_ts_opt_col(14, row.get(14)?)?,
        exit_target_price: row.get(15)?,
        exit_stop_price: row.get(16)?,
        trailing_active: trailing != 0,
        trailing_extremum: row.get(18)?,
        trailing_stop_price: row.get(19)?,
        exit_price: row.get(20)?,
        exit_timestamp: parse_ts_opt_col(21, row.get(21)?)?,
        exit_reason: match exit_reason {
            Some(r) => Some(
                ExitReason::from_str(&r)
                    .ok_or_else(|| super::bad_column(22, format!("unknown exit reason {}", r)))?,
            ),
            None => None,
        },
        realized_pnl: row.get(23)?,
        realized_log_return: row.get(24)?,
        last_broker_update_at: parse_ts_opt_col(25, row.get(25)?)?,
        created_at: parse_ts_col(26, &created)?,
        updated_at: parse_ts_col(27, &updated)?,
        row_version: row.get(28)?,
    })
}

#[cfg(test)]
pub(crate) fn sample_trade(trade_id: &str, intent_id: &str) -> Trade {
    let now = Utc::now();
    Trade {
        trade_id: trade_id.to_string(),
        intent_id: intent_id.to_string(),
        client_order_id: intent_id.to_string(),
        broker_order_id: None,
        user_id: "u1".to_string(),
        user_broker_id: "ub1".to_string(),
        signal_id: "sig1".to_string(),
        symbol: "NSE:X".to_string(),
        direction: Direction::Buy,
        trade_number: 1,
        status: TradeStatus::Created,
        entry_price: None,
        entry_qty: 4,
        entry_value: None,
        entry_timestamp: None,
        exit_target_price: 2500.0,
        exit_stop_price: 2400.0,
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent_on_intent() {
        let store = Store::open_in_memory().unwrap();
        let trade = sample_trade("t1", "i1");
        match store.insert_trade(&trade).unwrap() {
            TradeInsert::Inserted(_) => {}
            TradeInsert::Existing(_) => panic!("first insert must insert"),
        }

        let mut again = sample_trade("t-other", "i1");
        again.entry_qty = 99;
        match store.insert_trade(&again).unwrap() {
            TradeInsert::Existing(existing) => {
                assert_eq!(existing.trade_id, "t1");
                assert_eq!(existing.entry_qty, 4);
            }
            TradeInsert::Inserted(_) => panic!("second insert must return existing"),
        }
    }

    #[test]
    fn test_cas_first_writer_wins() {
        let store = Store::open_in_memory().unwrap();
        let trade = sample_trade("t1", "i1");
        store.insert_trade(&trade).unwrap();

        let mut a = store.get_trade("t1").unwrap().unwrap();
        let mut b = a.clone();

        a.status = TradeStatus::Pending;
        a.broker_order_id = Some("B100".to_string());
        assert!(store.cas_update_trade(&a).unwrap());

        // Second writer holds a stale version
        b.status = TradeStatus::Cancelled;
        assert!(!store.cas_update_trade(&b).unwrap());

        let current = store.get_trade("t1").unwrap().unwrap();
        assert_eq!(current.status, TradeStatus::Pending);
        assert_eq!(current.row_version, 2);
    }

    #[test]
    fn test_reject_by_intent_only_hits_created() {
        let store = Store::open_in_memory().unwrap();
        store.insert_trade(&sample_trade("t1", "i1")).unwrap();
        assert!(store.reject_trade_by_intent("i1", Utc::now()).unwrap());
        // Already rejected: conditional update misses
        assert!(!store.reject_trade_by_intent("i1", Utc::now()).unwrap());
    }

    #[test]
    fn test_count_active_excludes_terminal() {
        let store = Store::open_in_memory().unwrap();
        store.insert_trade(&sample_trade("t1", "i1")).unwrap();
        store.insert_trade(&sample_trade("t2", "i2")).unwrap();
        assert_eq!(store.count_active_trades("u1", "NSE:X").unwrap(), 2);

        store.reject_trade_by_intent("i2", Utc::now()).unwrap();
        assert_eq!(store.count_active_trades("u1", "NSE:X").unwrap(), 1);
    }
}
