/// Exit signals and exit intents. Episode allocation lives here: the store
/// is the arbiter of the per-(trade, reason) cooldown.
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use super::signals::optional;
use super::{parse_ts_col, parse_ts_opt_col, ts, ts_opt, Store};
use crate::error::{EngineError, Result};
use crate::types::{ExitIntent, ExitIntentStatus, ExitReason, ExitSignal, OrderType};

impl Store {
    /// Allocate the next episode for (trade, reason) and persist the exit
    /// signal in one transaction. Fails with `ExitCooldownActive` when the
    /// previous detection of the same pair is younger than the cooldown.
    pub fn allocate_exit_episode(
        &self,
        trade_id: &str,
        reason: ExitReason,
        price: f64,
        detected_at: DateTime<Utc>,
        cooldown_seconds: i64,
    ) -> Result<ExitSignal> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(EngineError::from)?;

        let last: Option<(i64, String)> = tx
            .query_row(
                "SELECT episode_id, detected_at FROM exit_signals
                 WHERE trade_id = ?1 AND reason = ?2
                 ORDER BY episode_id DESC LIMIT 1",
                params![trade_id, reason.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(EngineError::from(other)),
            })?;

        let episode_id = match last {
            Some((last_episode, last_detected)) => {
                let last_at = super::parse_ts(&last_detected)?;
                if detected_at - last_at < Duration::seconds(cooldown_seconds) {
                    return Err(EngineError::ExitCooldownActive {
                        trade_id: trade_id.to_string(),
                        reason: reason.as_str().to_string(),
                    });
                }
                last_episode + 1
            }
            None => 1,
        };

        let exit_signal = ExitSignal {
            exit_signal_id: uuid::Uuid::new_v4().to_string(),
            trade_id: trade_id.to_string(),
            reason,
            episode_id,
            price,
            detected_at,
        };
        tx.execute(
            "INSERT INTO exit_signals (exit_signal_id, trade_id, reason, episode_id, price, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                exit_signal.exit_signal_id,
                exit_signal.trade_id,
                exit_signal.reason.as_str(),
                exit_signal.episode_id,
                exit_signal.price,
                ts(exit_signal.detected_at),
            ],
        )
        .map_err(EngineError::from)?;
        tx.commit().map_err(EngineError::from)?;
        Ok(exit_signal)
    }

    pub fn exit_signals_for_trade(&self, trade_id: &str) -> Result<Vec<ExitSignal>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT exit_signal_id, trade_id, reason, episode_id, price, detected_at
             FROM exit_signals WHERE trade_id = ?1 ORDER BY detected_at ASC",
        )?;
        let rows = stmt.query_map(params![trade_id], exit_signal_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    // -------------------------------------------------------------------
    // Exit intents
    // -------------------------------------------------------------------

    /// Persist the PENDING intent; false when the identity already exists
    pub fn insert_exit_intent(&self, intent: &ExitIntent) -> Result<bool> {
        let reasons = serde_json::to_string(&intent.rejection_reasons)?;
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO exit_intents (exit_intent_id, exit_signal_id, trade_id, user_broker_id,
                 reason, episode_id, status, order_type, limit_price, client_order_id, broker_order_id,
                 rejection_reasons, placed_at, filled_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                intent.exit_intent_id,
                intent.exit_signal_id,
                intent.trade_id,
                intent.user_broker_id,
                intent.reason.as_str(),
                intent.episode_id,
                intent.status.as_str(),
                intent.order_type.as_str(),
                intent.limit_price,
                intent.client_order_id,
                intent.broker_order_id,
                reasons,
                ts_opt(intent.placed_at),
                ts_opt(intent.filled_at),
                ts(intent.created_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_exit_intent(&self, exit_intent_id: &str) -> Result<Option<ExitIntent>> {
        let conn = self.lock();
        optional(conn.query_row(
            &format!("SELECT {} FROM exit_intents WHERE exit_intent_id = ?1", EXIT_INTENT_COLS),
            params![exit_intent_id],
            exit_intent_from_row,
        ))
    }

    /// Another PENDING/APPROVED/PLACED/FILLED intent already covers the trade
    pub fn live_exit_intent_exists(&self, trade_id: &str, excluding: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM exit_intents
             WHERE trade_id = ?1 AND exit_intent_id <> ?2
               AND status IN ('PENDING', 'APPROVED', 'PLACED', 'FILLED')",
            params![trade_id, excluding],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Qualifier outcome: PENDING -> APPROVED/REJECTED with order params
    pub fn qualify_exit_intent(
        &self,
        exit_intent_id: &str,
        status: ExitIntentStatus,
        order_type: OrderType,
        limit_price: Option<f64>,
        rejection_reasons: &[String],
    ) -> Result<bool> {
        let reasons = serde_json::to_string(rejection_reasons)?;
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE exit_intents
             SET status = ?1, order_type = ?2, limit_price = ?3, rejection_reasons = ?4
             WHERE exit_intent_id = ?5 AND status = 'PENDING'",
            params![status.as_str(), order_type.as_str(), limit_price, reasons, exit_intent_id],
        )?;
        Ok(changed == 1)
    }

    /// Atomic APPROVED -> PLACED; loser of the race sees false
    pub fn mark_exit_intent_placed(
        &self,
        exit_intent_id: &str,
        placed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE exit_intents SET status = 'PLACED', placed_at = ?1
             WHERE exit_intent_id = ?2 AND status = 'APPROVED'",
            params![ts(placed_at), exit_intent_id],
        )?;
        Ok(changed == 1)
    }

    pub fn set_exit_intent_broker_order(&self, exit_intent_id: &str, broker_order_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE exit_intents SET broker_order_id = ?1 WHERE exit_intent_id = ?2",
            params![broker_order_id, exit_intent_id],
        )?;
        Ok(())
    }

    pub fn mark_exit_intent_filled(&self, exit_intent_id: &str, filled_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE exit_intents SET status = 'FILLED', filled_at = ?1
             WHERE exit_intent_id = ?2 AND status = 'PLACED'",
            params![ts(filled_at), exit_intent_id],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_exit_intent_failed(&self, exit_intent_id: &str, reason: &str) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE exit_intents
             SET status = 'FAILED',
                 rejection_reasons = json_insert(rejection_reasons, '$[#]', ?1)
             WHERE exit_intent_id = ?2 AND status IN ('APPROVED', 'PLACED')",
            params![reason, exit_intent_id],
        )?;
        Ok(changed == 1)
    }

    pub fn exit_intents_with_status(&self, status: ExitIntentStatus) -> Result<Vec<ExitIntent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM exit_intents WHERE status = ?1 ORDER BY created_at ASC",
            EXIT_INTENT_COLS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], exit_intent_from_row)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }
}

const EXIT_INTENT_COLS: &str = "exit_intent_id, exit_signal_id, trade_id, user_broker_id, reason, \
    episode_id, status, order_type, limit_price, client_order_id, broker_order_id, rejection_reasons, \
    placed_at, filled_at, created_at";

fn exit_signal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExitSignal> {
    let reason: String = row.get(2)?;
    let detected: String = row.get(5)?;
    Ok(ExitSignal {
        exit_signal_id: row.get(0)?,
        trade_id: row.get(1)?,
        reason: ExitReason::from_str(&reason)
            .ok_or_else(|| super::bad_column(2, format!("unknown exit reason {}", reason)))?,
        episode_id: row.get(3)?,
        price: row.get(4)?,
        detected_at: parse_ts_col(5, &detected)?,
    })
}

fn exit_intent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExitIntent> {
    let reason: String = row.get(4)?;
    let status: String = row.get(6)?;
    let order_type: String = row.get(7)?;
    let reasons: String = row.get(11)?;
    let created: String = row.get(14)?;
    Ok(ExitIntent {
        exit_intent_id: row.get(0)?,
        exit_signal_id: row.get(1)?,
        trade_id: row.get(2)?,
        user_broker_id: row.get(3)?,
        reason: ExitReason::from_str(&reason)
            .ok_or_else(|| super::bad_column(4, format!("unknown exit reason {}", reason)))?,
        episode_id: row.get(5)?,
        status: ExitIntentStatus::from_str(&status)
            .ok_or_else(|| super::bad_column(6, format!("unknown status {}", status)))?,
        order_type: OrderType::from_str(&order_type)
            .ok_or_else(|| super::bad_column(7, format!("unknown order type {}", order_type)))?,
        limit_price: row.get(8)?,
        client_order_id: row.get(9)?,
        broker_order_id: row.get(10)?,
        rejection_reasons: serde_json::from_str(&reasons)
            .map_err(|e| super::bad_column(11, format!("reasons decode: {}", e)))?,
        placed_at: parse_ts_opt_col(12, row.get(12)?)?,
        filled_at: parse_ts_opt_col(13, row.get(13)?)?,
        created_at: parse_ts_col(14, &created)?,
    })
}
