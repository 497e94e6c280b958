/// Durable candle rows; duplicate closes collapse to an upsert
use rusqlite::params;

use super::{parse_ts_col, ts, Store};
use crate::error::Result;
use crate::types::{Candle, Timeframe};

impl Store {
    pub fn upsert_candle(&self, candle: &Candle) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO candles (symbol, timeframe, start_time, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(symbol, timeframe, start_time) DO UPDATE SET
                 open = excluded.open,
                 high = excluded.high,
                 low = excluded.low,
                 close = excluded.close,
                 volume = excluded.volume",
            params![
                candle.symbol,
                candle.timeframe.as_str(),
                ts(candle.start_time),
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
            ],
        )?;
        Ok(())
    }

    /// Most recent `n` candles in ascending start-time order
    pub fn recent_candles(&self, symbol: &str, timeframe: Timeframe, n: usize) -> Result<Vec<Candle>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, timeframe, start_time, open, high, low, close, volume
             FROM candles WHERE symbol = ?1 AND timeframe = ?2
             ORDER BY start_time DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![symbol, timeframe.as_str(), n as i64], |row| {
            let tf_str: String = row.get(1)?;
            let start_str: String = row.get(2)?;
            Ok(Candle {
                symbol: row.get(0)?,
                timeframe: Timeframe::from_str(&tf_str)
                    .ok_or_else(|| super::bad_column(1, format!("unknown timeframe {}", tf_str)))?,
                start_time: parse_ts_col(2, &start_str)?,
                open: row.get(3)?,
                high: row.get(4)?,
                low: row.get(5)?,
                close: row.get(6)?,
                volume: row.get(7)?,
            })
        })?;
        let mut candles: Vec<Candle> = rows.collect::<rusqlite::Result<_>>()?;
        candles.reverse();
        Ok(candles)
    }
}
