/// Market session clock: trading calendar, session bounds, period boundaries
use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::config::SessionConfig;
use crate::config::loader::parse_hhmm;
use crate::error::Result;
use crate::types::Timeframe;

#[derive(Debug, Clone)]
pub struct SessionClock {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    holidays: HashSet<NaiveDate>,
    weekend_trading: bool,
}

impl SessionClock {
    pub fn from_config(cfg: &SessionConfig) -> Result<Self> {
        let tz: Tz = cfg
            .timezone
            .parse()
            .map_err(|_| crate::error::EngineError::Config(format!("bad timezone {}", cfg.timezone)))?;
        Ok(SessionClock {
            tz,
            open: parse_hhmm(&cfg.open_time)?,
            close: parse_hhmm(&cfg.close_time)?,
            holidays: cfg.holidays.iter().copied().collect(),
            weekend_trading: cfg.weekend_trading,
        })
    }

    /// Weekday (unless the venue trades weekends) and not a holiday
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        let day_num = date.weekday().num_days_from_monday();
        (self.weekend_trading || day_num < 5) && !self.holidays.contains(&date)
    }

    /// Exchange-local calendar date of an instant; used as the signal day
    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.tz).date_naive()
    }

    /// Session open/close of the local date containing `ts`
    pub fn session_bounds(&self, ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let date = self.local_date(ts);
        (self.at_local(date, self.open), self.at_local(date, self.close))
    }

    pub fn is_market_open(&self, ts: DateTime<Utc>) -> bool {
        if !self.is_trading_day(self.local_date(ts)) {
            return false;
        }
        let (open, close) = self.session_bounds(ts);
        ts >= open && ts < close
    }

    /// Whole minutes until session close; negative after close
    pub fn minutes_to_close(&self, ts: DateTime<Utc>) -> i64 {
        let (_, close) = self.session_bounds(ts);
        (close - ts).num_minutes()
    }

    /// Session close of the local date containing `ts` (signal expiry anchor)
    pub fn eod(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.session_bounds(ts).1
    }

    /// Start of the candle period containing `ts`.
    ///
    /// 1m periods follow the calendar minute; 25m and 125m periods are
    /// anchored at the session open so the 375-minute session divides into
    /// 15 and 3 whole periods; daily periods start at the open.
    pub fn period_start(&self, timeframe: Timeframe, ts: DateTime<Utc>) -> DateTime<Utc> {
        match timeframe {
            Timeframe::M1 => {
                let local = ts.with_timezone(&self.tz);
                let floored = local
                    .date_naive()
                    .and_time(NaiveTime::from_hms_opt(local.hour(), local.minute(), 0).unwrap());
                match self.tz.from_local_datetime(&floored) {
                    LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
                    LocalResult::None => Utc.from_utc_datetime(&floored),
                }
            }
            Timeframe::M25 | Timeframe::M125 => {
                let (open, _) = self.session_bounds(ts);
                let n = timeframe.duration_minutes();
                let elapsed = (ts - open).num_minutes().max(0);
                open + Duration::minutes((elapsed / n) * n)
            }
            Timeframe::Daily => self.session_bounds(ts).0,
        }
    }

    /// Exclusive end of the period starting at `start`
    pub fn period_end(&self, timeframe: Timeframe, start: DateTime<Utc>) -> DateTime<Utc> {
        match timeframe {
            Timeframe::Daily => self.session_bounds(start).1,
            _ => start + Duration::minutes(timeframe.duration_minutes()),
        }
    }

    fn at_local(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        match self.tz.from_local_datetime(&date.and_time(time)) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
            LocalResult::None => Utc.from_utc_datetime(&date.and_time(time)),
        }
    }
}
