use std::collections::BTreeSet;

use chrono::NaiveDate;
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::errors::AppError;

/// Known trading dates, cached in memory and persisted in `trading_calendar`.
///
/// Queries outside the known range fail with [`AppError::CalendarStale`] rather than guessing.
#[derive(Debug, Default)]
pub struct TradingCalendar {
    dates: RwLock<BTreeSet<NaiveDate>>,
}

impl TradingCalendar {
    pub fn from_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: RwLock::new(dates.into_iter().collect()),
        }
    }

    /// Load every persisted trading date.
    pub fn load(conn: &Connection) -> Result<Self, AppError> {
        let mut stmt = conn.prepare("SELECT date FROM trading_calendar ORDER BY date")?;
        let dates = stmt
            .query_map([], |row| row.get::<_, NaiveDate>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        debug!("Loaded {} trading dates", dates.len());
        Ok(Self {
            dates: RwLock::new(dates),
        })
    }

    /// Persist freshly fetched dates and merge them into the cache. Returns how many were new.
    pub fn sync(&self, conn: &Connection, fetched: &[NaiveDate]) -> Result<usize, AppError> {
        let mut stmt = conn.prepare_cached("INSERT OR IGNORE INTO trading_calendar (date) VALUES (?1)")?;
        let mut added = 0;
        for date in fetched {
            added += stmt.execute(params![date])?;
        }
        self.dates.write().extend(fetched.iter().copied());
        info!("Trading calendar synced: {} fetched, {} new", fetched.len(), added);
        Ok(added)
    }

    /// First and last known trading dates.
    pub fn coverage(&self) -> Option<(NaiveDate, NaiveDate)> {
        let dates = self.dates.read();
        Some((*dates.first()?, *dates.last()?))
    }

    pub fn len(&self) -> usize {
        self.dates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.read().is_empty()
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> Result<bool, AppError> {
        let dates = self.dates.read();
        check_covered(&dates, date)?;
        Ok(dates.contains(&date))
    }

    pub fn last_trading_day_on_or_before(&self, date: NaiveDate) -> Result<NaiveDate, AppError> {
        let dates = self.dates.read();
        check_covered(&dates, date)?;
        dates
            .range(..=date)
            .next_back()
            .copied()
            .ok_or_else(|| AppError::Internal(format!("no trading day on or before {date}")))
    }

    /// Trading date `n` sessions before `date`, clamped to the first known date.
    pub fn nth_trading_day_before(&self, date: NaiveDate, n: usize) -> Result<NaiveDate, AppError> {
        let dates = self.dates.read();
        check_covered(&dates, date)?;
        let mut earlier = dates.range(..date).rev();
        let mut found = None;
        for _ in 0..n {
            match earlier.next() {
                Some(d) => found = Some(*d),
                None => break,
            }
        }
        Ok(found.unwrap_or(date))
    }

    /// Trading dates in `start..=end`.
    pub fn trading_days_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        if start > end {
            return Vec::new();
        }
        self.dates.read().range(start..=end).copied().collect()
    }
}

fn check_covered(dates: &BTreeSet<NaiveDate>, date: NaiveDate) -> Result<(), AppError> {
    match (dates.first(), dates.last()) {
        (Some(first), Some(last)) if *first <= date && date <= *last => Ok(()),
        (first, last) => Err(AppError::CalendarStale {
            date,
            first: first.copied(),
            last: last.copied(),
        }),
    }
}

/// Strip an ex-dividend / ex-rights session prefix (case-insensitive) from a display name.
///
/// The prefix is only removed when something remains after it.
pub fn strip_session_prefix<'a>(name: &'a str, prefixes: &[String]) -> &'a str {
    let trimmed = name.trim();
    for prefix in prefixes {
        let Some(head) = trimmed.get(..prefix.len()) else {
            continue;
        };
        if head.eq_ignore_ascii_case(prefix) && trimmed.len() > prefix.len() {
            return &trimmed[prefix.len()..];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::open_in_memory;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    /// Weekdays of June 2024 minus the 10th (a holiday).
    fn june() -> TradingCalendar {
        TradingCalendar::from_dates(
            (3..=28)
                .map(|day| d(6, day))
                .filter(|date| chrono::Datelike::weekday(date).number_from_monday() <= 5)
                .filter(|date| *date != d(6, 10)),
        )
    }

    #[test]
    fn test_weekend_and_holiday_are_not_trading_days() {
        let cal = june();
        assert!(cal.is_trading_day(d(6, 7)).unwrap());
        assert!(!cal.is_trading_day(d(6, 8)).unwrap());
        assert!(!cal.is_trading_day(d(6, 10)).unwrap());
    }

    #[test]
    fn test_last_trading_day_on_or_before() {
        let cal = june();
        assert_eq!(cal.last_trading_day_on_or_before(d(6, 9)).unwrap(), d(6, 7));
        assert_eq!(cal.last_trading_day_on_or_before(d(6, 11)).unwrap(), d(6, 11));
        assert_eq!(cal.last_trading_day_on_or_before(d(6, 10)).unwrap(), d(6, 7));
    }

    #[test]
    fn test_out_of_range_is_stale() {
        let cal = june();
        let err = cal.is_trading_day(d(7, 1)).unwrap_err();
        assert!(matches!(
            err,
            AppError::CalendarStale { first: Some(f), last: Some(l), .. } if f == d(6, 3) && l == d(6, 28)
        ));
        assert!(matches!(
            TradingCalendar::default().last_trading_day_on_or_before(d(6, 3)),
            Err(AppError::CalendarStale { first: None, .. })
        ));
    }

    #[test]
    fn test_nth_trading_day_before_skips_closures() {
        let cal = june();
        assert_eq!(cal.nth_trading_day_before(d(6, 12), 2).unwrap(), d(6, 7));
        assert_eq!(cal.nth_trading_day_before(d(6, 5), 10).unwrap(), d(6, 3));
        assert_eq!(cal.trading_days_between(d(6, 7), d(6, 11)), vec![d(6, 7), d(6, 11)]);
    }

    #[test]
    fn test_sync_persists_and_extends_coverage() {
        let conn = open_in_memory().unwrap();
        let cal = TradingCalendar::load(&conn).unwrap();
        assert!(cal.is_empty());

        assert_eq!(cal.sync(&conn, &[d(6, 3), d(6, 4)]).unwrap(), 2);
        assert_eq!(cal.sync(&conn, &[d(6, 4), d(6, 5)]).unwrap(), 1);
        assert_eq!(cal.coverage(), Some((d(6, 3), d(6, 5))));

        let reloaded = TradingCalendar::load(&conn).unwrap();
        assert_eq!(reloaded.len(), 3);
    }

    #[test]
    fn test_strip_session_prefix() {
        let prefixes = vec!["XD".to_string(), "XR".to_string(), "DR".to_string()];
        assert_eq!(strip_session_prefix("XDGongShang", &prefixes), "GongShang");
        assert_eq!(strip_session_prefix("xdGongShang", &prefixes), "GongShang");
        assert_eq!(strip_session_prefix("DR", &prefixes), "DR");
        assert_eq!(strip_session_prefix("GongShang", &prefixes), "GongShang");
        assert_eq!(strip_session_prefix("XD招商银行", &prefixes), "招商银行");
        assert_eq!(strip_session_prefix("招商银行", &prefixes), "招商银行");
    }
}
