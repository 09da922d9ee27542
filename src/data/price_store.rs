//! Raw daily bars and symbol names.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::data::calendar::strip_session_prefix;
use crate::errors::AppError;
use crate::models::bar::PriceBar;
use crate::models::symbol::{CachedSymbol, SymbolInfo};

const BAR_COLUMNS: &str = "symbol, name, date, open, high, low, close, volume, change_pct";

fn map_bar(row: &Row<'_>) -> rusqlite::Result<PriceBar> {
    Ok(PriceBar {
        symbol: row.get(0)?,
        name: row.get(1)?,
        date: row.get(2)?,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        volume: row.get(7)?,
        change_pct: row.get(8)?,
    })
}

// ── Bars ──

/// Insert or revise bars. Returns the number of rows inserted or changed.
pub fn upsert_bars(conn: &Connection, bars: &[PriceBar]) -> Result<usize, AppError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO price_bars (symbol, name, date, open, high, low, close, volume, change_pct)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(symbol, date) DO UPDATE SET
            name = excluded.name,
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            volume = excluded.volume,
            change_pct = excluded.change_pct,
            updated_at = datetime('now')
         WHERE price_bars.open IS NOT excluded.open
            OR price_bars.high IS NOT excluded.high
            OR price_bars.low IS NOT excluded.low
            OR price_bars.close IS NOT excluded.close
            OR price_bars.volume IS NOT excluded.volume
            OR price_bars.change_pct IS NOT excluded.change_pct
            OR price_bars.name IS NOT excluded.name",
    )?;

    let mut changed = 0;
    for bar in bars {
        bar.validate()?;
        changed += stmt.execute(params![
            bar.symbol,
            bar.name,
            bar.date,
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.change_pct,
        ])?;
    }
    Ok(changed)
}

/// Bars with `start <= date <= end`, ascending.
pub fn bars_in_range(
    conn: &Connection,
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<PriceBar>, AppError> {
    let sql = format!(
        "SELECT {BAR_COLUMNS} FROM price_bars
         WHERE symbol = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let bars = stmt
        .query_map(params![symbol, start, end], map_bar)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bars)
}

/// Every stored bar up to and including `end`, ascending.
pub fn bars_through(conn: &Connection, symbol: &str, end: NaiveDate) -> Result<Vec<PriceBar>, AppError> {
    let sql = format!(
        "SELECT {BAR_COLUMNS} FROM price_bars WHERE symbol = ?1 AND date <= ?2 ORDER BY date"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let bars = stmt
        .query_map(params![symbol, end], map_bar)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bars)
}

/// The last `limit` bars on or before `through`, ascending.
pub fn trailing_bars(
    conn: &Connection,
    symbol: &str,
    through: NaiveDate,
    limit: usize,
) -> Result<Vec<PriceBar>, AppError> {
    let sql = format!(
        "SELECT {BAR_COLUMNS} FROM price_bars
         WHERE symbol = ?1 AND date <= ?2 ORDER BY date DESC LIMIT ?3"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut bars = stmt
        .query_map(params![symbol, through, limit as i64], map_bar)?
        .collect::<Result<Vec<_>, _>>()?;
    bars.reverse();
    Ok(bars)
}

/// Latest stored bar strictly before `date`.
pub fn bar_before(conn: &Connection, symbol: &str, date: NaiveDate) -> Result<Option<PriceBar>, AppError> {
    let sql = format!(
        "SELECT {BAR_COLUMNS} FROM price_bars
         WHERE symbol = ?1 AND date < ?2 ORDER BY date DESC LIMIT 1"
    );
    let bar = conn.query_row(&sql, params![symbol, date], map_bar).optional()?;
    Ok(bar)
}

// ── Symbol info ──

/// Record a symbol's display name. Returns `true` when a row was created or renamed.
pub fn upsert_symbol_info(conn: &Connection, info: &SymbolInfo) -> Result<bool, AppError> {
    let changed = conn.execute(
        "INSERT INTO symbol_info (symbol, name) VALUES (?1, ?2)
         ON CONFLICT(symbol) DO UPDATE SET name = excluded.name, updated_at = datetime('now')
         WHERE symbol_info.name != excluded.name",
        params![info.symbol, info.name],
    )?;
    Ok(changed > 0)
}

pub fn get_symbol_info(conn: &Connection, symbol: &str) -> Result<Option<SymbolInfo>, AppError> {
    let info = conn
        .query_row(
            "SELECT symbol, name FROM symbol_info WHERE symbol = ?1",
            [symbol],
            |row| {
                Ok(SymbolInfo {
                    symbol: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(info)
}

/// Find a symbol by code, exact display name, or display name with a session prefix removed.
pub fn resolve_symbol(
    conn: &Connection,
    query: &str,
    session_prefixes: &[String],
) -> Result<Option<SymbolInfo>, AppError> {
    let query = query.trim();
    if let Some(info) = get_symbol_info(conn, query)? {
        return Ok(Some(info));
    }

    let mut stmt = conn.prepare_cached("SELECT symbol, name FROM symbol_info ORDER BY symbol")?;
    let all = stmt
        .query_map([], |row| {
            Ok(SymbolInfo {
                symbol: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(info) = all.iter().find(|i| i.name == query) {
        return Ok(Some(info.clone()));
    }

    let wanted = strip_session_prefix(query, session_prefixes).to_lowercase();
    Ok(all
        .into_iter()
        .find(|i| strip_session_prefix(&i.name, session_prefixes).to_lowercase() == wanted))
}

// ── Coverage ──

/// Per-symbol coverage of the cache, ordered by symbol.
pub fn cached_symbols(conn: &Connection) -> Result<Vec<CachedSymbol>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT b.symbol, s.name, MIN(b.date), MAX(b.date), COUNT(*),
                (SELECT COUNT(*) FROM indicator_rows r WHERE r.symbol = b.symbol)
         FROM price_bars b
         LEFT JOIN symbol_info s ON s.symbol = b.symbol
         GROUP BY b.symbol
         ORDER BY b.symbol",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CachedSymbol {
                symbol: row.get(0)?,
                name: row.get(1)?,
                first_date: row.get(2)?,
                last_date: row.get(3)?,
                bar_count: row.get::<_, i64>(4)? as usize,
                indicator_count: row.get::<_, i64>(5)? as usize,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Drop a symbol's bars and name.
pub fn delete_symbol(conn: &Connection, symbol: &str) -> Result<usize, AppError> {
    let bars = conn.execute("DELETE FROM price_bars WHERE symbol = ?1", [symbol])?;
    conn.execute("DELETE FROM symbol_info WHERE symbol = ?1", [symbol])?;
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::open_in_memory;
    use crate::models::bar::fixtures::bars_from_closes;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn prefixes() -> Vec<String> {
        vec!["XD".into(), "XR".into(), "DR".into()]
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let conn = open_in_memory().unwrap();
        let bars = bars_from_closes("600000", d(2024, 1, 1), &[10.0, 10.5, 11.0]);

        assert_eq!(upsert_bars(&conn, &bars).unwrap(), 3);
        assert_eq!(upsert_bars(&conn, &bars).unwrap(), 0);

        let stored = bars_through(&conn, "600000", d(2024, 12, 31)).unwrap();
        assert_eq!(stored, bars);
    }

    #[test]
    fn test_upsert_applies_revisions() {
        let conn = open_in_memory().unwrap();
        let mut bars = bars_from_closes("600000", d(2024, 1, 1), &[10.0, 10.5]);
        upsert_bars(&conn, &bars).unwrap();

        bars[1].close = 10.52;
        bars[1].high = 10.6;
        assert_eq!(upsert_bars(&conn, &bars).unwrap(), 1);
        let stored = bars_in_range(&conn, "600000", d(2024, 1, 2), d(2024, 1, 2)).unwrap();
        assert_eq!(stored[0].close, 10.52);
    }

    #[test]
    fn test_upsert_rejects_invalid_bar() {
        let conn = open_in_memory().unwrap();
        let mut bars = bars_from_closes("600000", d(2024, 1, 1), &[10.0]);
        bars[0].volume = -5;
        assert!(matches!(upsert_bars(&conn, &bars), Err(AppError::InvalidBar { .. })));
    }

    #[test]
    fn test_trailing_and_previous_bars() {
        let conn = open_in_memory().unwrap();
        let bars = bars_from_closes("000001", d(2024, 1, 1), &[1.0, 2.0, 3.0, 4.0, 5.0]);
        upsert_bars(&conn, &bars).unwrap();

        let tail = trailing_bars(&conn, "000001", d(2024, 1, 4), 2).unwrap();
        assert_eq!(tail.iter().map(|b| b.close).collect::<Vec<_>>(), vec![3.0, 4.0]);

        let prev = bar_before(&conn, "000001", d(2024, 1, 3)).unwrap().unwrap();
        assert_eq!(prev.close, 2.0);
        assert!(bar_before(&conn, "000001", d(2024, 1, 1)).unwrap().is_none());
    }

    #[test]
    fn test_symbol_info_renames_only_on_mismatch() {
        let conn = open_in_memory().unwrap();
        let info = SymbolInfo {
            symbol: "600519".into(),
            name: "Kweichow Moutai".into(),
        };
        assert!(upsert_symbol_info(&conn, &info).unwrap());
        assert!(!upsert_symbol_info(&conn, &info).unwrap());

        let renamed = SymbolInfo {
            name: "XDKweichow Moutai".into(),
            ..info
        };
        assert!(upsert_symbol_info(&conn, &renamed).unwrap());
        assert_eq!(get_symbol_info(&conn, "600519").unwrap().unwrap().name, "XDKweichow Moutai");
    }

    #[test]
    fn test_resolve_symbol_strips_session_prefix() {
        let conn = open_in_memory().unwrap();
        upsert_symbol_info(
            &conn,
            &SymbolInfo {
                symbol: "601398".into(),
                name: "XDGongShang".into(),
            },
        )
        .unwrap();

        let by_code = resolve_symbol(&conn, "601398", &prefixes()).unwrap().unwrap();
        assert_eq!(by_code.name, "XDGongShang");

        let by_plain_name = resolve_symbol(&conn, "gongshang", &prefixes()).unwrap().unwrap();
        assert_eq!(by_plain_name.symbol, "601398");

        let by_other_prefix = resolve_symbol(&conn, "xrGongShang", &prefixes()).unwrap().unwrap();
        assert_eq!(by_other_prefix.symbol, "601398");

        assert!(resolve_symbol(&conn, "Unknown", &prefixes()).unwrap().is_none());
    }

    #[test]
    fn test_cached_symbols_reports_coverage() {
        let conn = open_in_memory().unwrap();
        upsert_bars(&conn, &bars_from_closes("A", d(2024, 1, 1), &[1.0, 2.0, 3.0])).unwrap();
        upsert_bars(&conn, &bars_from_closes("B", d(2024, 2, 1), &[4.0])).unwrap();

        let listing = cached_symbols(&conn).unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].symbol, "A");
        assert_eq!(listing[0].first_date, d(2024, 1, 1));
        assert_eq!(listing[0].last_date, d(2024, 1, 3));
        assert_eq!(listing[0].bar_count, 3);
        assert_eq!(listing[0].name, None);

        assert_eq!(delete_symbol(&conn, "A").unwrap(), 3);
        assert_eq!(cached_symbols(&conn).unwrap().len(), 1);
    }
}
