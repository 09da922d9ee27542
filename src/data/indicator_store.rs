//! Computed indicator rows, divergence events and trend signals.

use chrono::NaiveDate;
use rusqlite::{params, Connection, Row};

use crate::errors::AppError;
use crate::models::indicator::{IndicatorRow, RecurrenceState, TrendState};
use crate::models::signal::{DivergenceEvent, DivergenceKind, TrendSignal, TrendSignalKind};
use crate::models::symbol::CacheStatus;

const ROW_COLUMNS: &str = "symbol, date, oscillator, short_ma, trend, upper_band, lower_band, \
                           volume, volume_ratio, avg_gain, avg_loss, atr";

/// Indicator rows read back from the store, split by validity.
#[derive(Debug, Default)]
pub struct RowScan {
    pub rows: Vec<IndicatorRow>,
    /// One `CacheCorrupt` per excluded row.
    pub corrupt: Vec<AppError>,
}

impl RowScan {
    fn push(&mut self, raw: RawRow) {
        match raw.into_row() {
            Ok(row) => self.rows.push(row),
            Err(err) => self.corrupt.push(err),
        }
    }
}

struct RawRow {
    symbol: String,
    date: NaiveDate,
    oscillator: f64,
    short_ma: Option<f64>,
    trend: i64,
    upper_band: f64,
    lower_band: f64,
    volume: i64,
    volume_ratio: f64,
    avg_gain: f64,
    avg_loss: f64,
    atr: f64,
}

impl RawRow {
    fn map(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            symbol: row.get(0)?,
            date: row.get(1)?,
            oscillator: row.get(2)?,
            short_ma: row.get(3)?,
            trend: row.get(4)?,
            upper_band: row.get(5)?,
            lower_band: row.get(6)?,
            volume: row.get(7)?,
            volume_ratio: row.get(8)?,
            avg_gain: row.get(9)?,
            avg_loss: row.get(10)?,
            atr: row.get(11)?,
        })
    }

    fn into_row(self) -> Result<IndicatorRow, AppError> {
        let trend = TrendState::from_i64(self.trend).ok_or_else(|| AppError::CacheCorrupt {
            symbol: self.symbol.clone(),
            date: self.date,
            reason: format!("trend state {} is neither 1 nor -1", self.trend),
        })?;
        let row = IndicatorRow {
            symbol: self.symbol,
            date: self.date,
            oscillator: self.oscillator,
            short_ma: self.short_ma,
            trend,
            upper_band: self.upper_band,
            lower_band: self.lower_band,
            volume: self.volume,
            volume_ratio: self.volume_ratio,
            state: RecurrenceState {
                avg_gain: self.avg_gain,
                avg_loss: self.avg_loss,
                atr: self.atr,
            },
        };
        row.validate()?;
        Ok(row)
    }
}

// ── Indicator rows ──

/// Insert or overwrite rows keyed by (symbol, date).
pub fn upsert_rows(conn: &Connection, rows: &[IndicatorRow]) -> Result<usize, AppError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO indicator_rows (symbol, date, oscillator, short_ma, trend, upper_band, lower_band,
                                     volume, volume_ratio, avg_gain, avg_loss, atr)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(symbol, date) DO UPDATE SET
            oscillator = excluded.oscillator,
            short_ma = excluded.short_ma,
            trend = excluded.trend,
            upper_band = excluded.upper_band,
            lower_band = excluded.lower_band,
            volume = excluded.volume,
            volume_ratio = excluded.volume_ratio,
            avg_gain = excluded.avg_gain,
            avg_loss = excluded.avg_loss,
            atr = excluded.atr,
            computed_at = datetime('now')",
    )?;

    let mut written = 0;
    for row in rows {
        written += stmt.execute(params![
            row.symbol,
            row.date,
            row.oscillator,
            row.short_ma,
            row.trend.as_i64(),
            row.upper_band,
            row.lower_band,
            row.volume,
            row.volume_ratio,
            row.state.avg_gain,
            row.state.avg_loss,
            row.state.atr,
        ])?;
    }
    Ok(written)
}

/// Rows with `start <= date <= end`, ascending, with corrupt rows set aside.
pub fn rows_in_range(
    conn: &Connection,
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<RowScan, AppError> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM indicator_rows
         WHERE symbol = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut scan = RowScan::default();
    for raw in stmt.query_map(params![symbol, start, end], RawRow::map)? {
        scan.push(raw?);
    }
    Ok(scan)
}

/// The last `limit` rows on or before `through`, ascending, with corrupt rows set aside.
pub fn trailing_rows(
    conn: &Connection,
    symbol: &str,
    through: NaiveDate,
    limit: usize,
) -> Result<RowScan, AppError> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM indicator_rows
         WHERE symbol = ?1 AND date <= ?2 ORDER BY date DESC LIMIT ?3"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut raws = stmt
        .query_map(params![symbol, through, limit as i64], RawRow::map)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.reverse();

    let mut scan = RowScan::default();
    for raw in raws {
        scan.push(raw);
    }
    Ok(scan)
}

/// High-water-mark: latest date with a valid row.
pub fn latest_valid_date(conn: &Connection, symbol: &str) -> Result<Option<NaiveDate>, AppError> {
    Ok(latest_row(conn, symbol)?.map(|row| row.date))
}

/// Dates of rows breaking a stored invariant, ascending.
///
/// Validity is decided by `IndicatorRow::validate`, the same check every read applies.
pub fn corrupt_dates(conn: &Connection, symbol: &str) -> Result<Vec<NaiveDate>, AppError> {
    let sql = format!("SELECT {ROW_COLUMNS} FROM indicator_rows WHERE symbol = ?1 ORDER BY date");
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut dates = Vec::new();
    for raw in stmt.query_map([symbol], RawRow::map)? {
        let raw = raw?;
        let date = raw.date;
        if raw.into_row().is_err() {
            dates.push(date);
        }
    }
    Ok(dates)
}

/// Whether any row exists strictly before `date`.
pub fn has_rows_before(conn: &Connection, symbol: &str, date: NaiveDate) -> Result<bool, AppError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM indicator_rows WHERE symbol = ?1 AND date < ?2)",
        params![symbol, date],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Latest valid row. Newer corrupt rows are skipped.
pub fn latest_row(conn: &Connection, symbol: &str) -> Result<Option<IndicatorRow>, AppError> {
    let sql = format!("SELECT {ROW_COLUMNS} FROM indicator_rows WHERE symbol = ?1 ORDER BY date DESC");
    let mut stmt = conn.prepare_cached(&sql)?;
    for raw in stmt.query_map([symbol], RawRow::map)? {
        if let Ok(row) = raw?.into_row() {
            return Ok(Some(row));
        }
    }
    Ok(None)
}

// ── Divergence events ──

fn map_event(row: &Row<'_>) -> rusqlite::Result<(DivergenceEvent, String)> {
    let kind: String = row.get(3)?;
    Ok((
        DivergenceEvent {
            symbol: row.get(0)?,
            date: row.get(1)?,
            reference_date: row.get(2)?,
            kind: DivergenceKind::parse(&kind).unwrap_or(DivergenceKind::Bullish),
            time_scale: row.get(4)?,
            oscillator_change: row.get(5)?,
            price_change_pct: row.get(6)?,
            confidence: row.get(7)?,
            oscillator: row.get(8)?,
            reference_oscillator: row.get(9)?,
            price: row.get(10)?,
            reference_price: row.get(11)?,
        },
        kind,
    ))
}

const EVENT_COLUMNS: &str = "symbol, date, reference_date, kind, time_scale, oscillator_change, \
                             price_change_pct, confidence, oscillator, reference_oscillator, price, reference_price";

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<(DivergenceEvent, String)>>,
) -> Result<Vec<DivergenceEvent>, AppError> {
    let mut events = Vec::new();
    for item in rows {
        let (event, raw_kind) = item?;
        if DivergenceKind::parse(&raw_kind).is_none() {
            return Err(AppError::CacheCorrupt {
                symbol: event.symbol,
                date: event.date,
                reason: format!("unknown divergence kind '{raw_kind}'"),
            });
        }
        events.push(event);
    }
    Ok(events)
}

/// Insert new events; existing (symbol, date, reference date, kind) keys are left untouched.
pub fn insert_divergences(conn: &Connection, events: &[DivergenceEvent]) -> Result<usize, AppError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO divergence_events
            (symbol, date, reference_date, kind, time_scale, oscillator_change, price_change_pct,
             confidence, oscillator, reference_oscillator, price, reference_price)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    let mut inserted = 0;
    for e in events {
        inserted += stmt.execute(params![
            e.symbol,
            e.date,
            e.reference_date,
            e.kind.as_str(),
            e.time_scale,
            e.oscillator_change,
            e.price_change_pct,
            e.confidence,
            e.oscillator,
            e.reference_oscillator,
            e.price,
            e.reference_price,
        ])?;
    }
    Ok(inserted)
}

pub fn divergences_in_range(
    conn: &Connection,
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<DivergenceEvent>, AppError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM divergence_events
         WHERE symbol = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date, reference_date, kind"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![symbol, start, end], map_event)?;
    collect_events(rows)
}

/// Newest events with `confidence >= min_confidence`, newest first; same-day events strongest first.
pub fn recent_divergences(
    conn: &Connection,
    symbol: &str,
    min_confidence: f64,
    limit: usize,
) -> Result<Vec<DivergenceEvent>, AppError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM divergence_events
         WHERE symbol = ?1 AND confidence >= ?2 ORDER BY date DESC, confidence DESC LIMIT ?3"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![symbol, min_confidence, limit as i64], map_event)?;
    collect_events(rows)
}

// ── Trend signals ──

fn map_signal(row: &Row<'_>) -> rusqlite::Result<(TrendSignal, String)> {
    let kind: String = row.get(2)?;
    Ok((
        TrendSignal {
            symbol: row.get(0)?,
            date: row.get(1)?,
            kind: TrendSignalKind::parse(&kind).unwrap_or(TrendSignalKind::FlipToUp),
            close: row.get(3)?,
            band_value: row.get(4)?,
        },
        kind,
    ))
}

fn collect_signals(
    rows: impl Iterator<Item = rusqlite::Result<(TrendSignal, String)>>,
) -> Result<Vec<TrendSignal>, AppError> {
    let mut signals = Vec::new();
    for item in rows {
        let (signal, raw_kind) = item?;
        if TrendSignalKind::parse(&raw_kind).is_none() {
            return Err(AppError::CacheCorrupt {
                symbol: signal.symbol,
                date: signal.date,
                reason: format!("unknown trend signal kind '{raw_kind}'"),
            });
        }
        signals.push(signal);
    }
    Ok(signals)
}

/// Insert new signals; an existing (symbol, date) is left untouched.
pub fn insert_trend_signals(conn: &Connection, signals: &[TrendSignal]) -> Result<usize, AppError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO trend_signals (symbol, date, kind, close, band_value)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut inserted = 0;
    for s in signals {
        inserted += stmt.execute(params![s.symbol, s.date, s.kind.as_str(), s.close, s.band_value])?;
    }
    Ok(inserted)
}

pub fn trend_signals_in_range(
    conn: &Connection,
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<TrendSignal>, AppError> {
    let mut stmt = conn.prepare_cached(
        "SELECT symbol, date, kind, close, band_value FROM trend_signals
         WHERE symbol = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date",
    )?;
    let rows = stmt.query_map(params![symbol, start, end], map_signal)?;
    collect_signals(rows)
}

/// Newest signals first.
pub fn recent_trend_signals(conn: &Connection, symbol: &str, limit: usize) -> Result<Vec<TrendSignal>, AppError> {
    let mut stmt = conn.prepare_cached(
        "SELECT symbol, date, kind, close, band_value FROM trend_signals
         WHERE symbol = ?1 ORDER BY date DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![symbol, limit as i64], map_signal)?;
    collect_signals(rows)
}

// ── Maintenance ──

/// Remove divergence events and trend signals ahead of a full recomputation.
pub fn clear_signals(conn: &Connection, symbol: &str) -> Result<(), AppError> {
    conn.execute("DELETE FROM divergence_events WHERE symbol = ?1", [symbol])?;
    conn.execute("DELETE FROM trend_signals WHERE symbol = ?1", [symbol])?;
    Ok(())
}

/// Remove every derived row for a symbol. Returns the number of indicator rows dropped.
pub fn delete_symbol(conn: &Connection, symbol: &str) -> Result<usize, AppError> {
    clear_signals(conn, symbol)?;
    let rows = conn.execute("DELETE FROM indicator_rows WHERE symbol = ?1", [symbol])?;
    Ok(rows)
}

/// Row totals across every cache table.
pub fn cache_status(conn: &Connection) -> Result<CacheStatus, AppError> {
    let count = |sql: &str| -> Result<usize, AppError> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as usize)
    };
    Ok(CacheStatus {
        symbols: count("SELECT COUNT(DISTINCT symbol) FROM price_bars")?,
        price_bars: count("SELECT COUNT(*) FROM price_bars")?,
        indicator_rows: count("SELECT COUNT(*) FROM indicator_rows")?,
        divergence_events: count("SELECT COUNT(*) FROM divergence_events")?,
        trend_signals: count("SELECT COUNT(*) FROM trend_signals")?,
        calendar_days: count("SELECT COUNT(*) FROM trading_calendar")?,
    })
}
