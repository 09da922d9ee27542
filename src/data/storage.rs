use std::path::Path;

use rusqlite::Connection;
use tracing::info;

use crate::errors::AppError;

/// Open (or create) the cache database and bring its schema up to date.
pub fn initialize_database(path: &Path) -> Result<Connection, AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::FileWrite(format!("{}: {}", parent.display(), e)))?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
    run_migrations(&conn)?;
    info!("Cache database ready at {}", path.display());
    Ok(conn)
}

/// In-memory database with the full schema.
pub fn open_in_memory() -> Result<Connection, AppError> {
    let conn = Connection::open_in_memory()?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Apply every schema step not yet recorded in `migrations`.
pub fn run_migrations(conn: &Connection) -> Result<(), AppError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    run_migration(conn, "001_symbol_info", CREATE_SYMBOL_INFO_TABLE)?;
    run_migration(conn, "002_price_bars", CREATE_PRICE_BARS_TABLE)?;
    run_migration(conn, "003_indicator_rows", CREATE_INDICATOR_ROWS_TABLE)?;
    run_migration(conn, "004_divergence_events", CREATE_DIVERGENCE_EVENTS_TABLE)?;
    run_migration(conn, "005_trend_signals", CREATE_TREND_SIGNALS_TABLE)?;
    run_migration(conn, "006_trading_calendar", CREATE_TRADING_CALENDAR_TABLE)?;
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<(), AppError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?1)",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        info!("Running migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?1)", [name])?;
    }
    Ok(())
}

const CREATE_SYMBOL_INFO_TABLE: &str = r#"
CREATE TABLE symbol_info (
    symbol TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX idx_symbol_info_name ON symbol_info(name);
"#;

const CREATE_PRICE_BARS_TABLE: &str = r#"
CREATE TABLE price_bars (
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    date TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL CHECK (volume >= 0),
    change_pct REAL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (symbol, date)
);
"#;

const CREATE_INDICATOR_ROWS_TABLE: &str = r#"
CREATE TABLE indicator_rows (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    oscillator REAL NOT NULL,
    short_ma REAL,
    trend INTEGER NOT NULL,
    upper_band REAL NOT NULL,
    lower_band REAL NOT NULL,
    volume INTEGER NOT NULL,
    volume_ratio REAL NOT NULL,
    avg_gain REAL NOT NULL,
    avg_loss REAL NOT NULL,
    atr REAL NOT NULL,
    computed_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (symbol, date)
);
"#;

const CREATE_DIVERGENCE_EVENTS_TABLE: &str = r#"
CREATE TABLE divergence_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    reference_date TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('bullish', 'bearish')),
    time_scale TEXT NOT NULL,
    oscillator_change REAL NOT NULL,
    price_change_pct REAL NOT NULL,
    confidence REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
    oscillator REAL NOT NULL,
    reference_oscillator REAL NOT NULL,
    price REAL NOT NULL,
    reference_price REAL NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    CHECK (date > reference_date),
    UNIQUE (symbol, date, reference_date, kind)
);
CREATE INDEX idx_divergence_symbol_date ON divergence_events(symbol, date);
"#;

const CREATE_TREND_SIGNALS_TABLE: &str = r#"
CREATE TABLE trend_signals (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('flip_to_up', 'flip_to_down')),
    close REAL NOT NULL,
    band_value REAL NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (symbol, date)
);
"#;

const CREATE_TRADING_CALENDAR_TABLE: &str = r#"
CREATE TABLE trading_calendar (
    date TEXT PRIMARY KEY
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 6);
    }

    #[test]
    fn test_initialize_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        let conn = initialize_database(&path).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'indicator_rows'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
        assert!(path.exists());
    }
}
