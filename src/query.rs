use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::data::indicator_store::{self, RowScan};
use crate::data::price_store;
use crate::errors::AppError;
use crate::models::bar::PriceBar;
use crate::models::indicator::IndicatorRow;
use crate::models::signal::{DivergenceEvent, TrendSignal};
use crate::models::symbol::{CacheStatus, CachedSymbol, SymbolInfo};
use crate::utils::export;

const SUMMARY_MIN_CONFIDENCE: f64 = 0.5;
const SUMMARY_DIVERGENCES: usize = 3;
const SUMMARY_TREND_SIGNALS: usize = 5;

/// Latest state of one symbol at a glance.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolSummary {
    pub symbol: String,
    pub name: Option<String>,
    pub latest: IndicatorRow,
    /// Newest high-confidence divergences, newest first.
    pub divergences: Vec<DivergenceEvent>,
    /// Newest trend flips, newest first.
    pub trend_signals: Vec<TrendSignal>,
}

/// Read-only projections over the cache. Never fetches or recomputes.
#[derive(Clone)]
pub struct QueryExporter {
    db: Arc<Mutex<Connection>>,
    session_prefixes: Vec<String>,
}

impl QueryExporter {
    pub fn new(db: Arc<Mutex<Connection>>, session_prefixes: Vec<String>) -> Self {
        Self { db, session_prefixes }
    }

    /// Valid rows in `start..=end`, ascending.
    pub async fn get_indicator_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<IndicatorRow>, AppError> {
        let conn = self.db.lock().await;
        let rows = checked(indicator_store::rows_in_range(&conn, symbol, start, end)?);
        if rows.is_empty() {
            return Err(not_cached(symbol, format!("indicator rows for {start}..={end}")));
        }
        Ok(rows)
    }

    /// Most recent valid row.
    pub async fn get_latest_signal(&self, symbol: &str) -> Result<Option<IndicatorRow>, AppError> {
        let conn = self.db.lock().await;
        ensure_computed(&conn, symbol)?;
        report_corrupt(symbol, &indicator_store::corrupt_dates(&conn, symbol)?);
        indicator_store::latest_row(&conn, symbol)
    }

    pub async fn get_divergences(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DivergenceEvent>, AppError> {
        let conn = self.db.lock().await;
        ensure_computed(&conn, symbol)?;
        indicator_store::divergences_in_range(&conn, symbol, start, end)
    }

    pub async fn get_trend_signals(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TrendSignal>, AppError> {
        let conn = self.db.lock().await;
        ensure_computed(&conn, symbol)?;
        indicator_store::trend_signals_in_range(&conn, symbol, start, end)
    }

    pub async fn get_summary(&self, symbol: &str) -> Result<SymbolSummary, AppError> {
        let conn = self.db.lock().await;
        report_corrupt(symbol, &indicator_store::corrupt_dates(&conn, symbol)?);
        let latest = indicator_store::latest_row(&conn, symbol)?
            .ok_or_else(|| not_cached(symbol, "indicator rows".to_string()))?;

        Ok(SymbolSummary {
            symbol: symbol.to_string(),
            name: price_store::get_symbol_info(&conn, symbol)?.map(|i| i.name),
            latest,
            divergences: indicator_store::recent_divergences(
                &conn,
                symbol,
                SUMMARY_MIN_CONFIDENCE,
                SUMMARY_DIVERGENCES,
            )?,
            trend_signals: indicator_store::recent_trend_signals(&conn, symbol, SUMMARY_TREND_SIGNALS)?,
        })
    }

    pub async fn list_cached_symbols(&self) -> Result<Vec<CachedSymbol>, AppError> {
        let conn = self.db.lock().await;
        price_store::cached_symbols(&conn)
    }

    pub async fn cache_status(&self) -> Result<CacheStatus, AppError> {
        let conn = self.db.lock().await;
        indicator_store::cache_status(&conn)
    }

    /// Look a symbol up by code or display name.
    pub async fn resolve_symbol(&self, query: &str) -> Result<SymbolInfo, AppError> {
        let conn = self.db.lock().await;
        price_store::resolve_symbol(&conn, query, &self.session_prefixes)?
            .ok_or_else(|| AppError::SymbolNotFound(query.trim().to_string()))
    }

    /// The whole cached series as CSV.
    pub async fn export_table(&self, symbol: &str) -> Result<Vec<u8>, AppError> {
        let (bars, rows) = self.table_source(symbol).await?;
        export::table_bytes(&bars, &rows)
    }

    pub async fn write_table_csv(&self, symbol: &str, path: &Path) -> Result<(), AppError> {
        let (bars, rows) = self.table_source(symbol).await?;
        export::write_table_csv(&bars, &rows, path)?;
        debug!("Exported {} rows for {} to {}", rows.len(), symbol, path.display());
        Ok(())
    }

    async fn table_source(
        &self,
        symbol: &str,
    ) -> Result<(Vec<PriceBar>, Vec<IndicatorRow>), AppError> {
        let conn = self.db.lock().await;
        let (min, max) = full_range();
        let rows = match indicator_store::rows_in_range(&conn, symbol, min, max)? {
            scan if scan.rows.is_empty() && scan.corrupt.is_empty() => {
                return Err(not_cached(symbol, "indicator rows".to_string()));
            }
            scan => checked(scan),
        };
        let (Some(start), Some(end)) = (rows.first().map(|r| r.date), rows.last().map(|r| r.date)) else {
            return Err(not_cached(symbol, "valid indicator rows".to_string()));
        };
        let bars = price_store::bars_in_range(&conn, symbol, start, end)?;
        Ok((bars, rows))
    }
}

/// Widest range whose ISO text still sorts chronologically.
fn full_range() -> (NaiveDate, NaiveDate) {
    (
        NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN),
        NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX),
    )
}

fn not_cached(symbol: &str, what: String) -> AppError {
    AppError::NotCached {
        symbol: symbol.to_string(),
        what,
    }
}

fn ensure_computed(conn: &Connection, symbol: &str) -> Result<(), AppError> {
    let computed = indicator_store::latest_valid_date(conn, symbol)?.is_some()
        || !indicator_store::corrupt_dates(conn, symbol)?.is_empty();
    if computed {
        Ok(())
    } else {
        Err(not_cached(symbol, "indicator rows".to_string()))
    }
}

/// Log and drop the corrupt half of a scan.
fn checked(scan: RowScan) -> Vec<IndicatorRow> {
    for err in &scan.corrupt {
        warn!("Excluding cached row: {}", err);
    }
    scan.rows
}

fn report_corrupt(symbol: &str, dates: &[NaiveDate]) {
    if let Some(first) = dates.first() {
        warn!(
            "{} corrupt indicator rows for {} excluded from reads (first {})",
            dates.len(),
            symbol,
            first
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::open_in_memory;
    use crate::engine::divergence::{detect_divergences, join_points};
    use crate::engine::indicators::compute_series;
    use crate::models::bar::fixtures::bars_from_closes;
    use crate::models::config::AppConfig;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn closes() -> Vec<f64> {
        (0..80)
            .map(|i| 20.0 + 3.0 * (i as f64 / 5.0).sin() + 0.02 * i as f64)
            .collect()
    }

    /// An exporter over a store holding one fully computed symbol.
    async fn seeded() -> (QueryExporter, Vec<IndicatorRow>) {
        let config = AppConfig::standard();
        let conn = open_in_memory().unwrap();
        let bars = bars_from_closes("600036", d(1, 1), &closes());
        let out = compute_series(&bars, &config.indicators).unwrap();
        let events = detect_divergences("600036", &join_points(&bars, &out.rows), &config.divergence);

        price_store::upsert_bars(&conn, &bars).unwrap();
        price_store::upsert_symbol_info(
            &conn,
            &SymbolInfo {
                symbol: "600036".into(),
                name: "XDZhaoShang".into(),
            },
        )
        .unwrap();
        indicator_store::upsert_rows(&conn, &out.rows).unwrap();
        indicator_store::insert_divergences(&conn, &events).unwrap();
        indicator_store::insert_trend_signals(&conn, &out.signals).unwrap();

        let exporter = QueryExporter::new(Arc::new(Mutex::new(conn)), config.session_prefixes);
        (exporter, out.rows)
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_ordered() {
        let (q, rows) = seeded().await;
        let history = q.get_indicator_history("600036", d(2, 1), d(2, 10)).await.unwrap();
        assert_eq!(history.len(), 10);
        assert_eq!(history.first().unwrap().date, d(2, 1));
        assert!(history.windows(2).all(|w| w[0].date < w[1].date));
        assert_eq!(history[0], *rows.iter().find(|r| r.date == d(2, 1)).unwrap());
    }

    #[tokio::test]
    async fn test_missing_data_is_not_cached() {
        let (q, _) = seeded().await;
        assert!(matches!(
            q.get_indicator_history("600036", d(9, 1), d(9, 30)).await,
            Err(AppError::NotCached { .. })
        ));
        assert!(matches!(q.get_latest_signal("000001").await, Err(AppError::NotCached { .. })));
        assert!(matches!(
            q.get_divergences("000001", d(1, 1), d(12, 31)).await,
            Err(AppError::NotCached { .. })
        ));
        assert!(matches!(q.export_table("000001").await, Err(AppError::NotCached { .. })));
        assert!(matches!(q.get_summary("000001").await, Err(AppError::NotCached { .. })));
    }

    #[tokio::test]
    async fn test_latest_signal_skips_corrupt_rows() {
        let (q, rows) = seeded().await;
        let last = rows.last().unwrap().clone();
        {
            let conn = q.db.lock().await;
            conn.execute(
                "UPDATE indicator_rows SET oscillator = -5 WHERE symbol = ?1 AND date = ?2",
                rusqlite::params!["600036", last.date],
            )
            .unwrap();
        }

        let latest = q.get_latest_signal("600036").await.unwrap().unwrap();
        assert_eq!(latest, rows[rows.len() - 2]);

        let history = q.get_indicator_history("600036", d(1, 1), d(12, 31)).await.unwrap();
        assert_eq!(history.len(), rows.len() - 1);
        assert!(history.iter().all(|r| r.date != last.date));
    }

    #[tokio::test]
    async fn test_non_finite_latest_row_is_excluded() {
        let (q, rows) = seeded().await;
        let last = rows.last().unwrap().clone();
        {
            let conn = q.db.lock().await;
            conn.execute(
                "UPDATE indicator_rows SET volume_ratio = 9e999 WHERE symbol = ?1 AND date = ?2",
                rusqlite::params!["600036", last.date],
            )
            .unwrap();
        }

        let previous = rows[rows.len() - 2].clone();
        assert_eq!(q.get_latest_signal("600036").await.unwrap(), Some(previous.clone()));
        assert_eq!(q.get_summary("600036").await.unwrap().latest, previous);
    }

    #[tokio::test]
    async fn test_summary_collects_recent_signals() {
        let (q, rows) = seeded().await;
        let summary = q.get_summary("600036").await.unwrap();

        assert_eq!(summary.latest, *rows.last().unwrap());
        assert_eq!(summary.name.as_deref(), Some("XDZhaoShang"));
        assert!(summary.trend_signals.len() <= SUMMARY_TREND_SIGNALS);
        assert!(summary.trend_signals.windows(2).all(|w| w[0].date > w[1].date));
        assert!(summary.divergences.len() <= SUMMARY_DIVERGENCES);
        assert!(summary.divergences.iter().all(|e| e.confidence >= SUMMARY_MIN_CONFIDENCE));
        assert!(summary
            .divergences
            .windows(2)
            .all(|w| (w[0].date, w[0].confidence) >= (w[1].date, w[1].confidence)));
    }

    #[tokio::test]
    async fn test_resolve_symbol_by_code_and_name() {
        let (q, _) = seeded().await;
        assert_eq!(q.resolve_symbol("600036").await.unwrap().symbol, "600036");
        assert_eq!(q.resolve_symbol("XDZhaoShang").await.unwrap().symbol, "600036");
        assert_eq!(q.resolve_symbol("zhaoshang").await.unwrap().symbol, "600036");
        assert!(matches!(q.resolve_symbol("nobody").await, Err(AppError::SymbolNotFound(_))));
    }

    #[tokio::test]
    async fn test_export_covers_every_row() {
        let (q, rows) = seeded().await;
        let bytes = q.export_table("600036").await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), rows.len() + 1);
        assert!(text.starts_with("date,close,change_pct,oscillator"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        q.write_table_csv("600036", &path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }

    #[tokio::test]
    async fn test_coverage_listing() {
        let (q, rows) = seeded().await;
        let symbols = q.list_cached_symbols().await.unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].bar_count, 80);
        assert_eq!(symbols[0].indicator_count, rows.len());

        let status = q.cache_status().await.unwrap();
        assert_eq!(status.symbols, 1);
        assert_eq!(status.indicator_rows, rows.len());
    }
}
