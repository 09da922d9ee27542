use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::NaiveDate;
use dashmap::DashMap;
use futures_util::future::join_all;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::data::calendar::TradingCalendar;
use crate::data::provider::{CalendarSource, DataProvider};
use crate::data::{indicator_store, price_store};
use crate::engine::divergence::{detect_divergences, join_points};
use crate::engine::indicators::{self, compute_series, extend_series};
use crate::errors::AppError;
use crate::models::bar::PriceBar;
use crate::models::config::AppConfig;
use crate::models::indicator::IndicatorRow;
use crate::models::symbol::SymbolInfo;

/// What a symbol needed when an update was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    NeedsFullHistory,
    NeedsIncrementalUpdate,
    UpToDate,
}

/// Outcome of one committed update.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub run_id: Uuid,
    pub symbol: String,
    pub target: NaiveDate,
    pub status: UpdateStatus,
    /// First date whose row was (re)written.
    pub recompute_from: Option<NaiveDate>,
    pub bars_fetched: usize,
    pub rows_written: usize,
    pub divergences_written: usize,
    pub signals_written: usize,
}

impl UpdateReport {
    fn new(run_id: Uuid, symbol: &str, target: NaiveDate, status: UpdateStatus) -> Self {
        Self {
            run_id,
            symbol: symbol.to_string(),
            target,
            status,
            recompute_from: None,
            bars_fetched: 0,
            rows_written: 0,
            divergences_written: 0,
            signals_written: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Plan {
    Full,
    Incremental { high_water: NaiveDate },
}

/// Brings a symbol's cached indicators up to a target date with the least recomputation.
///
/// Updates to one symbol are serialized; different symbols proceed concurrently and only
/// contend for the database connection while their transaction runs.
pub struct UpdateCoordinator {
    db: Arc<Mutex<Connection>>,
    calendar: Arc<TradingCalendar>,
    provider: Arc<dyn DataProvider>,
    calendar_source: Arc<dyn CalendarSource>,
    config: AppConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UpdateCoordinator {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        calendar: Arc<TradingCalendar>,
        provider: Arc<dyn DataProvider>,
        calendar_source: Arc<dyn CalendarSource>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            calendar,
            provider,
            calendar_source,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Entries live until the symbol is purged, so the map is bounded by the cached symbols.
    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.locks.entry(symbol.to_string()).or_default().clone()
    }

    /// Make indicators for `symbol` current through `target`.
    pub async fn update(&self, symbol: &str, target: NaiveDate) -> Result<UpdateReport, AppError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("update", %symbol, %target, %run_id);
        async {
            let lock = self.symbol_lock(symbol);
            let _guard = lock.lock().await;
            self.update_locked(run_id, symbol, target).await
        }
        .instrument(span)
        .await
    }

    /// Update several symbols concurrently. Results keep the request order.
    pub async fn update_many(&self, requests: &[(String, NaiveDate)]) -> Vec<(String, Result<UpdateReport, AppError>)> {
        let futures = requests.iter().map(|(symbol, target)| async move {
            (symbol.clone(), self.update(symbol, *target).await)
        });
        join_all(futures).await
    }

    /// Delete every cached row for `symbol`. Returns the number of bars removed.
    ///
    /// The symbol's lock entry is dropped too unless another request is waiting on it.
    pub async fn purge_symbol(&self, symbol: &str) -> Result<usize, AppError> {
        let lock = self.symbol_lock(symbol);
        let guard = lock.lock().await;

        let (bars, rows) = {
            let mut conn = self.db.lock().await;
            let tx = conn.transaction()?;
            let rows = indicator_store::delete_symbol(&tx, symbol)?;
            let bars = price_store::delete_symbol(&tx, symbol)?;
            tx.commit()?;
            (bars, rows)
        };
        // one reference in the map, one held here
        self.locks.remove_if(symbol, |_, entry| Arc::strong_count(entry) == 2);
        drop(guard);

        info!("Purged {}: {} bars, {} indicator rows", symbol, bars, rows);
        Ok(bars)
    }

    /// Fetch and persist trading dates for `start..=end`. Returns how many were new.
    pub async fn sync_calendar(&self, start: NaiveDate, end: NaiveDate) -> Result<usize, AppError> {
        let dates = self
            .with_retry("trading calendar", || self.calendar_source.fetch_trading_dates(start, end))
            .await?;
        let conn = self.db.lock().await;
        self.calendar.sync(&conn, &dates)
    }

    async fn update_locked(&self, run_id: Uuid, symbol: &str, target: NaiveDate) -> Result<UpdateReport, AppError> {
        self.ensure_trading_date(target).await?;

        let plan = {
            let conn = self.db.lock().await;
            let corrupt = indicator_store::corrupt_dates(&conn, symbol)?;
            if !corrupt.is_empty() {
                warn!(
                    "{} corrupt indicator rows for {} (first {}), rebuilding from source bars",
                    corrupt.len(),
                    symbol,
                    corrupt[0]
                );
                Plan::Full
            } else {
                match indicator_store::latest_valid_date(&conn, symbol)? {
                    None => Plan::Full,
                    Some(high_water) if high_water >= target => {
                        debug!("Cached through {}, nothing to do", high_water);
                        return Ok(UpdateReport::new(run_id, symbol, target, UpdateStatus::UpToDate));
                    }
                    Some(high_water) => Plan::Incremental { high_water },
                }
            }
        };

        let (fetch_start, status) = match plan {
            Plan::Full => {
                let sessions = self.config.update.full_history_days.max(indicators::min_history(&self.config.indicators));
                let start = self.calendar.nth_trading_day_before(target, sessions.saturating_sub(1))?;
                (start, UpdateStatus::NeedsFullHistory)
            }
            Plan::Incremental { high_water } => {
                (next_day(high_water)?, UpdateStatus::NeedsIncrementalUpdate)
            }
        };
        debug!("Fetching {} bars {}..={}", symbol, fetch_start, target);

        let fetched = self
            .with_retry("bars", || self.provider.fetch_bars(symbol, fetch_start, target))
            .await?;
        let fetched = normalize_fetched(symbol, fetch_start, target, fetched)?;
        if fetched.is_empty() {
            warn!("Provider returned no bars for {} in {}..={}", symbol, fetch_start, target);
        }

        let mut report = UpdateReport::new(run_id, symbol, target, status);
        report.bars_fetched = fetched.len();

        let mut conn = self.db.lock().await;
        self.apply(&mut conn, plan, symbol, target, &fetched, &mut report)?;

        info!(
            "Updated {} through {} ({:?}): {} bars, {} rows from {:?}, {} divergences, {} trend signals",
            symbol,
            target,
            report.status,
            report.bars_fetched,
            report.rows_written,
            report.recompute_from,
            report.divergences_written,
            report.signals_written
        );
        Ok(report)
    }

    /// Run one update's writes as a single transaction. Any error rolls everything back.
    fn apply(
        &self,
        conn: &mut Connection,
        plan: Plan,
        symbol: &str,
        target: NaiveDate,
        fetched: &[PriceBar],
        report: &mut UpdateReport,
    ) -> Result<(), AppError> {
        let tx = conn.transaction()?;
        store_bars(&tx, symbol, fetched)?;

        match plan {
            Plan::Full => self.recompute_full(&tx, symbol, target, report)?,
            Plan::Incremental { high_water } => {
                if !self.recompute_incremental(&tx, symbol, high_water, target, report)? {
                    self.recompute_full(&tx, symbol, target, report)?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn recompute_full(
        &self,
        conn: &Connection,
        symbol: &str,
        target: NaiveDate,
        report: &mut UpdateReport,
    ) -> Result<(), AppError> {
        let bars = price_store::bars_through(conn, symbol, target)?;
        let out = compute_series(&bars, &self.config.indicators)?;
        let events = detect_divergences(symbol, &join_points(&bars, &out.rows), &self.config.divergence);

        indicator_store::delete_symbol(conn, symbol)?;
        report.rows_written = indicator_store::upsert_rows(conn, &out.rows)?;
        report.divergences_written = indicator_store::insert_divergences(conn, &events)?;
        report.signals_written = indicator_store::insert_trend_signals(conn, &out.signals)?;
        report.recompute_from = out.rows.first().map(|r| r.date);
        Ok(())
    }

    /// Resume from the anchor row `lookback_margin` rows before the high-water-mark.
    /// Returns `false` when the cache cannot support an incremental pass.
    fn recompute_incremental(
        &self,
        conn: &Connection,
        symbol: &str,
        high_water: NaiveDate,
        target: NaiveDate,
        report: &mut UpdateReport,
    ) -> Result<bool, AppError> {
        let params = &self.config.indicators;
        let margin = self.config.update.lookback_margin;

        let tail = indicator_store::trailing_rows(conn, symbol, high_water, margin + 1)?;
        if tail.rows.len() < margin + 1 || !tail.corrupt.is_empty() {
            debug!("Only {} usable rows before {}, falling back to full recompute", tail.rows.len(), high_water);
            return Ok(false);
        }
        let anchor: &IndicatorRow = &tail.rows[0];

        let div = &self.config.divergence;
        let context = indicators::context_bars(params).max(div.context_bars() + div.max_pivot_window() + 1);
        let mut bars = price_store::trailing_bars(conn, symbol, anchor.date, context)?;
        let Some(history_start) = bars.first().map(|b| b.date) else {
            return Ok(false);
        };
        let from_series_start =
            bars.len() < context || !indicator_store::has_rows_before(conn, symbol, history_start)?;
        bars.extend(price_store::bars_in_range(conn, symbol, next_day(anchor.date)?, target)?);

        let out = match extend_series(&bars, anchor, params) {
            Ok(out) => out,
            Err(AppError::InsufficientHistory { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        // pivot pairs near the front of a truncated window are unreliable; they were stored by earlier runs
        let mut rows = indicator_store::rows_in_range(conn, symbol, history_start, anchor.date)?.rows;
        rows.extend(out.rows.iter().cloned());
        let points = join_points(&bars, &rows);
        let skip = if from_series_start { 0 } else { div.context_bars() };
        let reliable_from = points.get(skip).map(|p| p.date);
        let events: Vec<_> = detect_divergences(symbol, &points, div)
            .into_iter()
            .filter(|e| reliable_from.is_some_and(|d| e.date >= d))
            .collect();

        report.rows_written = indicator_store::upsert_rows(conn, &out.rows)?;
        report.divergences_written = indicator_store::insert_divergences(conn, &events)?;
        report.signals_written = indicator_store::insert_trend_signals(conn, &out.signals)?;
        report.recompute_from = out.rows.first().map(|r| r.date);
        Ok(true)
    }

    /// Fail fast on non-trading dates; resync a stale calendar once before giving up.
    async fn ensure_trading_date(&self, date: NaiveDate) -> Result<(), AppError> {
        let open = match self.calendar.is_trading_day(date) {
            Err(AppError::CalendarStale { first, last, .. }) => {
                warn!("Trading calendar stale for {} (known {:?}..{:?}), resyncing", date, first, last);
                self.resync_calendar(date, first).await?;
                self.calendar.is_trading_day(date)?
            }
            other => other?,
        };
        if open {
            Ok(())
        } else {
            let previous = date
                .pred_opt()
                .and_then(|d| self.calendar.last_trading_day_on_or_before(d).ok());
            Err(AppError::NonTradingDate { date, previous })
        }
    }

    async fn resync_calendar(&self, date: NaiveDate, known_first: Option<NaiveDate>) -> Result<usize, AppError> {
        let span = chrono::Duration::days(self.config.update.calendar_sync_days);
        let mut start = date - span;
        if let Some(first) = known_first {
            start = start.min(first);
        }
        let end = date + chrono::Duration::days(31);
        self.sync_calendar(start, end).await
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let retry = &self.config.retry;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(retry.min_delay_ms))
            .with_max_delay(Duration::from_millis(retry.max_delay_ms.max(retry.min_delay_ms)))
            .with_max_times(retry.max_attempts.saturating_sub(1));

        op.retry(backoff)
            .when(AppError::is_transient)
            .notify(|err: &AppError, delay: Duration| {
                warn!("Fetching {} failed ({}), retrying in {:?}", what, err, delay);
            })
            .await
    }
}

fn next_day(date: NaiveDate) -> Result<NaiveDate, AppError> {
    date.succ_opt()
        .ok_or_else(|| AppError::Internal(format!("no date after {date}")))
}

/// Keep bars for `symbol` inside `start..=end`, ascending and unique by date.
fn normalize_fetched(
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
    mut bars: Vec<PriceBar>,
) -> Result<Vec<PriceBar>, AppError> {
    bars.retain(|b| b.date >= start && b.date <= end);
    for bar in &bars {
        if bar.symbol != symbol {
            return Err(AppError::InvalidBar {
                symbol: symbol.to_string(),
                date: bar.date,
                reason: format!("provider returned a bar for {}", bar.symbol),
            });
        }
        bar.validate()?;
    }
    bars.sort_by_key(|b| b.date);
    // a later duplicate is the provider's revision
    let mut unique: Vec<PriceBar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match unique.last_mut() {
            Some(last) if last.date == bar.date => *last = bar,
            _ => unique.push(bar),
        }
    }
    Ok(unique)
}

/// Fill missing day-over-day changes, then upsert bars and the symbol's latest name.
fn store_bars(conn: &Connection, symbol: &str, fetched: &[PriceBar]) -> Result<(), AppError> {
    let Some(first) = fetched.first() else {
        return Ok(());
    };
    let mut prev_close = price_store::bar_before(conn, symbol, first.date)?.map(|b| b.close);
    let mut bars = Vec::with_capacity(fetched.len());
    for bar in fetched {
        let mut bar = bar.clone();
        if bar.change_pct.is_none() {
            bar.change_pct = prev_close.and_then(|pc| indicators::daily_change_pct(pc, bar.close));
        }
        prev_close = Some(bar.close);
        bars.push(bar);
    }
    price_store::upsert_bars(conn, &bars)?;

    if let Some(last) = bars.last() {
        let info = SymbolInfo {
            symbol: symbol.to_string(),
            name: last.name.clone(),
        };
        if price_store::upsert_symbol_info(conn, &info)? {
            info!("Symbol {} is now named '{}'", symbol, info.name);
        }
    }
    Ok(())
}
