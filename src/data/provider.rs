//! Interfaces to the external market-data collaborators.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::errors::AppError;
use crate::models::bar::PriceBar;

/// Source of daily bars.
///
/// Implementations return bars for `start..=end` in any order; the coordinator sorts,
/// deduplicates and validates them. Transient failures (timeouts, throttling, upstream
/// outages) must map to [`AppError::ProviderUnavailable`] so they are retried. An unknown
/// code maps to [`AppError::SymbolNotFound`].
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch_bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>, AppError>;
}

/// Source of exchange trading dates.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn fetch_trading_dates(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>, AppError>;
}
