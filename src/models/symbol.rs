use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Code and display name of a security.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub name: String,
}

/// Cache coverage for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSymbol {
    pub symbol: String,
    pub name: Option<String>,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub bar_count: usize,
    pub indicator_count: usize,
}

/// Row totals per cached table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub symbols: usize,
    pub price_bars: usize,
    pub indicator_rows: usize,
    pub divergence_events: usize,
    pub trend_signals: usize,
    pub calendar_days: usize,
}
