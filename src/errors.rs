use chrono::NaiveDate;
use serde::Serialize;

/// All application errors, categorized by domain.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // ── Indicator ──
    #[error("Insufficient history for indicator calculation: need {needed} bars, got {available}")]
    InsufficientHistory { needed: usize, available: usize },

    #[error("Invalid indicator parameters: {0}")]
    InvalidIndicatorParams(String),

    // ── Calendar ──
    #[error("{date} is not a trading day{}", previous_label(.previous))]
    NonTradingDate {
        date: NaiveDate,
        previous: Option<NaiveDate>,
    },

    #[error("Trading calendar does not cover {date} (known range: {})", coverage_label(.first, .last))]
    CalendarStale {
        date: NaiveDate,
        first: Option<NaiveDate>,
        last: Option<NaiveDate>,
    },

    // ── Market data provider ──
    #[error("Market data provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Invalid bar for {symbol} on {date}: {reason}")]
    InvalidBar {
        symbol: String,
        date: NaiveDate,
        reason: String,
    },

    // ── Cache ──
    #[error("Corrupt cache row for {symbol} on {date}: {reason}")]
    CacheCorrupt {
        symbol: String,
        date: NaiveDate,
        reason: String,
    },

    #[error("No cached {what} for {symbol}")]
    NotCached { symbol: String, what: String },

    // ── Database ──
    #[error("Database error: {0}")]
    Database(String),

    // ── Files ──
    #[error("Failed to read file: {0}")]
    FileRead(String),

    #[error("Failed to write file: {0}")]
    FileWrite(String),

    // ── Configuration ──
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Serialization ──
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ── General ──
    #[error("Internal error: {0}")]
    Internal(String),
}

fn previous_label(previous: &Option<NaiveDate>) -> String {
    previous
        .map(|d| format!(" (previous trading day: {d})"))
        .unwrap_or_default()
}

fn coverage_label(first: &Option<NaiveDate>, last: &Option<NaiveDate>) -> String {
    match (first, last) {
        (Some(first), Some(last)) => format!("{first}..={last}"),
        _ => "empty".to_string(),
    }
}

impl AppError {
    /// Whether a retry of the same request can succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::ProviderUnavailable(_))
    }
}

/// Serializable error response for downstream consumers.
#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::InsufficientHistory { .. } => "INSUFFICIENT_HISTORY",
            AppError::InvalidIndicatorParams(_) => "INVALID_INDICATOR_PARAMS",
            AppError::NonTradingDate { .. } => "NON_TRADING_DATE",
            AppError::CalendarStale { .. } => "CALENDAR_STALE",
            AppError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            AppError::SymbolNotFound(_) => "SYMBOL_NOT_FOUND",
            AppError::InvalidBar { .. } => "INVALID_BAR",
            AppError::CacheCorrupt { .. } => "CACHE_CORRUPT",
            AppError::NotCached { .. } => "NOT_CACHED",
            AppError::Database(_) => "DATABASE",
            AppError::FileRead(_) => "FILE_READ",
            AppError::FileWrite(_) => "FILE_WRITE",
            AppError::InvalidConfig(_) => "INVALID_CONFIG",
            AppError::Serialization(_) => "SERIALIZATION",
            AppError::Internal(_) => "INTERNAL",
        };
        ErrorResponse {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let response = ErrorResponse::from(self);
        response.serialize(serializer)
    }
}

// ── Conversions from external errors ──

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::FileWrite(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::FileRead(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_non_trading_date_names_previous_day() {
        let err = AppError::NonTradingDate {
            date: date(2024, 6, 8),
            previous: Some(date(2024, 6, 7)),
        };
        let msg = err.to_string();
        assert!(msg.contains("2024-06-08"));
        assert!(msg.contains("previous trading day: 2024-06-07"), "{msg}");
    }

    #[test]
    fn test_calendar_stale_message() {
        let err = AppError::CalendarStale {
            date: date(2025, 1, 2),
            first: None,
            last: None,
        };
        assert!(err.to_string().ends_with("(known range: empty)"));
    }

    #[test]
    fn test_only_provider_unavailable_is_transient() {
        assert!(AppError::ProviderUnavailable("timeout".into()).is_transient());
        assert!(!AppError::SymbolNotFound("600000".into()).is_transient());
        assert!(!AppError::InsufficientHistory { needed: 15, available: 3 }.is_transient());
    }

    #[test]
    fn test_serializes_as_error_response() {
        let err = AppError::NotCached {
            symbol: "600519".into(),
            what: "indicator rows".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "NOT_CACHED");
        assert_eq!(json["message"], "No cached indicator rows for 600519");
    }

    #[test]
    fn test_rusqlite_error_maps_to_database() {
        let err: AppError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, AppError::Database(_)));
    }
}
