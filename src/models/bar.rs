use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// A single daily OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    /// Display name as reported by the provider on that day (may carry a session prefix).
    pub name: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    /// Day-over-day close change in percent. Derived from the previous close when absent.
    pub change_pct: Option<f64>,
}

impl PriceBar {
    /// Check the bar against the provider contract.
    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |reason: &str| AppError::InvalidBar {
            symbol: self.symbol.clone(),
            date: self.date,
            reason: reason.to_string(),
        };

        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(invalid("non-finite price"));
        }
        if self.high < self.low {
            return Err(invalid("high below low"));
        }
        let range = self.low..=self.high;
        if !range.contains(&self.open) || !range.contains(&self.close) {
            return Err(invalid("open or close outside the high/low range"));
        }
        if self.volume < 0 {
            return Err(invalid("negative volume"));
        }
        if matches!(self.change_pct, Some(pct) if !pct.is_finite()) {
            return Err(invalid("non-finite change percent"));
        }
        Ok(())
    }

    /// Midpoint of the bar's range.
    pub fn midpoint(&self) -> f64 {
        (self.high + self.low) / 2.0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn bar() -> PriceBar {
        PriceBar {
            symbol: "600000".into(),
            name: "Pudong Bank".into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            open: 10.0,
            high: 10.5,
            low: 9.8,
            close: 10.2,
            volume: 12_000,
            change_pct: Some(1.2),
        }
    }

    #[test]
    fn test_valid_bar_passes() {
        assert!(bar().validate().is_ok());
        assert!((bar().midpoint() - 10.15).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_inverted_range() {
        let mut b = bar();
        b.high = 9.0;
        let err = b.validate().unwrap_err();
        assert!(matches!(err, AppError::InvalidBar { ref reason, .. } if reason == "high below low"));
    }

    #[test]
    fn test_rejects_negative_volume_and_nan() {
        let mut b = bar();
        b.volume = -1;
        assert!(b.validate().is_err());

        let mut b = bar();
        b.close = f64::NAN;
        assert!(b.validate().is_err());
    }
}
