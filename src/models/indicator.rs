use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Binary trend state of the band indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendState {
    Up,
    Down,
}

impl TrendState {
    /// Stored representation: +1 for up, -1 for down.
    pub fn as_i64(&self) -> i64 {
        match self {
            TrendState::Up => 1,
            TrendState::Down => -1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(TrendState::Up),
            -1 => Some(TrendState::Down),
            _ => None,
        }
    }
}

/// Wilder recurrence state at a given bar. Enough to resume the series exactly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceState {
    pub avg_gain: f64,
    pub avg_loss: f64,
    pub atr: f64,
}

/// One day of computed indicators for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRow {
    pub symbol: String,
    pub date: NaiveDate,
    /// Relative-strength oscillator, 0..=100.
    pub oscillator: f64,
    /// Short simple moving average of closes. `None` until the window fills.
    pub short_ma: Option<f64>,
    pub trend: TrendState,
    pub upper_band: f64,
    pub lower_band: f64,
    pub volume: i64,
    pub volume_ratio: f64,
    pub state: RecurrenceState,
}

impl IndicatorRow {
    /// Active band: the lower band in an uptrend, the upper band in a downtrend.
    pub fn band_value(&self) -> f64 {
        match self.trend {
            TrendState::Up => self.lower_band,
            TrendState::Down => self.upper_band,
        }
    }

    /// Check the row's stored invariants.
    pub fn validate(&self) -> Result<(), AppError> {
        let corrupt = |reason: String| AppError::CacheCorrupt {
            symbol: self.symbol.clone(),
            date: self.date,
            reason,
        };

        if !(0.0..=100.0).contains(&self.oscillator) {
            return Err(corrupt(format!("oscillator {} outside 0..=100", self.oscillator)));
        }
        let finite = [
            self.upper_band,
            self.lower_band,
            self.volume_ratio,
            self.state.avg_gain,
            self.state.avg_loss,
            self.state.atr,
        ];
        if finite.iter().any(|v| !v.is_finite()) || matches!(self.short_ma, Some(ma) if !ma.is_finite()) {
            return Err(corrupt("non-finite value".to_string()));
        }
        if self.trend == TrendState::Down && self.upper_band < self.lower_band {
            return Err(corrupt(format!(
                "upper band {} below lower band {} in downtrend",
                self.upper_band, self.lower_band
            )));
        }
        if self.state.avg_gain < 0.0 || self.state.avg_loss < 0.0 || self.state.atr < 0.0 {
            return Err(corrupt("negative recurrence state".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> IndicatorRow {
        IndicatorRow {
            symbol: "000001".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
            oscillator: 55.0,
            short_ma: Some(10.1),
            trend: TrendState::Down,
            upper_band: 11.0,
            lower_band: 9.0,
            volume: 500,
            volume_ratio: 1.0,
            state: RecurrenceState {
                avg_gain: 0.1,
                avg_loss: 0.08,
                atr: 0.3,
            },
        }
    }

    #[test]
    fn test_trend_state_round_trips_through_sign() {
        assert_eq!(TrendState::from_i64(TrendState::Up.as_i64()), Some(TrendState::Up));
        assert_eq!(TrendState::from_i64(-1), Some(TrendState::Down));
        assert_eq!(TrendState::from_i64(0), None);
    }

    #[test]
    fn test_band_value_follows_trend() {
        let mut r = row();
        assert_eq!(r.band_value(), 11.0);
        r.trend = TrendState::Up;
        assert_eq!(r.band_value(), 9.0);
    }

    #[test]
    fn test_validate_flags_out_of_range_oscillator() {
        let mut r = row();
        r.oscillator = 101.0;
        assert!(matches!(r.validate(), Err(AppError::CacheCorrupt { .. })));
    }

    #[test]
    fn test_validate_flags_crossed_bands_in_downtrend() {
        let mut r = row();
        r.upper_band = 8.0;
        assert!(r.validate().is_err());
        r.trend = TrendState::Up;
        assert!(r.validate().is_ok());
    }
}
