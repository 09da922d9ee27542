use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Top-level configuration. Every field has a default, so an empty JSON object is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub indicators: IndicatorParams,
    pub divergence: DivergenceConfig,
    pub update: UpdateConfig,
    pub retry: RetryConfig,
    /// Display-name prefixes marking ex-dividend / ex-rights sessions.
    pub session_prefixes: Vec<String>,
    /// SQLite file. Resolved under the data directory when unset.
    pub database_path: Option<PathBuf>,
}

/// Periods and multipliers of the indicator engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorParams {
    pub rsi_period: usize,
    pub ma_period: usize,
    pub atr_period: usize,
    pub band_multiplier: f64,
    pub volume_period: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            ma_period: 10,
            atr_period: 10,
            band_multiplier: 3.0,
            volume_period: 20,
        }
    }
}

/// Pivot geometry for one detection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeScale {
    pub name: String,
    /// Bars required on each side of a pivot.
    pub pivot_window: usize,
    /// Maximum bars between the two pivots of a pair.
    pub max_gap: usize,
}

/// Thresholds and confidence weights of the divergence detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DivergenceConfig {
    pub oversold: f64,
    pub soft_oversold: f64,
    pub overbought: f64,
    /// Minimum relative price move between pivots, in percent.
    pub min_price_change_pct: f64,
    /// Minimum oscillator move between pivots, in points.
    pub min_oscillator_change: f64,
    pub min_confidence: f64,
    /// Confidence multiplier for bullish pairs admitted only by `soft_oversold`.
    pub weak_signal_factor: f64,
    pub oscillator_weight: f64,
    pub price_weight: f64,
    pub extreme_weight: f64,
    /// Oscillator move (points) that saturates its factor.
    pub oscillator_scale: f64,
    /// Price move (percent) that saturates its factor.
    pub price_scale_pct: f64,
    pub time_scales: Vec<TimeScale>,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            oversold: 20.0,
            soft_oversold: 30.0,
            overbought: 80.0,
            min_price_change_pct: 0.1,
            min_oscillator_change: 1.0,
            min_confidence: 0.30,
            weak_signal_factor: 0.75,
            oscillator_weight: 0.40,
            price_weight: 0.25,
            extreme_weight: 0.35,
            oscillator_scale: 30.0,
            price_scale_pct: 10.0,
            time_scales: vec![
                TimeScale {
                    name: "short".into(),
                    pivot_window: 3,
                    max_gap: 30,
                },
                TimeScale {
                    name: "medium".into(),
                    pivot_window: 8,
                    max_gap: 90,
                },
            ],
        }
    }
}

impl DivergenceConfig {
    /// Widest pivot window across all time scales.
    pub fn max_pivot_window(&self) -> usize {
        self.time_scales.iter().map(|s| s.pivot_window).max().unwrap_or(0)
    }

    /// Bars of history a pair ending at a given bar may depend on.
    pub fn context_bars(&self) -> usize {
        self.time_scales
            .iter()
            .map(|s| s.max_gap + 2 * s.pivot_window)
            .max()
            .unwrap_or(0)
    }
}

/// Coordinator sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Trading sessions fetched when a symbol has no cached rows.
    pub full_history_days: usize,
    /// Cached rows before the high-water-mark that are recomputed on every incremental update.
    pub lookback_margin: usize,
    /// Calendar days requested before the target date on a calendar resync.
    pub calendar_sync_days: i64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            full_history_days: 250,
            lookback_margin: 5,
            calendar_sync_days: 730,
        }
    }
}

/// Bounded exponential backoff for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

pub const CONFIG_ENV: &str = "TRENDSIGHT_CONFIG";
pub const DATABASE_ENV: &str = "TRENDSIGHT_DB";

fn default_session_prefixes() -> Vec<String> {
    vec!["XD".into(), "XR".into(), "DR".into()]
}

impl AppConfig {
    /// Defaults with the standard session prefixes filled in.
    pub fn standard() -> Self {
        Self {
            session_prefixes: default_session_prefixes(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::FileRead(format!("{}: {}", path.display(), e)))?;
        let mut config: AppConfig = serde_json::from_str(&raw)?;
        if config.session_prefixes.is_empty() {
            config.session_prefixes = default_session_prefixes();
        }
        config.validate()?;
        Ok(config)
    }

    /// Config from `TRENDSIGHT_CONFIG` (or defaults), with `TRENDSIGHT_DB` overriding the database path.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::standard(),
        };
        if let Some(db) = std::env::var_os(DATABASE_ENV) {
            config.database_path = Some(PathBuf::from(db));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let p = &self.indicators;
        if p.rsi_period == 0 || p.ma_period == 0 || p.atr_period == 0 || p.volume_period == 0 {
            return Err(AppError::InvalidConfig("indicator periods must be positive".into()));
        }
        if !(p.band_multiplier > 0.0) {
            return Err(AppError::InvalidConfig("band_multiplier must be positive".into()));
        }

        let d = &self.divergence;
        if d.time_scales.is_empty() {
            return Err(AppError::InvalidConfig("at least one divergence time scale is required".into()));
        }
        if d.time_scales.iter().any(|s| s.pivot_window == 0 || s.max_gap == 0) {
            return Err(AppError::InvalidConfig("time scale windows must be positive".into()));
        }
        if !(d.oversold <= d.soft_oversold && d.soft_oversold < d.overbought) {
            return Err(AppError::InvalidConfig(
                "expected oversold <= soft_oversold < overbought".into(),
            ));
        }
        let weights = d.oscillator_weight + d.price_weight + d.extreme_weight;
        if (weights - 1.0).abs() > 1e-9 || d.oscillator_scale <= 0.0 || d.price_scale_pct <= 0.0 {
            return Err(AppError::InvalidConfig(
                "confidence weights must sum to 1 and scales must be positive".into(),
            ));
        }

        if self.update.full_history_days <= p.rsi_period {
            return Err(AppError::InvalidConfig(format!(
                "full_history_days must exceed rsi_period ({})",
                p.rsi_period
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::InvalidConfig("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_config_is_valid() {
        let config = AppConfig::standard();
        assert!(config.validate().is_ok());
        assert_eq!(config.session_prefixes, vec!["XD", "XR", "DR"]);
        assert_eq!(config.indicators.rsi_period, 14);
    }

    #[test]
    fn test_load_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"indicators": {"rsi_period": 6}, "update": {"lookback_margin": 2}}"#)
            .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.indicators.rsi_period, 6);
        assert_eq!(config.indicators.atr_period, 10);
        assert_eq!(config.update.lookback_margin, 2);
        assert_eq!(config.divergence.time_scales.len(), 2);
        assert!(!config.session_prefixes.is_empty());
    }

    #[test]
    fn test_rejects_zero_period() {
        let mut config = AppConfig::standard();
        config.indicators.atr_period = 0;
        assert!(matches!(config.validate(), Err(AppError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_unbalanced_weights() {
        let mut config = AppConfig::standard();
        config.divergence.price_weight = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_context_bars_covers_widest_scale() {
        let d = DivergenceConfig::default();
        assert_eq!(d.max_pivot_window(), 8);
        assert_eq!(d.context_bars(), 90 + 16);
    }
}
