use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Direction of a price/oscillator divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DivergenceKind {
    Bullish,
    Bearish,
}

impl DivergenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivergenceKind::Bullish => "bullish",
            DivergenceKind::Bearish => "bearish",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bullish" => Some(DivergenceKind::Bullish),
            "bearish" => Some(DivergenceKind::Bearish),
            _ => None,
        }
    }
}

/// A divergence between two consecutive same-type price pivots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceEvent {
    pub symbol: String,
    /// Date of the later pivot.
    pub date: NaiveDate,
    /// Date of the earlier pivot.
    pub reference_date: NaiveDate,
    pub kind: DivergenceKind,
    /// Name of the time scale that detected it.
    pub time_scale: String,
    pub oscillator_change: f64,
    pub price_change_pct: f64,
    /// 0..=1
    pub confidence: f64,
    pub oscillator: f64,
    pub reference_oscillator: f64,
    pub price: f64,
    pub reference_price: f64,
}

impl DivergenceEvent {
    /// Natural key used for deduplication.
    pub fn key(&self) -> (String, NaiveDate, NaiveDate, DivergenceKind) {
        (self.symbol.clone(), self.date, self.reference_date, self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendSignalKind {
    FlipToUp,
    FlipToDown,
}

impl TrendSignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendSignalKind::FlipToUp => "flip_to_up",
            TrendSignalKind::FlipToDown => "flip_to_down",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "flip_to_up" => Some(TrendSignalKind::FlipToUp),
            "flip_to_down" => Some(TrendSignalKind::FlipToDown),
            _ => None,
        }
    }
}

/// Emitted on the bar where the trend band state changes sign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSignal {
    pub symbol: String,
    pub date: NaiveDate,
    pub kind: TrendSignalKind,
    pub close: f64,
    /// Newly active band at the flip.
    pub band_value: f64,
}
