use std::collections::HashSet;

use chrono::NaiveDate;

use crate::models::bar::PriceBar;
use crate::models::config::{DivergenceConfig, TimeScale};
use crate::models::indicator::IndicatorRow;
use crate::models::signal::{DivergenceEvent, DivergenceKind};

/// Close and oscillator on one date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub close: f64,
    pub oscillator: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotKind {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pivot {
    pub index: usize,
    pub kind: PivotKind,
}

/// Pair bars with indicator rows on matching dates. Both inputs ascend by date.
pub fn join_points(bars: &[PriceBar], rows: &[IndicatorRow]) -> Vec<SeriesPoint> {
    let mut points = Vec::with_capacity(rows.len());
    let mut b = 0;
    for row in rows {
        while b < bars.len() && bars[b].date < row.date {
            b += 1;
        }
        if b < bars.len() && bars[b].date == row.date {
            points.push(SeriesPoint {
                date: row.date,
                close: bars[b].close,
                oscillator: row.oscillator,
            });
        }
    }
    points
}

/// Swing lows and highs in closing price.
///
/// A swing low is strictly below every close in the `window` bars to its left and no higher
/// than any close in the `window` bars to its right; swing highs mirror that. Bars without a
/// full window on both sides are never pivots, and a bar cannot be both kinds.
pub fn find_pivots(points: &[SeriesPoint], window: usize) -> Vec<Pivot> {
    let mut pivots = Vec::new();
    if window == 0 || points.len() < 2 * window + 1 {
        return pivots;
    }
    for i in window..points.len() - window {
        let c = points[i].close;
        let left = &points[i - window..i];
        let right = &points[i + 1..=i + window];

        if left.iter().all(|p| c < p.close) && right.iter().all(|p| c <= p.close) {
            pivots.push(Pivot {
                index: i,
                kind: PivotKind::Low,
            });
        } else if left.iter().all(|p| c > p.close) && right.iter().all(|p| c >= p.close) {
            pivots.push(Pivot {
                index: i,
                kind: PivotKind::High,
            });
        }
    }
    pivots
}

/// Run every configured time scale over `points` and return deduplicated events by date.
pub fn detect_divergences(
    symbol: &str,
    points: &[SeriesPoint],
    config: &DivergenceConfig,
) -> Vec<DivergenceEvent> {
    let mut seen = HashSet::new();
    let mut events = Vec::new();

    for scale in &config.time_scales {
        for event in detect_for_scale(symbol, points, scale, config) {
            if seen.insert(event.key()) {
                events.push(event);
            }
        }
    }

    events.sort_by(|a, b| {
        (a.date, a.reference_date, a.kind.as_str()).cmp(&(b.date, b.reference_date, b.kind.as_str()))
    });
    events
}

fn detect_for_scale(
    symbol: &str,
    points: &[SeriesPoint],
    scale: &TimeScale,
    config: &DivergenceConfig,
) -> Vec<DivergenceEvent> {
    let pivots = find_pivots(points, scale.pivot_window);
    let mut events = Vec::new();

    for kind in [PivotKind::Low, PivotKind::High] {
        let same: Vec<&Pivot> = pivots.iter().filter(|p| p.kind == kind).collect();
        for pair in same.windows(2) {
            let (earlier, later) = (pair[0].index, pair[1].index);
            if later - earlier > scale.max_gap {
                continue;
            }
            if let Some(event) = classify(symbol, &points[earlier], &points[later], kind, scale, config) {
                events.push(event);
            }
        }
    }
    events
}

/// Classify one pivot pair. Lows can only be bullish and highs only bearish.
fn classify(
    symbol: &str,
    earlier: &SeriesPoint,
    later: &SeriesPoint,
    kind: PivotKind,
    scale: &TimeScale,
    config: &DivergenceConfig,
) -> Option<DivergenceEvent> {
    if earlier.close <= 0.0 {
        return None;
    }
    let price_change_pct = (later.close - earlier.close) / earlier.close * 100.0;
    let oscillator_change = later.oscillator - earlier.oscillator;

    let (divergence, excursion, weak) = match kind {
        PivotKind::Low => {
            let lower_low = price_change_pct < -config.min_price_change_pct;
            let higher_low = oscillator_change >= config.min_oscillator_change;
            if !(lower_low && higher_low) || earlier.oscillator > config.soft_oversold {
                return None;
            }
            (
                DivergenceKind::Bullish,
                config.soft_oversold - earlier.oscillator,
                earlier.oscillator > config.oversold,
            )
        }
        PivotKind::High => {
            let higher_high = price_change_pct > config.min_price_change_pct;
            let lower_high = oscillator_change <= -config.min_oscillator_change;
            if !(higher_high && lower_high) || later.oscillator < config.overbought {
                return None;
            }
            (
                DivergenceKind::Bearish,
                later.oscillator - (100.0 - config.soft_oversold),
                false,
            )
        }
    };

    let confidence = confidence(oscillator_change.abs(), price_change_pct.abs(), excursion, weak, config);
    if confidence < config.min_confidence {
        return None;
    }

    Some(DivergenceEvent {
        symbol: symbol.to_string(),
        date: later.date,
        reference_date: earlier.date,
        kind: divergence,
        time_scale: scale.name.clone(),
        oscillator_change,
        price_change_pct,
        confidence,
        oscillator: later.oscillator,
        reference_oscillator: earlier.oscillator,
        price: later.close,
        reference_price: earlier.close,
    })
}

/// Weighted sum of clamped factors; non-decreasing in every magnitude, bounded to 0..=1.
pub fn confidence(
    oscillator_move: f64,
    price_move_pct: f64,
    excursion: f64,
    weak: bool,
    config: &DivergenceConfig,
) -> f64 {
    let osc_factor = clamp01(oscillator_move / config.oscillator_scale);
    let price_factor = clamp01(price_move_pct / config.price_scale_pct);
    let extreme_factor = if config.soft_oversold > 0.0 {
        clamp01(excursion / config.soft_oversold)
    } else {
        1.0
    };

    let mut score = config.oscillator_weight * osc_factor
        + config.price_weight * price_factor
        + config.extreme_weight * extreme_factor;
    if weak {
        score *= config.weak_signal_factor;
    }
    clamp01(score)
}

fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
