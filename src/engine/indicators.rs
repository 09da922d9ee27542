use crate::errors::AppError;
use crate::models::bar::PriceBar;
use crate::models::config::IndicatorParams;
use crate::models::indicator::{IndicatorRow, RecurrenceState, TrendState};
use crate::models::signal::{TrendSignal, TrendSignalKind};

/// Rows and trend flips produced by one engine pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesOutput {
    pub rows: Vec<IndicatorRow>,
    pub signals: Vec<TrendSignal>,
}

/// Index of the first bar that gets a row: both the oscillator and the band must exist.
pub fn first_row_index(params: &IndicatorParams) -> usize {
    params.rsi_period.max(params.atr_period.saturating_sub(1))
}

/// Bars needed before the engine can emit a single row.
pub fn min_history(params: &IndicatorParams) -> usize {
    first_row_index(params) + 1
}

/// Bars of context an incremental pass needs up to and including its anchor.
pub fn context_bars(params: &IndicatorParams) -> usize {
    params.ma_period.max(params.volume_period).saturating_sub(1).max(1)
}

/// Compute the full indicator series for `bars` (ascending dates, one symbol).
pub fn compute_series(bars: &[PriceBar], params: &IndicatorParams) -> Result<SeriesOutput, AppError> {
    check_params(params)?;
    check_data_len(bars.len(), min_history(params))?;

    let rsi_p = params.rsi_period;
    let atr_p = params.atr_period;
    let first_row = first_row_index(params);

    let mut gain_sum = 0.0f64;
    let mut loss_sum = 0.0f64;
    let mut tr_sum = 0.0f64;
    let mut avg_gain = 0.0f64;
    let mut avg_loss = 0.0f64;
    let mut atr_val = 0.0f64;
    let mut band: Option<Band> = None;

    let mut out = SeriesOutput::default();

    for i in 0..bars.len() {
        let bar = &bars[i];
        let prev_close = if i > 0 { Some(bars[i - 1].close) } else { None };

        // ── Oscillator recurrence ──
        if let Some(prev) = prev_close {
            let (gain, loss) = split_change(bar.close - prev);
            if i < rsi_p {
                gain_sum += gain;
                loss_sum += loss;
            } else if i == rsi_p {
                gain_sum += gain;
                loss_sum += loss;
                avg_gain = gain_sum / rsi_p as f64;
                avg_loss = loss_sum / rsi_p as f64;
            } else {
                avg_gain = wilder(avg_gain, gain, rsi_p);
                avg_loss = wilder(avg_loss, loss, rsi_p);
            }
        }

        // ── ATR recurrence ──
        let tr = true_range(bar, prev_close);
        if i + 1 < atr_p {
            tr_sum += tr;
        } else if i + 1 == atr_p {
            tr_sum += tr;
            atr_val = tr_sum / atr_p as f64;
        } else {
            atr_val = wilder(atr_val, tr, atr_p);
        }

        // ── Band state machine ──
        let mut flipped = false;
        if i + 1 >= atr_p {
            band = Some(match band {
                None => Band::seed(bar, atr_val, params.band_multiplier),
                Some(prev) => {
                    let next = prev.step(bar, atr_val, params.band_multiplier);
                    flipped = next.trend != prev.trend;
                    next
                }
            });
        }

        if i < first_row {
            continue;
        }
        let Some(current) = band else {
            return Err(AppError::Internal("band not seeded at first row".into()));
        };
        let state = RecurrenceState {
            avg_gain,
            avg_loss,
            atr: atr_val,
        };
        if flipped && i > first_row {
            out.signals.push(trend_signal(bar, &current));
        }
        out.rows.push(build_row(bars, i, state, current, params));
    }

    Ok(out)
}

/// Resume the series from a stored `anchor` row.
///
/// `bars` must contain the anchor's bar plus at least [`context_bars`] bars up to and
/// including it. Rows are produced for every bar after the anchor; the result is identical
/// to what [`compute_series`] yields for those dates over the full history.
pub fn extend_series(
    bars: &[PriceBar],
    anchor: &IndicatorRow,
    params: &IndicatorParams,
) -> Result<SeriesOutput, AppError> {
    check_params(params)?;
    let anchor_idx = bars
        .iter()
        .position(|b| b.date == anchor.date)
        .ok_or_else(|| {
            AppError::Internal(format!(
                "anchor bar {} missing from context for {}",
                anchor.date, anchor.symbol
            ))
        })?;
    check_data_len(anchor_idx + 1, context_bars(params))?;

    let rsi_p = params.rsi_period;
    let atr_p = params.atr_period;
    let mut avg_gain = anchor.state.avg_gain;
    let mut avg_loss = anchor.state.avg_loss;
    let mut atr_val = anchor.state.atr;
    let mut band = Band {
        trend: anchor.trend,
        upper: anchor.upper_band,
        lower: anchor.lower_band,
    };

    let mut out = SeriesOutput::default();
    for i in (anchor_idx + 1)..bars.len() {
        let bar = &bars[i];
        let prev_close = bars[i - 1].close;

        let (gain, loss) = split_change(bar.close - prev_close);
        avg_gain = wilder(avg_gain, gain, rsi_p);
        avg_loss = wilder(avg_loss, loss, rsi_p);
        atr_val = wilder(atr_val, true_range(bar, Some(prev_close)), atr_p);

        let next = band.step(bar, atr_val, params.band_multiplier);
        if next.trend != band.trend {
            out.signals.push(trend_signal(bar, &next));
        }
        band = next;

        let state = RecurrenceState {
            avg_gain,
            avg_loss,
            atr: atr_val,
        };
        out.rows.push(build_row(bars, i, state, band, params));
    }
    Ok(out)
}

/// Day-over-day change in percent. `None` when the previous close is zero.
pub fn daily_change_pct(prev_close: f64, close: f64) -> Option<f64> {
    if prev_close == 0.0 {
        None
    } else {
        Some((close - prev_close) / prev_close * 100.0)
    }
}

// ── Helpers ──

fn check_params(params: &IndicatorParams) -> Result<(), AppError> {
    if params.rsi_period == 0 || params.atr_period == 0 || params.ma_period == 0 || params.volume_period == 0 {
        return Err(AppError::InvalidIndicatorParams("periods must be positive".into()));
    }
    if !(params.band_multiplier > 0.0) {
        return Err(AppError::InvalidIndicatorParams("band multiplier must be positive".into()));
    }
    Ok(())
}

fn check_data_len(available: usize, needed: usize) -> Result<(), AppError> {
    if available < needed {
        return Err(AppError::InsufficientHistory { needed, available });
    }
    Ok(())
}

fn split_change(change: f64) -> (f64, f64) {
    if change > 0.0 {
        (change, 0.0)
    } else {
        (0.0, -change)
    }
}

/// Wilder smoothing step.
fn wilder(prev: f64, current: f64, period: usize) -> f64 {
    (prev * (period as f64 - 1.0) + current) / period as f64
}

fn oscillator(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

fn true_range(bar: &PriceBar, prev_close: Option<f64>) -> f64 {
    let hl = bar.high - bar.low;
    match prev_close {
        None => hl,
        Some(pc) => hl.max((bar.high - pc).abs()).max((bar.low - pc).abs()),
    }
}

/// Mean of the `period` values ending at `end`, or `None` if the window is incomplete.
fn full_window_mean(values: impl Fn(usize) -> f64, end: usize, period: usize) -> Option<f64> {
    if end + 1 < period {
        return None;
    }
    let sum: f64 = (end + 1 - period..=end).map(values).sum();
    Some(sum / period as f64)
}

fn volume_ratio(bars: &[PriceBar], end: usize, period: usize) -> f64 {
    let start = (end + 1).saturating_sub(period);
    let total: i64 = bars[start..=end].iter().map(|b| b.volume).sum();
    let avg = total as f64 / (end + 1 - start) as f64;
    if avg > 0.0 {
        bars[end].volume as f64 / avg
    } else {
        0.0
    }
}

fn build_row(
    bars: &[PriceBar],
    i: usize,
    state: RecurrenceState,
    band: Band,
    params: &IndicatorParams,
) -> IndicatorRow {
    let bar = &bars[i];
    IndicatorRow {
        symbol: bar.symbol.clone(),
        date: bar.date,
        oscillator: oscillator(state.avg_gain, state.avg_loss),
        short_ma: full_window_mean(|k| bars[k].close, i, params.ma_period),
        trend: band.trend,
        upper_band: band.upper,
        lower_band: band.lower,
        volume: bar.volume,
        volume_ratio: volume_ratio(bars, i, params.volume_period),
        state,
    }
}

fn trend_signal(bar: &PriceBar, band: &Band) -> TrendSignal {
    let (kind, band_value) = match band.trend {
        TrendState::Up => (TrendSignalKind::FlipToUp, band.lower),
        TrendState::Down => (TrendSignalKind::FlipToDown, band.upper),
    };
    TrendSignal {
        symbol: bar.symbol.clone(),
        date: bar.date,
        kind,
        close: bar.close,
        band_value,
    }
}

// ── Trend band ──

#[derive(Debug, Clone, Copy, PartialEq)]
struct Band {
    trend: TrendState,
    upper: f64,
    lower: f64,
}

impl Band {
    fn basic(bar: &PriceBar, atr: f64, multiplier: f64) -> (f64, f64) {
        let mid = bar.midpoint();
        (mid + multiplier * atr, mid - multiplier * atr)
    }

    fn seed(bar: &PriceBar, atr: f64, multiplier: f64) -> Self {
        let (upper, lower) = Self::basic(bar, atr, multiplier);
        let trend = if bar.close >= bar.midpoint() {
            TrendState::Up
        } else {
            TrendState::Down
        };
        Band { trend, upper, lower }
    }

    /// Ratchet the active band, then flip if the close crosses it.
    fn step(self, bar: &PriceBar, atr: f64, multiplier: f64) -> Self {
        let (basic_upper, basic_lower) = Self::basic(bar, atr, multiplier);
        match self.trend {
            TrendState::Up => {
                let lower = self.lower.max(basic_lower);
                if bar.close < lower {
                    Band {
                        trend: TrendState::Down,
                        upper: basic_upper,
                        lower: basic_lower,
                    }
                } else {
                    Band {
                        trend: TrendState::Up,
                        upper: basic_upper,
                        lower,
                    }
                }
            }
            TrendState::Down => {
                let upper = self.upper.min(basic_upper);
                if bar.close > upper {
                    Band {
                        trend: TrendState::Up,
                        upper: basic_upper,
                        lower: basic_lower,
                    }
                } else {
                    // a wide bar after a calm stretch can push the basic lower band past the active one
                    Band {
                        trend: TrendState::Down,
                        upper,
                        lower: basic_lower.min(upper),
                    }
                }
            }
        }
    }
}

// ══════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════
