use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use chrono::NaiveDate;

use crate::errors::AppError;
use crate::models::bar::PriceBar;
use crate::models::indicator::{IndicatorRow, TrendState};

const HEADER: [&str; 10] = [
    "date",
    "close",
    "change_pct",
    "oscillator",
    "short_ma",
    "trend",
    "upper_band",
    "lower_band",
    "volume",
    "volume_ratio",
];

/// Write one CSV line per indicator row, joined with its bar's close and change.
///
/// Rows whose bar is missing are skipped; empty cells mark absent optional values.
pub fn write_table<W: Write>(writer: W, bars: &[PriceBar], rows: &[IndicatorRow]) -> Result<W, AppError> {
    let by_date: HashMap<NaiveDate, &PriceBar> = bars.iter().map(|b| (b.date, b)).collect();
    let mut wtr = csv::Writer::from_writer(writer);

    wtr.write_record(HEADER)
        .map_err(|e| AppError::FileWrite(e.to_string()))?;

    for row in rows {
        let Some(bar) = by_date.get(&row.date) else {
            continue;
        };
        wtr.write_record([
            row.date.to_string(),
            format!("{:.4}", bar.close),
            bar.change_pct.map(|c| format!("{:.4}", c)).unwrap_or_default(),
            format!("{:.4}", row.oscillator),
            row.short_ma.map(|m| format!("{:.4}", m)).unwrap_or_default(),
            trend_label(row.trend).to_string(),
            format!("{:.4}", row.upper_band),
            format!("{:.4}", row.lower_band),
            row.volume.to_string(),
            format!("{:.4}", row.volume_ratio),
        ])
        .map_err(|e| AppError::FileWrite(e.to_string()))?;
    }

    wtr.flush().map_err(|e| AppError::FileWrite(e.to_string()))?;
    wtr.into_inner()
        .map_err(|e| AppError::FileWrite(e.to_string()))
}

/// Render the table into memory.
pub fn table_bytes(bars: &[PriceBar], rows: &[IndicatorRow]) -> Result<Vec<u8>, AppError> {
    write_table(Vec::new(), bars, rows)
}

/// Write the table to `path`, replacing any existing file.
pub fn write_table_csv(bars: &[PriceBar], rows: &[IndicatorRow], path: &Path) -> Result<(), AppError> {
    let file = std::fs::File::create(path)
        .map_err(|e| AppError::FileWrite(format!("Cannot create CSV: {}", e)))?;
    write_table(file, bars, rows)?;
    Ok(())
}

fn trend_label(trend: TrendState) -> &'static str {
    match trend {
        TrendState::Up => "up",
        TrendState::Down => "down",
    }
}
