use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sampling interval used when neither the row nor the caller names one.
/// Also the column default of `interval` in the price table.
pub const DEFAULT_INTERVAL: &str = "1M";

/// Widths of the `symbol` and `interval` columns.
pub const MAX_SYMBOL_LEN: usize = 50;
pub const MAX_INTERVAL_LEN: usize = 20;

/// Sampling granularity label, e.g. "1D", "1W", "1M".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interval(String);

impl Interval {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self(DEFAULT_INTERVAL.to_string())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row as returned by a price source, before normalization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawPriceRow {
    pub date: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adjusted_close: Option<f64>,
    pub volume: Option<i64>,
    /// Interval label reported by the source, if any
    pub interval: Option<String>,
}

/// One normalized observation, keyed by (date, symbol, interval).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub date: DateTime<Utc>,
    pub symbol: String,
    pub interval: Interval,
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub adjusted_close: Option<f64>,
    pub volume: Option<i64>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RecordError {
    #[error("symbol is empty")]
    EmptySymbol,
    #[error("negative volume {volume} for {symbol} at {date}")]
    NegativeVolume {
        symbol: String,
        date: DateTime<Utc>,
        volume: i64,
    },
    #[error("symbol {symbol:?} is longer than {max} characters")]
    SymbolTooLong { symbol: String, max: usize },
    #[error("interval {interval:?} is longer than {max} characters")]
    IntervalTooLong { interval: String, max: usize },
}

/// Uppercased, trimmed symbol as used in the identity triple.
pub fn normalize_symbol(symbol: &str) -> Result<String, RecordError> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(RecordError::EmptySymbol);
    }
    if symbol.chars().count() > MAX_SYMBOL_LEN {
        return Err(RecordError::SymbolTooLong {
            symbol: symbol.to_string(),
            max: MAX_SYMBOL_LEN,
        });
    }
    Ok(symbol.to_uppercase())
}

/// Reject labels that do not fit the `interval` column.
pub fn validate_interval(interval: &Interval) -> Result<(), RecordError> {
    if interval.as_str().chars().count() > MAX_INTERVAL_LEN {
        return Err(RecordError::IntervalTooLong {
            interval: interval.to_string(),
            max: MAX_INTERVAL_LEN,
        });
    }
    Ok(())
}

impl PriceRecord {
    /// Build a record from a source row.
    ///
    /// The interval is taken from the row first, then `requested`, then
    /// [`DEFAULT_INTERVAL`]. Blank labels count as absent.
    pub fn from_raw(
        symbol: &str,
        requested: Option<&Interval>,
        row: RawPriceRow,
    ) -> Result<Self, RecordError> {
        let symbol = normalize_symbol(symbol)?;

        if let Some(volume) = row.volume.filter(|v| *v < 0) {
            return Err(RecordError::NegativeVolume {
                symbol,
                date: row.date,
                volume,
            });
        }

        let interval = row
            .interval
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(Interval::new)
            .or_else(|| requested.filter(|i| !i.is_empty()).cloned())
            .unwrap_or_default();
        validate_interval(&interval)?;

        Ok(Self {
            date: row.date,
            symbol,
            interval,
            open: row.open,
            close: row.close,
            high: row.high,
            low: row.low,
            adjusted_close: row.adjusted_close,
            volume: row.volume,
        })
    }

    /// Adjusted close when present, plain close otherwise.
    pub fn reference_price(&self) -> Option<f64> {
        self.adjusted_close.or(self.close)
    }
}
