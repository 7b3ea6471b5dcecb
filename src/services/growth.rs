//! Growth of an instrument over the fetched window.

use chrono::{DateTime, Utc};

use crate::models::price::PriceRecord;

const DAYS_PER_YEAR: f64 = 365.25;

#[derive(Debug, Clone, PartialEq)]
pub struct GrowthSummary {
    pub symbol: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub start_price: f64,
    pub end_price: f64,
    pub total_pct: f64,
    pub years: f64,
    /// Total growth spread evenly over the years, not compounded
    pub annualized_pct: f64,
}

impl GrowthSummary {
    /// Growth between the earliest and latest priced records.
    ///
    /// Uses adjusted close, falling back to close. Returns `None` with fewer
    /// than two priced records, a zero start price or a zero-length span.
    pub fn from_records(records: &[PriceRecord]) -> Option<Self> {
        let priced = || {
            records
                .iter()
                .filter_map(|r| r.reference_price().map(|price| (r, price)))
        };
        let (first, start_price) = priced().min_by_key(|(r, _)| r.date)?;
        let (last, end_price) = priced().max_by_key(|(r, _)| r.date)?;

        if start_price == 0.0 || first.date >= last.date {
            return None;
        }

        let years = (last.date - first.date).num_days() as f64 / DAYS_PER_YEAR;
        if years <= 0.0 {
            return None;
        }

        let total_pct = (end_price - start_price) / start_price * 100.0;

        Some(Self {
            symbol: first.symbol.clone(),
            start_date: first.date,
            end_date: last.date,
            start_price,
            end_price,
            total_pct,
            years,
            annualized_pct: total_pct / years,
        })
    }
}
