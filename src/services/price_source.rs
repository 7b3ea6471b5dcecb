use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::price::{Interval, RawPriceRow};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("unsupported interval {0}")]
    UnsupportedInterval(Interval),
}

/// External market-data source.
///
/// `Ok(None)` and `Ok(Some(vec![]))` both mean the source has nothing for
/// the requested range; neither is an error.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: &Interval,
    ) -> Result<Option<Vec<RawPriceRow>>, SourceError>;
}
