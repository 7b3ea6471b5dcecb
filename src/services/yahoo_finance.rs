//! Yahoo Finance chart API client

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime};
use reqwest::Client;
use serde::Deserialize;

use crate::models::price::{Interval, RawPriceRow};
use crate::services::price_source::{PriceSource, SourceError};

pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

const USER_AGENT: &str = "Mozilla/5.0 (compatible; price-ingest/0.1)";

/// Bars are stamped at exchange midnight but `gmtoffset` is the offset in
/// effect now, so a stamp may sit one DST hour before local midnight.
const DST_ALLOWANCE_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    meta: Option<ChartMeta>,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
    #[serde(default)]
    adjclose: Vec<AdjClose>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    // some instruments report fractional volume
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Default, Deserialize)]
struct AdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

#[derive(Clone)]
pub struct YahooFinanceSource {
    client: Client,
    base_url: String,
}

impl YahooFinanceSource {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Yahoo ticker for a symbol. A few friendly names map to index/futures tickers.
    pub fn ticker_for(symbol: &str) -> String {
        match symbol.trim().to_uppercase().as_str() {
            "SP500" | "^GSPC" => "^GSPC".to_string(),
            "GOLD" | "GC=F" => "GC=F".to_string(),
            _ => symbol.trim().to_string(),
        }
    }

    /// Yahoo `interval` parameter for a sampling label.
    pub fn range_for(interval: &Interval) -> Result<&'static str, SourceError> {
        match interval.as_str() {
            "1D" => Ok("1d"),
            "1W" => Ok("1wk"),
            "1M" => Ok("1mo"),
            "3M" => Ok("3mo"),
            _ => Err(SourceError::UnsupportedInterval(interval.clone())),
        }
    }
}

#[async_trait]
impl PriceSource for YahooFinanceSource {
    async fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: &Interval,
    ) -> Result<Option<Vec<RawPriceRow>>, SourceError> {
        let range = Self::range_for(interval)?;
        let ticker = Self::ticker_for(symbol);
        let period1 = start.and_time(NaiveTime::MIN).and_utc().timestamp();
        // period2 is exclusive, so step past `end` to include it
        let period2 = end
            .checked_add_days(Days::new(1))
            .unwrap_or(end)
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp();

        tracing::info!(
            "Fetching {} prices for {} ({}) from Yahoo Finance",
            interval,
            symbol,
            ticker
        );

        let url = format!("{}/v8/finance/chart/{}", self.base_url, ticker);
        let response = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .header("user-agent", USER_AGENT)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", range.to_string()),
                ("events", "div,splits".to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api { status, body });
        }

        let body = response.text().await?;
        let rows = parse_chart(&body, interval)?;

        tracing::debug!(
            "Fetched {} rows for {}",
            rows.as_ref().map(Vec::len).unwrap_or(0),
            ticker
        );

        Ok(rows)
    }
}

/// Decode a chart payload into raw rows. Bars without any price are dropped.
///
/// Each row is dated at the start of its period at 00:00 UTC, so a bar keeps
/// the same identity whether Yahoo stamps it at midnight or, while the period
/// is still open, at the current time.
pub fn parse_chart(
    body: &str,
    interval: &Interval,
) -> Result<Option<Vec<RawPriceRow>>, SourceError> {
    let envelope: ChartEnvelope =
        serde_json::from_str(body).map_err(|e| SourceError::Decode(e.to_string()))?;

    if let Some(err) = envelope.chart.error {
        return Err(SourceError::Api {
            status: 200,
            body: format!("{}: {}", err.code, err.description),
        });
    }

    let Some(result) = envelope.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(None);
    };

    if result.timestamp.is_empty() {
        return Ok(None);
    }

    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let adjclose = result
        .indicators
        .adjclose
        .into_iter()
        .next()
        .unwrap_or_default()
        .adjclose;

    let offset = result.meta.and_then(|m| m.gmtoffset).unwrap_or(0);

    let at = |values: &Vec<Option<f64>>, i: usize| values.get(i).copied().flatten();

    let mut rows = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let local = DateTime::from_timestamp(*ts + offset + DST_ALLOWANCE_SECS, 0)
            .ok_or_else(|| SourceError::Decode(format!("invalid timestamp {}", ts)))?;
        let date = period_start(local.date_naive(), interval)
            .and_time(NaiveTime::MIN)
            .and_utc();

        let row = RawPriceRow {
            date,
            open: at(&quote.open, i),
            high: at(&quote.high, i),
            low: at(&quote.low, i),
            close: at(&quote.close, i),
            adjusted_close: at(&adjclose, i),
            volume: at(&quote.volume, i).map(|v| v.round() as i64),
            interval: None,
        };

        if row.open.is_none() && row.close.is_none() && row.adjusted_close.is_none() {
            continue;
        }
        rows.push(row);
    }

    Ok(Some(rows))
}

/// First day of the period containing `date`. Weekly bars start on Monday;
/// quarterly bars are folded onto calendar quarters.
fn period_start(date: NaiveDate, interval: &Interval) -> NaiveDate {
    match interval.as_str() {
        "1W" => date
            .checked_sub_days(Days::new(date.weekday().num_days_from_monday() as u64))
            .unwrap_or(date),
        "1M" => date.with_day(1).unwrap_or(date),
        "3M" => NaiveDate::from_ymd_opt(date.year(), date.month0() / 3 * 3 + 1, 1).unwrap_or(date),
        _ => date,
    }
}
