//! Ingestion pipeline
//!
//! Fetches rows from a [`PriceSource`], normalizes them into
//! [`PriceRecord`]s, ensures the destination table and appends the records.

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::price::{
    normalize_symbol, validate_interval, Interval, PriceRecord, RecordError,
};
use crate::services::price_source::{PriceSource, SourceError};
use crate::services::schema_manager::{EnsureReport, PriceSchemaManager, SchemaError};
use crate::services::store_writer::{AppendStats, StoreWriter, WriteError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("price source error: {0}")]
    Source(#[from] SourceError),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("write error: {0}")]
    Write(#[from] WriteError),
}

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub symbol: String,
    pub table: String,
    pub fetched: usize,
    /// Rows rejected during normalization
    pub skipped: usize,
    pub records: Vec<PriceRecord>,
    pub schema: EnsureReport,
    pub stats: AppendStats,
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// The source returned nothing; no schema or write operation ran.
    NoData { symbol: String },
    Stored(IngestSummary),
}

#[derive(Clone)]
pub struct IngestionPipeline {
    source: Arc<dyn PriceSource>,
    schema: PriceSchemaManager,
    writer: StoreWriter,
    table: String,
    default_interval: Interval,
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn PriceSource>,
        schema: PriceSchemaManager,
        writer: StoreWriter,
        table: impl Into<String>,
    ) -> Self {
        Self {
            source,
            schema,
            writer,
            table: table.into(),
            default_interval: Interval::default(),
        }
    }

    /// A blank label keeps the current default.
    pub fn with_default_interval(mut self, interval: Interval) -> Self {
        if !interval.is_empty() {
            self.default_interval = interval;
        }
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Ingest `symbol` for `[start, end]` at the pipeline's default interval.
    pub async fn ingest(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<IngestOutcome, IngestError> {
        self.ingest_with_interval(symbol, start, end, None).await
    }

    pub async fn ingest_with_interval(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Option<Interval>,
    ) -> Result<IngestOutcome, IngestError> {
        if start > end {
            return Err(IngestError::InvalidRange { start, end });
        }
        let symbol = normalize_symbol(symbol)?;
        let interval = interval
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.default_interval.clone());
        validate_interval(&interval)?;

        let rows = match self.source.fetch(&symbol, start, end, &interval).await? {
            Some(rows) if !rows.is_empty() => rows,
            _ => {
                info!(
                    symbol = %symbol,
                    start = %start,
                    end = %end,
                    "No price data returned, skipping"
                );
                return Ok(IngestOutcome::NoData { symbol });
            }
        };

        let fetched = rows.len();
        let mut skipped = 0;
        let mut records = Vec::with_capacity(fetched);
        for row in rows {
            match PriceRecord::from_raw(&symbol, Some(&interval), row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Skipping invalid price row");
                    skipped += 1;
                }
            }
        }

        let schema = self.schema.ensure_table(&self.table).await?;
        for failure in &schema.failures {
            warn!(table = %self.table, failure = %failure, "Schema change not applied");
        }

        let stats = self.writer.append(&self.table, &records).await?;

        debug!(
            symbol = %symbol,
            fetched = fetched,
            skipped = skipped,
            inserted = stats.inserted,
            "Ingest finished"
        );

        Ok(IngestOutcome::Stored(IngestSummary {
            symbol,
            table: self.table.clone(),
            fetched,
            skipped,
            records,
            schema,
            stats,
        }))
    }
}
