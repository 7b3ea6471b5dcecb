//! Batched, idempotent writes of price records.
//!
//! Every batch is one multi-row `INSERT .. ON CONFLICT (date, symbol,
//! interval) DO NOTHING` in its own transaction. Duplicate triples are
//! dropped by the store, never checked for up front.

use sea_orm::sea_query::{Alias, InsertStatement, OnConflict, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, Statement, TransactionTrait};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::entities::price_table::{PriceColumn, IDENTITY_COLUMNS, PRICE_COLUMNS};
use crate::models::price::PriceRecord;
use crate::services::schema_manager::{validate_table_name, PriceSchemaManager, SchemaError};

/// Rows per insert statement.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Keeps one statement under SQLite's bound-parameter limit.
pub const MAX_BATCH_SIZE: usize = 1000;

pub const DEFAULT_MAX_BATCH_ATTEMPTS: u32 = 3;

pub const MAX_BATCH_ATTEMPTS: u32 = 10;

pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(
        "table {table} is not ready for writes (missing columns: {missing_columns:?}, identity key present: {has_identity_key})"
    )]
    SchemaNotReady {
        table: String,
        missing_columns: Vec<String>,
        has_identity_key: bool,
    },
    #[error(
        "batch {batch_index} into {table} failed after {attempts} attempts ({committed_batches} earlier batches committed): {source}"
    )]
    BatchFailed {
        table: String,
        batch_index: usize,
        committed_batches: usize,
        attempts: u32,
        #[source]
        source: DbErr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    pub batch_size: usize,
    pub max_batch_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_attempts: DEFAULT_MAX_BATCH_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
        }
    }
}

/// Statistics from one append call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendStats {
    pub submitted: usize,
    pub inserted: u64,
    pub batches: usize,
}

impl AppendStats {
    /// Records dropped because their triple already existed.
    pub fn ignored(&self) -> u64 {
        (self.submitted as u64).saturating_sub(self.inserted)
    }
}

#[derive(Clone)]
pub struct StoreWriter {
    db: DatabaseConnection,
    schema: PriceSchemaManager,
    options: WriterOptions,
}

impl StoreWriter {
    pub fn new(db: DatabaseConnection, schema: PriceSchemaManager, options: WriterOptions) -> Self {
        let batch_size = options.batch_size.clamp(1, MAX_BATCH_SIZE);
        let max_batch_attempts = options.max_batch_attempts.clamp(1, MAX_BATCH_ATTEMPTS);
        Self {
            db,
            schema,
            options: WriterOptions {
                batch_size,
                max_batch_attempts,
                ..options
            },
        }
    }

    pub fn options(&self) -> WriterOptions {
        self.options
    }

    /// Append `records` to `table`, ignoring triples that already exist.
    ///
    /// Fails with [`WriteError::SchemaNotReady`] before any insert if the
    /// table lacks a required column or the identity key. Batches commit
    /// independently, so a failure leaves earlier batches in place.
    pub async fn append(
        &self,
        table: &str,
        records: &[PriceRecord],
    ) -> Result<AppendStats, WriteError> {
        validate_table_name(table)?;

        if records.is_empty() {
            debug!(table = %table, "Nothing to append");
            return Ok(AppendStats::default());
        }

        let inspection = self.schema.inspect_table(table).await?;
        if !inspection.is_ready() {
            return Err(WriteError::SchemaNotReady {
                table: table.to_string(),
                missing_columns: inspection
                    .missing_columns
                    .iter()
                    .map(PriceColumn::name)
                    .collect(),
                has_identity_key: inspection.has_identity_key(),
            });
        }

        let backend = self.db.get_database_backend();
        let mut stats = AppendStats {
            submitted: records.len(),
            ..Default::default()
        };

        for (batch_index, chunk) in records.chunks(self.options.batch_size).enumerate() {
            let statement = insert_statement(table, chunk)
                .map(|insert| backend.build(&insert))
                .map_err(|source| WriteError::BatchFailed {
                    table: table.to_string(),
                    batch_index,
                    committed_batches: stats.batches,
                    attempts: 0,
                    source,
                })?;

            let inserted = self
                .write_with_retry(table, batch_index, stats.batches, statement)
                .await?;

            debug!(
                table = %table,
                batch_index = batch_index,
                rows = chunk.len(),
                inserted = inserted,
                "Batch committed"
            );
            stats.inserted += inserted;
            stats.batches += 1;
        }

        info!(
            table = %table,
            submitted = stats.submitted,
            inserted = stats.inserted,
            ignored = stats.ignored(),
            batches = stats.batches,
            "Append complete"
        );

        Ok(stats)
    }

    /// A batch is always retried in full, never resumed partway.
    async fn write_with_retry(
        &self,
        table: &str,
        batch_index: usize,
        committed_batches: usize,
        statement: Statement,
    ) -> Result<u64, WriteError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.write_batch(statement.clone()).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) if attempts < self.options.max_batch_attempts => {
                    warn!(
                        table = %table,
                        batch_index = batch_index,
                        attempt = attempts,
                        error = %e,
                        "Batch insert failed, retrying..."
                    );
                    let delay = backoff_delay(self.options.retry_base_delay, attempts);
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    error!(
                        table = %table,
                        batch_index = batch_index,
                        attempts = attempts,
                        error = %source,
                        "Max retries exceeded for batch insert"
                    );
                    return Err(WriteError::BatchFailed {
                        table: table.to_string(),
                        batch_index,
                        committed_batches,
                        attempts,
                        source,
                    });
                }
            }
        }
    }

    async fn write_batch(&self, statement: Statement) -> Result<u64, DbErr> {
        let txn = self.db.begin().await?;
        let result = txn.execute(statement).await?;
        txn.commit().await?;
        Ok(result.rows_affected())
    }
}

/// Delay before retrying after failed attempt number `attempt` (1-based).
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

fn insert_statement(table: &str, records: &[PriceRecord]) -> Result<InsertStatement, DbErr> {
    let mut insert = Query::insert();
    insert
        .into_table(Alias::new(table))
        .columns(PRICE_COLUMNS.iter().map(|spec| spec.column));

    for record in records {
        insert
            .values(record_values(record))
            .map_err(|e| DbErr::Custom(format!("failed to bind price record: {}", e)))?;
    }

    insert.on_conflict(OnConflict::columns(IDENTITY_COLUMNS).do_nothing().to_owned());
    Ok(insert)
}

/// Values in [`PRICE_COLUMNS`] order.
fn record_values(record: &PriceRecord) -> Vec<SimpleExpr> {
    PRICE_COLUMNS
        .iter()
        .map(|spec| match spec.column {
            PriceColumn::Date => record.date.into(),
            PriceColumn::Symbol => record.symbol.as_str().into(),
            PriceColumn::Interval => record.interval.as_str().into(),
            PriceColumn::Open => record.open.into(),
            PriceColumn::Close => record.close.into(),
            PriceColumn::High => record.high.into(),
            PriceColumn::Low => record.low.into(),
            PriceColumn::AdjustedClose => record.adjusted_close.into(),
            PriceColumn::Volume => record.volume.into(),
        })
        .collect()
}
