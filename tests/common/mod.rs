#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr,
    FromQueryResult, Statement,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use price_ingest::models::price::{Interval, PriceRecord, RawPriceRow};
use price_ingest::services::price_source::{PriceSource, SourceError};
use price_ingest::services::schema_manager::PriceSchemaManager;
use price_ingest::services::store_writer::{StoreWriter, WriterOptions};

/// Set up an in-memory SQLite database.
/// A single pooled connection keeps every query on the same database.
pub async fn setup_test_db() -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);

    Database::connect(options).await
}

pub fn fast_writer_options(batch_size: usize) -> WriterOptions {
    WriterOptions {
        batch_size,
        max_batch_attempts: 2,
        retry_base_delay: Duration::from_millis(0),
    }
}

pub fn components(db: &DatabaseConnection, batch_size: usize) -> (PriceSchemaManager, StoreWriter) {
    let schema = PriceSchemaManager::new(db.clone());
    let writer = StoreWriter::new(db.clone(), schema.clone(), fast_writer_options(batch_size));
    (schema, writer)
}

pub fn month(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
}

pub fn day(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn record(symbol: &str, date: DateTime<Utc>, close: f64) -> PriceRecord {
    PriceRecord {
        date,
        symbol: symbol.to_string(),
        interval: Interval::default(),
        open: Some(close),
        close: Some(close),
        high: Some(close),
        low: Some(close),
        adjusted_close: Some(close),
        volume: Some(1_000_000),
    }
}

pub fn raw_row(date: DateTime<Utc>, close: f64) -> RawPriceRow {
    RawPriceRow {
        date,
        open: Some(close),
        high: Some(close),
        low: Some(close),
        close: Some(close),
        adjusted_close: Some(close),
        volume: Some(1_000),
        interval: None,
    }
}

pub async fn execute(db: &DatabaseConnection, sql: &str) {
    db.execute_unprepared(sql).await.unwrap();
}

#[derive(Debug, FromQueryResult)]
struct Count {
    count: i64,
}

pub async fn count_rows(db: &DatabaseConnection, table: &str) -> i64 {
    Count::find_by_statement(Statement::from_string(
        DatabaseBackend::Sqlite,
        format!("SELECT COUNT(*) AS count FROM \"{}\"", table),
    ))
    .one(db)
    .await
    .unwrap()
    .map(|c| c.count)
    .unwrap_or(0)
}

pub async fn count_distinct_triples(db: &DatabaseConnection, table: &str) -> i64 {
    Count::find_by_statement(Statement::from_string(
        DatabaseBackend::Sqlite,
        format!(
            "SELECT COUNT(*) AS count FROM (SELECT DISTINCT \"date\", \"symbol\", \"interval\" FROM \"{}\")",
            table
        ),
    ))
    .one(db)
    .await
    .unwrap()
    .map(|c| c.count)
    .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, FromQueryResult)]
pub struct StoredRow {
    pub symbol: String,
    pub interval: String,
    pub close: Option<f64>,
    pub volume: Option<i64>,
}

pub async fn stored_rows(db: &DatabaseConnection, table: &str) -> Vec<StoredRow> {
    StoredRow::find_by_statement(Statement::from_string(
        DatabaseBackend::Sqlite,
        format!(
            "SELECT \"symbol\", \"interval\", \"close\", \"volume\" FROM \"{}\" ORDER BY \"date\", rowid",
            table
        ),
    ))
    .all(db)
    .await
    .unwrap()
}

#[derive(Debug, Clone, PartialEq, FromQueryResult)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub pk: i32,
}

pub async fn table_columns(db: &DatabaseConnection, table: &str) -> Vec<ColumnInfo> {
    ColumnInfo::find_by_statement(Statement::from_sql_and_values(
        DatabaseBackend::Sqlite,
        "SELECT name, type AS declared_type, pk FROM pragma_table_info(?) ORDER BY cid",
        [table.into()],
    ))
    .all(db)
    .await
    .unwrap()
}

/// Price source returning a fixed answer and counting calls.
pub struct StaticSource {
    rows: Option<Vec<RawPriceRow>>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(rows: Option<Vec<RawPriceRow>>) -> Self {
        Self {
            rows,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            rows: None,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for StaticSource {
    async fn fetch(
        &self,
        _symbol: &str,
        _start: NaiveDate,
        _end: NaiveDate,
        _interval: &Interval,
    ) -> Result<Option<Vec<RawPriceRow>>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SourceError::Api {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }
        Ok(self.rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_test_db() {
        let db = setup_test_db().await;
        assert!(db.is_ok(), "In-memory database should open");
    }
}
