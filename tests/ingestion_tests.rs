mod common;

use std::sync::Arc;

use price_ingest::models::price::{Interval, RawPriceRow, RecordError};
use price_ingest::services::ingestion::{IngestError, IngestOutcome, IngestionPipeline};
use price_ingest::services::price_source::SourceError;
use price_ingest::services::yahoo_finance::parse_chart;

use crate::common::{
    components, count_rows, day, month, raw_row, setup_test_db, stored_rows, StaticSource,
};

async fn pipeline(
    source: Arc<StaticSource>,
) -> (sea_orm::DatabaseConnection, IngestionPipeline) {
    let db = setup_test_db().await.unwrap();
    let (schema, writer) = components(&db, 100);
    let pipeline = IngestionPipeline::new(source, schema, writer, "StockPrice");
    (db, pipeline)
}

fn monthly_rows() -> Vec<RawPriceRow> {
    vec![
        raw_row(month(2024, 1), 2050.0),
        raw_row(month(2024, 2), 2030.0),
        raw_row(month(2024, 3), 2230.0),
    ]
}

#[tokio::test]
async fn test_ingest_stores_normalized_records() {
    let source = Arc::new(StaticSource::new(Some(monthly_rows())));
    let (db, pipeline) = pipeline(source.clone()).await;

    let outcome = pipeline
        .ingest("gold", day(2024, 1, 1), day(2024, 3, 31))
        .await
        .unwrap();

    let summary = match outcome {
        IngestOutcome::Stored(summary) => summary,
        other => panic!("expected Stored, got {:?}", other),
    };
    assert_eq!(summary.symbol, "GOLD");
    assert_eq!(summary.table, "StockPrice");
    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.skipped, 0);
    assert!(summary.schema.created);
    assert_eq!(summary.stats.inserted, 3);
    assert_eq!(source.calls(), 1);

    let rows = stored_rows(&db, "StockPrice").await;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.symbol == "GOLD" && r.interval == "1M"));
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let source = Arc::new(StaticSource::new(Some(monthly_rows())));
    let (db, pipeline) = pipeline(source).await;

    pipeline
        .ingest("SP500", day(2024, 1, 1), day(2024, 3, 31))
        .await
        .unwrap();
    let second = pipeline
        .ingest("SP500", day(2024, 1, 1), day(2024, 3, 31))
        .await
        .unwrap();

    match second {
        IngestOutcome::Stored(summary) => {
            assert!(!summary.schema.created);
            assert_eq!(summary.stats.inserted, 0);
            assert_eq!(summary.stats.ignored(), 3);
        }
        other => panic!("expected Stored, got {:?}", other),
    }
    assert_eq!(count_rows(&db, "StockPrice").await, 3);
}

#[tokio::test]
async fn test_no_data_touches_nothing() {
    for rows in [None, Some(Vec::new())] {
        let source = Arc::new(StaticSource::new(rows));
        let (db, pipeline) = pipeline(source.clone()).await;

        let outcome = pipeline
            .ingest("SP500", day(2024, 1, 1), day(2024, 3, 31))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::NoData { ref symbol } if symbol == "SP500"));
        assert_eq!(source.calls(), 1);

        let (schema, _) = components(&db, 100);
        assert!(!schema.inspect_table("StockPrice").await.unwrap().exists);
    }
}

#[tokio::test]
async fn test_invalid_rows_are_skipped() {
    let mut rows = monthly_rows();
    rows[1].volume = Some(-5);
    let source = Arc::new(StaticSource::new(Some(rows)));
    let (db, pipeline) = pipeline(source).await;

    let outcome = pipeline
        .ingest("GOLD", day(2024, 1, 1), day(2024, 3, 31))
        .await
        .unwrap();

    match outcome {
        IngestOutcome::Stored(summary) => {
            assert_eq!(summary.fetched, 3);
            assert_eq!(summary.skipped, 1);
            assert_eq!(summary.records.len(), 2);
            assert_eq!(summary.stats.inserted, 2);
        }
        other => panic!("expected Stored, got {:?}", other),
    }
    assert_eq!(count_rows(&db, "StockPrice").await, 2);
}

#[tokio::test]
async fn test_row_interval_wins_over_requested() {
    let mut rows = monthly_rows();
    rows[0].interval = Some("1d".to_string());
    let source = Arc::new(StaticSource::new(Some(rows)));
    let (db, pipeline) = pipeline(source).await;

    pipeline
        .ingest_with_interval(
            "GOLD",
            day(2024, 1, 1),
            day(2024, 3, 31),
            Some(Interval::new("1W")),
        )
        .await
        .unwrap();

    let intervals: Vec<String> = stored_rows(&db, "StockPrice")
        .await
        .into_iter()
        .map(|r| r.interval)
        .collect();
    assert_eq!(intervals, vec!["1D", "1W", "1W"]);
}

#[tokio::test]
async fn test_source_failure_creates_nothing() {
    let source = Arc::new(StaticSource::failing());
    let (db, pipeline) = pipeline(source).await;

    let err = pipeline
        .ingest("SP500", day(2024, 1, 1), day(2024, 3, 31))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Source(SourceError::Api { status: 503, .. })));

    let (schema, _) = components(&db, 100);
    assert!(!schema.inspect_table("StockPrice").await.unwrap().exists);
}

#[tokio::test]
async fn test_rejects_inverted_range_and_empty_symbol() {
    let source = Arc::new(StaticSource::new(Some(monthly_rows())));
    let (_db, pipeline) = pipeline(source.clone()).await;

    let err = pipeline
        .ingest("SP500", day(2024, 3, 31), day(2024, 1, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidRange { .. }));

    let err = pipeline
        .ingest("   ", day(2024, 1, 1), day(2024, 3, 31))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Record(_)));

    assert_eq!(source.calls(), 0);
}

fn chart_with_one_bar(ts: i64) -> String {
    format!(
        r#"{{"chart": {{"result": [{{"timestamp": [{}],
            "indicators": {{"quote": [{{"close": [4800.0], "volume": [1000]}}]}}}}],
            "error": null}}}}"#,
        ts
    )
}

#[tokio::test]
async fn test_rerun_with_shifted_bar_time_stores_one_row() {
    let db = setup_test_db().await.unwrap();
    let monthly = Interval::default();

    // the January bar stamped at 05:00Z, then reported again mid-month while open
    for ts in [1704085200, 1705330800] {
        let rows = parse_chart(&chart_with_one_bar(ts), &monthly).unwrap();
        let (schema, writer) = components(&db, 100);
        let pipeline = IngestionPipeline::new(
            Arc::new(StaticSource::new(rows)),
            schema,
            writer,
            "StockPrice",
        );
        pipeline
            .ingest("SP500", day(2024, 1, 1), day(2024, 1, 31))
            .await
            .unwrap();
    }

    assert_eq!(count_rows(&db, "StockPrice").await, 1);
}

#[tokio::test]
async fn test_blank_interval_falls_back_to_default() {
    let source = Arc::new(StaticSource::new(Some(monthly_rows())));
    let (db, pipeline) = pipeline(source).await;

    pipeline
        .ingest_with_interval(
            "GOLD",
            day(2024, 1, 1),
            day(2024, 3, 31),
            Some(Interval::new("  ")),
        )
        .await
        .unwrap();

    let rows = stored_rows(&db, "StockPrice").await;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.interval == "1M"));
}

#[tokio::test]
async fn test_overlong_symbol_is_rejected_before_fetch() {
    let source = Arc::new(StaticSource::new(Some(monthly_rows())));
    let (db, pipeline) = pipeline(source.clone()).await;

    let err = pipeline
        .ingest(&"X".repeat(51), day(2024, 1, 1), day(2024, 3, 31))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::Record(RecordError::SymbolTooLong { max: 50, .. })
    ));
    assert_eq!(source.calls(), 0);

    let (schema, _) = components(&db, 100);
    assert!(!schema.inspect_table("StockPrice").await.unwrap().exists);
}
