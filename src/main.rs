use chrono::{Months, Utc};
use sea_orm::Database;
use std::env;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use price_ingest::config::IngestConfig;
use price_ingest::services::growth::GrowthSummary;
use price_ingest::services::ingestion::{IngestOutcome, IngestionPipeline};
use price_ingest::services::schema_manager::PriceSchemaManager;
use price_ingest::services::store_writer::StoreWriter;
use price_ingest::services::yahoo_finance::YahooFinanceSource;

const DEFAULT_SYMBOLS: [&str; 2] = ["SP500", "GOLD"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,price_ingest=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Usage: price-ingest [SYMBOL ...]
    let mut symbols: Vec<String> = env::args().skip(1).collect();
    if symbols.is_empty() {
        symbols = DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect();
    }

    let config = IngestConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let db = Database::connect(&config.database_url).await?;

    let schema = PriceSchemaManager::new(db.clone());
    let writer = StoreWriter::new(db, schema.clone(), config.writer);
    let source = Arc::new(YahooFinanceSource::new(config.yahoo_base_url.clone()));
    let pipeline = IngestionPipeline::new(source, schema, writer, config.table.clone())
        .with_default_interval(config.interval.clone());

    let end = Utc::now().date_naive();
    let start = end
        .checked_sub_months(Months::new(config.years * 12))
        .unwrap_or(end);

    let mut failures = 0;
    for symbol in &symbols {
        match pipeline.ingest(symbol, start, end).await {
            Ok(IngestOutcome::NoData { symbol }) => {
                tracing::warn!("No prices available for {} between {} and {}", symbol, start, end);
            }
            Ok(IngestOutcome::Stored(summary)) => {
                tracing::info!(
                    "Stored {} of {} rows for {} in {} ({} already present, {} skipped)",
                    summary.stats.inserted,
                    summary.fetched,
                    summary.symbol,
                    summary.table,
                    summary.stats.ignored(),
                    summary.skipped
                );
                match GrowthSummary::from_records(&summary.records) {
                    Some(growth) => tracing::info!(
                        "{} growth over the last {:.1} years is {:.2}% per year",
                        growth.symbol,
                        growth.years,
                        growth.annualized_pct
                    ),
                    None => tracing::info!(
                        "Not enough data to compute growth for {}",
                        summary.symbol
                    ),
                }
            }
            Err(e) => {
                tracing::error!("Failed to ingest {}: {}", symbol, e);
                failures += 1;
            }
        }
    }

    tracing::info!(
        "Ingest finished: {} symbols, {} failures",
        symbols.len(),
        failures
    );

    Ok(())
}
