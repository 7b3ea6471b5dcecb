//! Environment-driven configuration for the ingest binary.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::price::Interval;
use crate::services::schema_manager::validate_table_name;
use crate::services::store_writer::{
    WriterOptions, DEFAULT_BATCH_SIZE, DEFAULT_MAX_BATCH_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_MS,
    MAX_BATCH_ATTEMPTS, MAX_BATCH_SIZE,
};
use crate::services::yahoo_finance;

pub const DEFAULT_TABLE: &str = "StockPrice";
pub const DEFAULT_YEARS: u32 = 5;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub table: String,
    pub writer: WriterOptions,
    pub interval: Interval,
    pub years: u32,
    pub yahoo_base_url: String,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let table = get("PRICE_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if validate_table_name(&table).is_err() {
            return Err(ConfigError::Invalid {
                key: "PRICE_TABLE",
                value: table,
            });
        }

        let batch_size: usize = parse_or(&get, "INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid {
                key: "INGEST_BATCH_SIZE",
                value: batch_size.to_string(),
            });
        }

        let max_batch_attempts: u32 =
            parse_or(&get, "INGEST_MAX_BATCH_ATTEMPTS", DEFAULT_MAX_BATCH_ATTEMPTS)?;
        if max_batch_attempts == 0 || max_batch_attempts > MAX_BATCH_ATTEMPTS {
            return Err(ConfigError::Invalid {
                key: "INGEST_MAX_BATCH_ATTEMPTS",
                value: max_batch_attempts.to_string(),
            });
        }

        let retry_delay_ms: u64 =
            parse_or(&get, "INGEST_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?;

        let interval = get("INGEST_INTERVAL")
            .map(Interval::new)
            .unwrap_or_default();

        let years: u32 = parse_or(&get, "INGEST_YEARS", DEFAULT_YEARS)?;

        let yahoo_base_url =
            get("YAHOO_BASE_URL").unwrap_or_else(|| yahoo_finance::DEFAULT_BASE_URL.to_string());

        Ok(Self {
            database_url,
            table,
            writer: WriterOptions {
                batch_size,
                max_batch_attempts,
                retry_base_delay: Duration::from_millis(retry_delay_ms),
            },
            interval,
            years,
            yahoo_base_url,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&'static str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
