//! Static description of the price time-series table.
//!
//! The table name is chosen at runtime, so there is no SeaORM entity for it.
//! The schema manager and the store writer both read column names from
//! [`PriceColumn`].

use sea_orm::sea_query::{ColumnDef, Iden};
use sea_orm::DeriveIden;

use crate::models::price::{DEFAULT_INTERVAL, MAX_INTERVAL_LEN, MAX_SYMBOL_LEN};

#[derive(DeriveIden, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PriceColumn {
    Date,
    Symbol,
    Interval,
    Open,
    Close,
    High,
    Low,
    AdjustedClose,
    Volume,
}

impl PriceColumn {
    pub fn name(&self) -> String {
        Iden::to_string(self)
    }

    pub fn is_identity(&self) -> bool {
        IDENTITY_COLUMNS.contains(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Timestamp,
    Text(u32),
    Double,
    BigInteger,
}

#[derive(Clone, Copy, Debug)]
pub struct ColumnSpec {
    pub column: PriceColumn,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub default: Option<&'static str>,
}

impl ColumnSpec {
    /// Column definition usable in both `CREATE TABLE` and `ALTER TABLE .. ADD COLUMN`.
    pub fn column_def(&self) -> ColumnDef {
        let mut def = ColumnDef::new(self.column);
        match self.kind {
            ColumnKind::Timestamp => def.timestamp_with_time_zone(),
            ColumnKind::Text(len) => def.string_len(len),
            ColumnKind::Double => def.double(),
            ColumnKind::BigInteger => def.big_integer(),
        };
        if self.nullable {
            def.null();
        } else {
            def.not_null();
        }
        if let Some(default) = self.default {
            def.default(default);
        }
        def
    }
}

/// Row identity, in primary-key order.
pub const IDENTITY_COLUMNS: [PriceColumn; 3] =
    [PriceColumn::Date, PriceColumn::Symbol, PriceColumn::Interval];

/// Every column the price table must carry, in creation order.
pub static PRICE_COLUMNS: [ColumnSpec; 9] = [
    ColumnSpec {
        column: PriceColumn::Date,
        kind: ColumnKind::Timestamp,
        nullable: false,
        default: None,
    },
    ColumnSpec {
        column: PriceColumn::Symbol,
        kind: ColumnKind::Text(MAX_SYMBOL_LEN as u32),
        nullable: false,
        default: None,
    },
    ColumnSpec {
        column: PriceColumn::Interval,
        kind: ColumnKind::Text(MAX_INTERVAL_LEN as u32),
        nullable: false,
        default: Some(DEFAULT_INTERVAL),
    },
    ColumnSpec {
        column: PriceColumn::Open,
        kind: ColumnKind::Double,
        nullable: true,
        default: None,
    },
    ColumnSpec {
        column: PriceColumn::Close,
        kind: ColumnKind::Double,
        nullable: true,
        default: None,
    },
    ColumnSpec {
        column: PriceColumn::High,
        kind: ColumnKind::Double,
        nullable: true,
        default: None,
    },
    ColumnSpec {
        column: PriceColumn::Low,
        kind: ColumnKind::Double,
        nullable: true,
        default: None,
    },
    ColumnSpec {
        column: PriceColumn::AdjustedClose,
        kind: ColumnKind::Double,
        nullable: true,
        default: None,
    },
    ColumnSpec {
        column: PriceColumn::Volume,
        kind: ColumnKind::BigInteger,
        nullable: true,
        default: None,
    },
];

/// Name of the composite primary-key constraint for `table`.
pub fn primary_key_name(table: &str) -> String {
    format!("pk_{}", table)
}

/// Double-quoted SQL identifier. Accepted by both Postgres and SQLite.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_names() {
        assert_eq!(PriceColumn::Date.name(), "date");
        assert_eq!(PriceColumn::Interval.name(), "interval");
        assert_eq!(PriceColumn::AdjustedClose.name(), "adjusted_close");
    }

    #[test]
    fn test_identity_columns_are_not_null() {
        for spec in PRICE_COLUMNS.iter() {
            assert_eq!(spec.nullable, !spec.column.is_identity(), "{:?}", spec.column);
        }
    }

    #[test]
    fn test_interval_default_matches_record_default() {
        let spec = PRICE_COLUMNS
            .iter()
            .find(|s| s.column == PriceColumn::Interval)
            .unwrap();
        assert_eq!(spec.default, Some(DEFAULT_INTERVAL));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("StockPrice"), "\"StockPrice\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
