//! Schema manager for price tables
//!
//! Creates the price table on first use and evolves older tables additively:
//! missing columns are added, and the composite (date, symbol, interval)
//! primary key is re-established when it is absent. Columns are never
//! dropped, renamed or retyped.

use lazy_static::lazy_static;
use regex::Regex;
use sea_orm::sea_query::{Alias, ColumnDef, Index, Table, TableCreateStatement};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, FromQueryResult, Statement,
    TransactionTrait,
};
use sea_orm_migration::SchemaManager;
use std::fmt;
use tracing::{debug, info, warn};

use crate::entities::price_table::{
    primary_key_name, quote_ident, ColumnSpec, PriceColumn, IDENTITY_COLUMNS, PRICE_COLUMNS,
};
use crate::services::table_locks::TableLocks;

lazy_static! {
    static ref TABLE_NAME_REGEX: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid table name {0:?}: expected a plain SQL identifier")]
    InvalidTableName(String),
    #[error("failed to inspect table {table}: {source}")]
    Inspect {
        table: String,
        #[source]
        source: DbErr,
    },
}

/// Reject anything that is not a plain identifier, since table names end up in DDL.
pub fn validate_table_name(table: &str) -> Result<(), SchemaError> {
    if TABLE_NAME_REGEX.is_match(table) {
        Ok(())
    } else {
        Err(SchemaError::InvalidTableName(table.to_string()))
    }
}

/// One structural change planned against a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChange {
    CreateTable,
    AddColumn(PriceColumn),
    AddPrimaryKey,
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::CreateTable => write!(f, "create table"),
            SchemaChange::AddColumn(column) => write!(f, "add column {}", column.name()),
            SchemaChange::AddPrimaryKey => write!(f, "add primary key (date, symbol, interval)"),
        }
    }
}

/// A change that the store rejected. The remaining changes are still attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChangeFailure {
    pub change: SchemaChange,
    pub reason: String,
}

impl fmt::Display for SchemaChangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.change, self.reason)
    }
}

/// How a backend can put a primary key on an existing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryKeyStrategy {
    /// `ALTER TABLE .. ADD CONSTRAINT .. PRIMARY KEY`
    AlterTable,
    /// Copy into a new table carrying the key, then swap names
    RebuildTable,
    Unsupported,
}

impl PrimaryKeyStrategy {
    pub fn for_backend(backend: DatabaseBackend) -> Self {
        match backend {
            DatabaseBackend::Postgres => PrimaryKeyStrategy::AlterTable,
            DatabaseBackend::Sqlite => PrimaryKeyStrategy::RebuildTable,
            DatabaseBackend::MySql => PrimaryKeyStrategy::Unsupported,
        }
    }
}

/// Current shape of a table relative to the required price schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableInspection {
    pub exists: bool,
    pub missing_columns: Vec<PriceColumn>,
    /// Primary-key column names, in key order
    pub primary_key: Vec<String>,
}

impl TableInspection {
    pub fn has_identity_key(&self) -> bool {
        let mut actual: Vec<&str> = self.primary_key.iter().map(String::as_str).collect();
        let mut expected: Vec<String> = IDENTITY_COLUMNS.iter().map(|c| c.name()).collect();
        actual.sort_unstable();
        expected.sort_unstable();
        actual == expected
    }

    pub fn is_ready(&self) -> bool {
        self.exists && self.missing_columns.is_empty() && self.has_identity_key()
    }
}

/// Outcome of [`PriceSchemaManager::ensure_table`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnsureReport {
    pub table: String,
    pub created: bool,
    pub applied: Vec<SchemaChange>,
    pub failures: Vec<SchemaChangeFailure>,
    /// Whether the table conforms after all changes were attempted
    pub ready: bool,
}

#[derive(Debug, FromQueryResult)]
struct KeyColumn {
    name: String,
}

#[derive(Debug, FromQueryResult)]
struct RowCount {
    count: i64,
}

#[derive(Debug, Clone, FromQueryResult)]
struct SqliteColumn {
    name: String,
    declared_type: String,
    not_null: i32,
    default_value: Option<String>,
}

/// Creates and additively migrates price tables.
#[derive(Clone)]
pub struct PriceSchemaManager {
    db: DatabaseConnection,
    locks: TableLocks,
}

impl PriceSchemaManager {
    pub fn new(db: DatabaseConnection) -> Self {
        Self::with_locks(db, TableLocks::new())
    }

    /// Share a lock registry with other managers in the same process.
    pub fn with_locks(db: DatabaseConnection, locks: TableLocks) -> Self {
        Self { db, locks }
    }

    pub fn primary_key_strategy(&self) -> PrimaryKeyStrategy {
        PrimaryKeyStrategy::for_backend(self.db.get_database_backend())
    }

    /// Make sure `table` exists with every price column and the composite key.
    ///
    /// Holds the per-table lock of this manager's registry for the whole
    /// call. Processes sharing a database must serialize calls for the same
    /// table themselves; creation uses `IF NOT EXISTS`, so a lost creation
    /// race is harmless, but concurrent migrations are not coordinated.
    ///
    /// Individual change failures do not abort the call. They are returned
    /// in [`EnsureReport::failures`] and `ready` tells whether the table is
    /// usable for writes.
    pub async fn ensure_table(&self, table: &str) -> Result<EnsureReport, SchemaError> {
        validate_table_name(table)?;
        let _guard = self.locks.lock(table).await;

        let before = self.inspect_table(table).await?;
        let mut report = EnsureReport {
            table: table.to_string(),
            created: false,
            applied: Vec::new(),
            failures: Vec::new(),
            ready: false,
        };

        let changes = if before.exists {
            plan_migration(&before)
        } else {
            vec![SchemaChange::CreateTable]
        };

        if changes.is_empty() {
            debug!(table = %table, "Table already conforms");
            report.ready = before.is_ready();
            return Ok(report);
        }

        info!(table = %table, changes = changes.len(), "Evolving price table schema");

        for change in changes {
            match self.apply(table, change).await {
                Ok(()) => {
                    info!(table = %table, change = %change, "Schema change applied");
                    if change == SchemaChange::CreateTable {
                        report.created = true;
                    }
                    report.applied.push(change);
                }
                Err(reason) => {
                    warn!(
                        table = %table,
                        change = %change,
                        error = %reason,
                        "Schema change failed"
                    );
                    report.failures.push(SchemaChangeFailure { change, reason });
                }
            }
        }

        let after = self.inspect_table(table).await?;
        report.ready = after.is_ready();
        if !report.ready {
            warn!(
                table = %table,
                missing_columns = ?after.missing_columns,
                primary_key = ?after.primary_key,
                "Table does not conform after schema evolution"
            );
        }

        Ok(report)
    }

    /// Read-only check of `table` against the required schema.
    pub async fn inspect_table(&self, table: &str) -> Result<TableInspection, SchemaError> {
        validate_table_name(table)?;
        self.inspect(table).await.map_err(|source| SchemaError::Inspect {
            table: table.to_string(),
            source,
        })
    }

    async fn inspect(&self, table: &str) -> Result<TableInspection, DbErr> {
        let manager = SchemaManager::new(&self.db);

        if !manager.has_table(table).await? {
            return Ok(TableInspection::default());
        }

        let mut missing_columns = Vec::new();
        for spec in PRICE_COLUMNS.iter() {
            if !manager.has_column(table, spec.column.name()).await? {
                missing_columns.push(spec.column);
            }
        }

        let primary_key = self.primary_key_columns(table).await?;

        Ok(TableInspection {
            exists: true,
            missing_columns,
            primary_key,
        })
    }

    async fn primary_key_columns(&self, table: &str) -> Result<Vec<String>, DbErr> {
        let backend = self.db.get_database_backend();
        let sql = match backend {
            DatabaseBackend::Sqlite => {
                "SELECT name FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk"
            }
            DatabaseBackend::Postgres => {
                r#"
                SELECT a.attname::text AS name
                FROM pg_index i
                JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                WHERE i.indrelid = to_regclass(quote_ident($1)) AND i.indisprimary
                ORDER BY array_position(i.indkey::int2[], a.attnum)
                "#
            }
            DatabaseBackend::MySql => {
                r#"
                SELECT COLUMN_NAME AS name
                FROM information_schema.KEY_COLUMN_USAGE
                WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
                ORDER BY ORDINAL_POSITION
                "#
            }
        };

        let columns = KeyColumn::find_by_statement(Statement::from_sql_and_values(
            backend,
            sql,
            [table.into()],
        ))
        .all(&self.db)
        .await?;

        Ok(columns.into_iter().map(|c| c.name).collect())
    }

    async fn apply(&self, table: &str, change: SchemaChange) -> Result<(), String> {
        match change {
            SchemaChange::CreateTable => self.create_table(table).await.map_err(|e| e.to_string()),
            SchemaChange::AddColumn(column) => {
                let spec = column_spec(column)
                    .ok_or_else(|| format!("no column definition for {}", column.name()))?;
                self.add_column(table, spec).await.map_err(|e| e.to_string())
            }
            SchemaChange::AddPrimaryKey => self.add_primary_key(table).await,
        }
    }

    async fn create_table(&self, table: &str) -> Result<(), DbErr> {
        let mut create = price_table_statement(table);
        create.if_not_exists();
        self.db.execute(self.build_create(&create)).await?;
        Ok(())
    }

    async fn add_column(&self, table: &str, spec: &ColumnSpec) -> Result<(), DbErr> {
        let alter = Table::alter()
            .table(Alias::new(table))
            .add_column(spec.column_def())
            .to_owned();

        let backend = self.db.get_database_backend();
        self.db.execute(backend.build(&alter)).await?;
        Ok(())
    }

    async fn add_primary_key(&self, table: &str) -> Result<(), String> {
        match self.primary_key_strategy() {
            PrimaryKeyStrategy::AlterTable => {
                let sql = format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                    quote_ident(table),
                    quote_ident(&primary_key_name(table)),
                    identity_column_list(),
                );
                self.db
                    .execute_unprepared(&sql)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            PrimaryKeyStrategy::RebuildTable => self.rebuild_with_primary_key(table).await,
            PrimaryKeyStrategy::Unsupported => Err(format!(
                "{:?} cannot add a primary key to an existing table",
                self.db.get_database_backend()
            )),
        }
    }

    /// SQLite cannot alter a primary key, so the table is recreated with the
    /// key and the rows copied over. Duplicate triples keep their first row.
    async fn rebuild_with_primary_key(&self, table: &str) -> Result<(), String> {
        let existing = self
            .sqlite_columns(table)
            .await
            .map_err(|e| format!("failed to read columns: {}", e))?;

        let unkeyed = self
            .count_unkeyed_rows(table, &existing)
            .await
            .map_err(|e| format!("failed to count rows: {}", e))?;
        if unkeyed > 0 {
            return Err(format!(
                "{} existing rows lack a complete (date, symbol, interval) identity, \
                 refusing to rebuild",
                unkeyed
            ));
        }

        let rebuild = format!("{}__rebuild", table);
        let mut create = Table::create();
        create.table(Alias::new(&rebuild));

        for spec in PRICE_COLUMNS.iter() {
            let name = spec.column.name();
            match existing.iter().find(|c| c.name == name) {
                Some(old) => create.col(preserved_column_def(old, Some(spec))),
                None => create.col(spec.column_def()),
            };
        }
        for old in existing.iter().filter(|c| !is_price_column(&c.name)) {
            create.col(preserved_column_def(old, None));
        }
        create.primary_key(&mut identity_index(table));

        let copied = existing
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let result: Result<(u64, u64), DbErr> = async {
            let txn = self.db.begin().await?;
            txn.execute_unprepared(&format!("DROP TABLE IF EXISTS {}", quote_ident(&rebuild)))
                .await?;
            txn.execute(self.build_create(&create)).await?;
            let inserted = txn
                .execute_unprepared(&format!(
                    "INSERT OR IGNORE INTO {new} ({cols}) SELECT {cols} FROM {old} ORDER BY rowid",
                    new = quote_ident(&rebuild),
                    cols = copied,
                    old = quote_ident(table),
                ))
                .await?
                .rows_affected();
            let total = RowCount::find_by_statement(Statement::from_string(
                DatabaseBackend::Sqlite,
                format!("SELECT COUNT(*) AS count FROM {}", quote_ident(table)),
            ))
            .one(&txn)
            .await?
            .map(|r| r.count as u64)
            .unwrap_or(0);
            txn.execute_unprepared(&format!("DROP TABLE {}", quote_ident(table)))
                .await?;
            txn.execute_unprepared(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(&rebuild),
                quote_ident(table)
            ))
            .await?;
            txn.commit().await?;
            Ok((inserted, total))
        }
        .await;

        let (inserted, total) = result.map_err(|e| format!("rebuild failed: {}", e))?;
        if inserted < total {
            warn!(
                table = %table,
                collapsed = total - inserted,
                "Duplicate identity rows collapsed during rebuild, first row kept"
            );
        }
        info!(table = %table, rows = inserted, "Rebuilt table with composite primary key");
        Ok(())
    }

    async fn sqlite_columns(&self, table: &str) -> Result<Vec<SqliteColumn>, DbErr> {
        SqliteColumn::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Sqlite,
            r#"
            SELECT name, type AS declared_type, "notnull" AS not_null, dflt_value AS default_value
            FROM pragma_table_info(?)
            ORDER BY cid
            "#,
            [table.into()],
        ))
        .all(&self.db)
        .await
    }

    /// Rows that could not receive a complete identity in the rebuilt table.
    /// A missing `interval` is fine since the rebuilt column has a default.
    async fn count_unkeyed_rows(
        &self,
        table: &str,
        existing: &[SqliteColumn],
    ) -> Result<i64, DbErr> {
        let present: Vec<String> = IDENTITY_COLUMNS
            .iter()
            .map(|c| c.name())
            .filter(|name| existing.iter().any(|c| &c.name == name))
            .collect();
        let lacks_required = [PriceColumn::Date, PriceColumn::Symbol]
            .iter()
            .any(|c| !present.contains(&c.name()));

        let filter = if lacks_required {
            String::new()
        } else {
            let nulls = present
                .iter()
                .map(|name| format!("{} IS NULL", quote_ident(name)))
                .collect::<Vec<_>>()
                .join(" OR ");
            format!(" WHERE {}", nulls)
        };

        let count = RowCount::find_by_statement(Statement::from_string(
            DatabaseBackend::Sqlite,
            format!("SELECT COUNT(*) AS count FROM {}{}", quote_ident(table), filter),
        ))
        .one(&self.db)
        .await?
        .map(|r| r.count)
        .unwrap_or(0);

        Ok(count)
    }

    /// SQLite gets `ON CONFLICT IGNORE` on the key constraint itself.
    fn build_create(&self, create: &TableCreateStatement) -> Statement {
        let backend = self.db.get_database_backend();
        let mut statement = backend.build(create);
        if backend == DatabaseBackend::Sqlite {
            statement.sql = with_conflict_ignore(&statement.sql);
        }
        statement
    }
}

/// Changes needed to bring an existing table up to the price schema.
pub fn plan_migration(inspection: &TableInspection) -> Vec<SchemaChange> {
    let mut changes: Vec<SchemaChange> = inspection
        .missing_columns
        .iter()
        .map(|c| SchemaChange::AddColumn(*c))
        .collect();

    let identity_added = inspection.missing_columns.iter().any(|c| c.is_identity());
    if identity_added || !inspection.has_identity_key() {
        changes.push(SchemaChange::AddPrimaryKey);
    }
    changes
}

fn price_table_statement(table: &str) -> TableCreateStatement {
    let mut create = Table::create();
    create.table(Alias::new(table));
    for spec in PRICE_COLUMNS.iter() {
        create.col(spec.column_def());
    }
    create.primary_key(&mut identity_index(table));
    create
}

fn identity_index(table: &str) -> sea_orm::sea_query::IndexCreateStatement {
    let mut index = Index::create();
    index.name(primary_key_name(table));
    for column in IDENTITY_COLUMNS {
        index.col(column);
    }
    index
}

fn identity_column_list() -> String {
    IDENTITY_COLUMNS
        .iter()
        .map(|c| quote_ident(&c.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_spec(column: PriceColumn) -> Option<&'static ColumnSpec> {
    PRICE_COLUMNS.iter().find(|s| s.column == column)
}

fn is_price_column(name: &str) -> bool {
    PRICE_COLUMNS.iter().any(|s| s.column.name() == name)
}

/// Keep an existing column's declared type, nullability and default.
/// Identity columns are forced to `NOT NULL`.
fn preserved_column_def(old: &SqliteColumn, spec: Option<&ColumnSpec>) -> ColumnDef {
    if old.declared_type.is_empty() {
        if let Some(spec) = spec {
            return spec.column_def();
        }
    }

    let mut def = ColumnDef::new(Alias::new(&old.name));
    if !old.declared_type.is_empty() {
        def.custom(Alias::new(&old.declared_type));
    }
    let identity = spec.map(|s| s.column.is_identity()).unwrap_or(false);
    if identity || old.not_null != 0 {
        def.not_null();
    }
    match (&old.default_value, spec.and_then(|s| s.default)) {
        (Some(default), _) => {
            def.extra(format!("DEFAULT {}", default));
        }
        (None, Some(default)) => {
            def.default(default);
        }
        (None, None) => {}
    }
    def
}

/// Append `ON CONFLICT IGNORE` to the trailing table constraint of a
/// `CREATE TABLE` rendered by sea-query. The primary key is the last element,
/// so the clause lands right after its column list.
fn with_conflict_ignore(sql: &str) -> String {
    match sql.rfind(')') {
        Some(pos) => format!("{} ON CONFLICT IGNORE {}", &sql[..pos], &sql[pos..]),
        None => sql.to_string(),
    }
}
