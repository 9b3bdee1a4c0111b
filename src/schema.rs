//! Schema diffing against a live tenant database and the session that applies it.

use crate::driver::DriverConnection;
use crate::error::{DriverError, StatementFailure};
use crate::metadata::{ColumnDef, ColumnDefault, IndexDef, TableDef, TenantMetadata};
use crate::platform::Platform;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

/// Computes the statements that move a live database towards `metadata`.
/// In safe mode nothing destructive is returned.
#[async_trait]
pub trait SchemaProvider: Send + Sync + Debug {
    async fn update_schema_statements(
        &self,
        conn: &mut dyn DriverConnection,
        metadata: &TenantMetadata,
        safe_mode: bool,
    ) -> Result<Vec<String>, DriverError>;
}

/// Structure of a live database as reported by its catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveSchema {
    /// table -> columns in ordinal order
    pub tables: BTreeMap<String, Vec<String>>,
    pub indexes: BTreeSet<String>,
}

impl LiveSchema {
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .map(|cols| cols.iter().any(|c| c == column))
            .unwrap_or(false)
    }
}

/// Reads the live schema from `information_schema` and the index catalog.
#[derive(Clone, Debug, Default)]
pub struct CatalogSchemaProvider;

impl CatalogSchemaProvider {
    pub async fn introspect(&self, conn: &mut dyn DriverConnection) -> Result<LiveSchema, DriverError> {
        let platform = conn.platform();
        let mut live = LiveSchema::default();
        for table in conn.fetch_first_column(platform.list_tables_sql()).await? {
            live.tables.entry(table).or_default();
        }
        for qualified in conn.fetch_first_column(platform.list_columns_sql()).await? {
            if let Some((table, column)) = qualified.split_once('.') {
                live.tables
                    .entry(table.to_string())
                    .or_default()
                    .push(column.to_string());
            }
        }
        live.indexes = conn
            .fetch_first_column(platform.list_indexes_sql())
            .await?
            .into_iter()
            .collect();
        Ok(live)
    }
}

#[async_trait]
impl SchemaProvider for CatalogSchemaProvider {
    async fn update_schema_statements(
        &self,
        conn: &mut dyn DriverConnection,
        metadata: &TenantMetadata,
        safe_mode: bool,
    ) -> Result<Vec<String>, DriverError> {
        let live = self.introspect(conn).await?;
        Ok(diff(metadata, &live, conn.platform(), safe_mode))
    }
}

/// Ordered statements taking `live` to `metadata`. Tables and columns are added, indexes
/// created; drops are only emitted when `safe_mode` is off.
pub fn diff(metadata: &TenantMetadata, live: &LiveSchema, platform: Platform, safe_mode: bool) -> Vec<String> {
    let mut statements = Vec::new();

    for table in &metadata.tables {
        let table_name = platform.quote_identifier(&table.name);
        match live.tables.get(&table.name) {
            None => statements.push(create_table_sql(table, platform)),
            Some(live_columns) => {
                for column in &table.columns {
                    if !live_columns.iter().any(|c| c == &column.name) {
                        statements.push(format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            table_name,
                            column_sql(column, platform)
                        ));
                    }
                }
                if !safe_mode {
                    for live_column in live_columns {
                        if table.column(live_column).is_none() {
                            statements.push(format!(
                                "ALTER TABLE {} DROP COLUMN {}",
                                table_name,
                                platform.quote_identifier(live_column)
                            ));
                        }
                    }
                }
            }
        }
        for index in &table.indexes {
            if !live.indexes.contains(&index.name) {
                statements.push(create_index_sql(&table.name, index, platform));
            }
        }
    }

    if !safe_mode {
        for live_table in live.tables.keys() {
            if metadata.table(live_table).is_none() {
                statements.push(format!("DROP TABLE {}", platform.quote_identifier(live_table)));
            }
        }
    }

    statements
}

fn column_sql(column: &ColumnDef, platform: Platform) -> String {
    let mut def = format!("{} {}", platform.quote_identifier(&column.name), column.type_);
    if !column.nullable {
        def.push_str(" NOT NULL");
    }
    if let Some(ref d) = column.default {
        def.push_str(" DEFAULT ");
        match d {
            ColumnDefault::Literal(s) => def.push_str(&format!("'{}'", s.replace('\'', "''"))),
            ColumnDefault::Expression { expression } => def.push_str(expression),
        }
    }
    def
}

fn create_table_sql(table: &TableDef, platform: Platform) -> String {
    let mut defs: Vec<String> = table.columns.iter().map(|c| column_sql(c, platform)).collect();
    if let Some(ref pk) = table.primary_key {
        let cols: Vec<String> = pk.columns().iter().map(|c| platform.quote_identifier(c)).collect();
        defs.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }
    format!(
        "CREATE TABLE {} (\n  {}\n)",
        platform.quote_identifier(&table.name),
        defs.join(",\n  ")
    )
}

fn create_index_sql(table: &str, index: &IndexDef, platform: Platform) -> String {
    let cols: Vec<String> = index.columns.iter().map(|c| platform.quote_identifier(c)).collect();
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        platform.quote_identifier(&index.name),
        platform.quote_identifier(table),
        cols.join(", ")
    )
}

/// Schema-aware view of one tenant connection. Owned and closed by the caller; the
/// connection itself stays with the caller.
#[derive(Debug)]
pub struct SchemaSession<'c> {
    conn: &'c mut dyn DriverConnection,
    provider: Arc<dyn SchemaProvider>,
    metadata: Arc<TenantMetadata>,
}

pub fn new_schema_session<'c>(
    conn: &'c mut dyn DriverConnection,
    provider: Arc<dyn SchemaProvider>,
    metadata: Arc<TenantMetadata>,
) -> SchemaSession<'c> {
    SchemaSession {
        conn,
        provider,
        metadata,
    }
}

impl<'c> SchemaSession<'c> {
    pub fn database(&self) -> &str {
        self.conn.database()
    }

    pub fn metadata(&self) -> &TenantMetadata {
        &self.metadata
    }

    pub fn platform(&self) -> Platform {
        self.conn.platform()
    }

    pub async fn begin(&mut self) -> Result<(), DriverError> {
        self.conn.begin().await
    }

    pub async fn commit(&mut self) -> Result<(), DriverError> {
        self.conn.commit().await
    }

    pub async fn rollback(&mut self) -> Result<(), DriverError> {
        self.conn.rollback().await
    }

    /// Non-destructive statements needed to bring the tenant up to date.
    pub async fn update_schema_statements(&mut self) -> Result<Vec<String>, DriverError> {
        self.provider
            .update_schema_statements(&mut *self.conn, &self.metadata, true)
            .await
    }

    /// Execute statements in order, stopping at the first failure.
    pub async fn apply(&mut self, statements: &[String]) -> Result<(), StatementFailure> {
        let total = statements.len();
        for (i, sql) in statements.iter().enumerate() {
            if let Err(source) = self.conn.execute(sql).await {
                return Err(StatementFailure {
                    position: i + 1,
                    total,
                    statement: sql.clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// End the session. It borrows the caller's connection and owns nothing else, so closing
    /// only gives the borrow back; the caller still releases the connection.
    pub fn close(self) {
        tracing::debug!(database = %self.conn.database(), "schema session closed");
    }
}
