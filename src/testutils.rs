//! In-memory database server double. Counts opens and closes, stages statements
//! inside transactions and can be told to fail specific statements or connects.

use crate::driver::{Driver, DriverConnection};
use crate::error::{DriverError, RegistryError};
use crate::metadata::TenantMetadata;
use crate::params::ConnectionParams;
use crate::platform::Platform;
use crate::registry::{TenantRecord, TenantStatus};
use crate::schema::SchemaProvider;
use crate::store::{MemoryTenantStore, TenantStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Query answered with the committed statements of the connection's database.
pub const LIVE_SCHEMA_SQL: &str = "SELECT statement FROM fake_live_schema";

/// Rows the fake returns for the platform's catalog queries.
#[derive(Clone, Debug, Default)]
struct Catalog {
    tables: Vec<String>,
    columns: Vec<String>,
    indexes: Vec<String>,
}

#[derive(Debug, Default)]
struct ServerState {
    /// database -> statements committed against it
    databases: BTreeMap<String, Vec<String>>,
    catalogs: BTreeMap<String, Catalog>,
    open: usize,
    peak_open: usize,
    connects: Vec<ConnectionParams>,
    executed: Vec<(String, String)>,
    fail_statements: Vec<String>,
    fail_connect: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn with_databases(names: &[&str]) -> Self {
        let server = FakeServer::default();
        {
            let mut state = server.state.lock().unwrap();
            for name in names {
                state.databases.insert(name.to_string(), Vec::new());
            }
        }
        server
    }

    pub fn driver(&self) -> Arc<dyn Driver> {
        Arc::new(FakeDriver {
            server: self.clone(),
        })
    }

    pub fn params(&self, dbname: &str) -> ConnectionParams {
        ConnectionParams {
            dbname: dbname.to_string(),
            password: Some("secret".into()),
            ..ConnectionParams::new(Platform::Postgres, "db.internal", "app")
        }
    }

    /// Catalog rows for `database`. Columns are given as `table.column`.
    pub fn set_catalog(&self, database: &str, tables: &[&str], columns: &[&str], indexes: &[&str]) {
        let owned = |rows: &[&str]| -> Vec<String> { rows.iter().map(|r| r.to_string()).collect() };
        self.state.lock().unwrap().catalogs.insert(
            database.to_string(),
            Catalog {
                tables: owned(tables),
                columns: owned(columns),
                indexes: owned(indexes),
            },
        );
    }

    pub fn fail_statements_containing(&self, needle: &str) {
        self.state.lock().unwrap().fail_statements.push(needle.to_string());
    }

    pub fn fail_connect_to(&self, database: &str) {
        self.state.lock().unwrap().fail_connect.push(database.to_string());
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().unwrap().open
    }

    pub fn peak_open_connections(&self) -> usize {
        self.state.lock().unwrap().peak_open
    }

    pub fn connects_to(&self, database: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connects
            .iter()
            .filter(|p| p.dbname == database)
            .count()
    }

    pub fn last_connect(&self) -> Option<ConnectionParams> {
        self.state.lock().unwrap().connects.last().cloned()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn executed_starting_with(&self, prefix: &str) -> usize {
        self.executed().iter().filter(|s| s.starts_with(prefix)).count()
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().unwrap().databases.contains_key(name)
    }

    pub fn applied(&self, database: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .databases
            .get(database)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct FakeDriver {
    server: FakeServer,
}

#[async_trait]
impl Driver for FakeDriver {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn DriverConnection>, DriverError> {
        let mut state = self.server.state.lock().unwrap();
        state.connects.push(params.clone());
        if state.fail_connect.contains(&params.dbname) {
            return Err(DriverError::Rejected(format!(
                "connection refused for {}",
                params.dbname
            )));
        }
        if !state.databases.contains_key(&params.dbname) {
            return Err(DriverError::Rejected(format!(
                "database \"{}\" does not exist",
                params.dbname
            )));
        }
        state.open += 1;
        state.peak_open = state.peak_open.max(state.open);
        Ok(Box::new(FakeConnection {
            server: self.server.clone(),
            platform: params.driver,
            database: params.dbname.clone(),
            staged: None,
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct FakeConnection {
    server: FakeServer,
    platform: Platform,
    database: String,
    staged: Option<Vec<String>>,
    closed: bool,
}

fn is_ddl(sql: &str) -> bool {
    ["CREATE ", "ALTER ", "DROP "].iter().any(|p| sql.starts_with(p))
}

fn unquote(name: &str) -> String {
    name.trim()
        .trim_matches(|c| c == '"' || c == '`')
        .to_string()
}

#[async_trait]
impl DriverConnection for FakeConnection {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        if self.closed {
            return Err(DriverError::Rejected("connection is closed".into()));
        }
        let mut state = self.server.state.lock().unwrap();
        state.executed.push((self.database.clone(), sql.to_string()));
        if state.fail_statements.iter().any(|n| sql.contains(n.as_str())) {
            return Err(DriverError::Rejected(format!("simulated failure: {}", sql)));
        }

        if sql == "BEGIN" || sql == "START TRANSACTION" {
            self.staged = Some(Vec::new());
        } else if sql == "COMMIT" {
            if let Some(staged) = self.staged.take() {
                if let Some(applied) = state.databases.get_mut(&self.database) {
                    applied.extend(staged);
                }
            }
        } else if sql == "ROLLBACK" {
            self.staged = None;
        } else if let Some(name) = sql.strip_prefix("CREATE DATABASE ") {
            let name = unquote(name);
            if state.databases.contains_key(&name) {
                return Err(DriverError::Rejected(format!("database {} already exists", name)));
            }
            state.databases.insert(name, Vec::new());
        } else if let Some(name) = sql.strip_prefix("DROP DATABASE ") {
            let name = unquote(name);
            if state.databases.remove(&name).is_none() {
                return Err(DriverError::Rejected(format!("database {} does not exist", name)));
            }
        } else if let Some(name) = sql.strip_prefix("USE ") {
            self.database = unquote(name);
        } else if self.platform == Platform::MySql && is_ddl(sql) {
            // MySQL commits the open transaction before and after DDL.
            let staged = self.staged.take().unwrap_or_default();
            let applied = state
                .databases
                .get_mut(&self.database)
                .ok_or_else(|| DriverError::Rejected(format!("no database {}", self.database)))?;
            applied.extend(staged);
            applied.push(sql.to_string());
        } else if let Some(staged) = self.staged.as_mut() {
            staged.push(sql.to_string());
        } else {
            let applied = state
                .databases
                .get_mut(&self.database)
                .ok_or_else(|| DriverError::Rejected(format!("no database {}", self.database)))?;
            applied.push(sql.to_string());
        }
        Ok(1)
    }

    async fn fetch_first_column(&mut self, sql: &str) -> Result<Vec<String>, DriverError> {
        if self.closed {
            return Err(DriverError::Rejected("connection is closed".into()));
        }
        let mut state = self.server.state.lock().unwrap();
        state.executed.push((self.database.clone(), sql.to_string()));
        if state.fail_statements.iter().any(|n| sql.contains(n.as_str())) {
            return Err(DriverError::Rejected(format!("simulated failure: {}", sql)));
        }
        if sql == self.platform.list_databases_sql() {
            return Ok(state.databases.keys().cloned().collect());
        }
        if sql == LIVE_SCHEMA_SQL {
            return Ok(state.databases.get(&self.database).cloned().unwrap_or_default());
        }
        if let Some(catalog) = state.catalogs.get(&self.database) {
            if sql == self.platform.list_tables_sql() {
                return Ok(catalog.tables.clone());
            }
            if sql == self.platform.list_columns_sql() {
                return Ok(catalog.columns.clone());
            }
            if sql == self.platform.list_indexes_sql() {
                return Ok(catalog.indexes.clone());
            }
        }
        Ok(Vec::new())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.staged = None;
            self.server.state.lock().unwrap().open -= 1;
        }
        Ok(())
    }
}

/// Schema provider returning a fixed statement list.
#[derive(Debug, Default)]
pub struct StaticSchemaProvider {
    statements: Vec<String>,
    calls: AtomicUsize,
}

impl StaticSchemaProvider {
    pub fn new(statements: &[&str]) -> Self {
        StaticSchemaProvider {
            statements: statements.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn update_schema_statements(
        &self,
        _conn: &mut dyn DriverConnection,
        _metadata: &TenantMetadata,
        safe_mode: bool,
    ) -> Result<Vec<String>, DriverError> {
        assert!(safe_mode, "tenant schema updates must run in safe mode");
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.statements.clone())
    }
}

/// Tenant store whose writes can be switched to fail.
#[derive(Debug, Default)]
pub struct FlakyTenantStore {
    inner: MemoryTenantStore,
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
}

impl FlakyTenantStore {
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<(), RegistryError> {
        if flag.load(Ordering::SeqCst) {
            return Err(RegistryError::Store(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl TenantStore for FlakyTenantStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<TenantRecord>, RegistryError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_database_name(&self, name: &str) -> Result<Option<TenantRecord>, RegistryError> {
        self.inner.find_by_database_name(name).await
    }

    async fn find_by_status(&self, status: TenantStatus) -> Result<Vec<TenantRecord>, RegistryError> {
        self.inner.find_by_status(status).await
    }

    async fn find_default(&self) -> Result<Option<TenantRecord>, RegistryError> {
        self.inner.find_default().await
    }

    async fn insert(&self, name: &str, status: TenantStatus) -> Result<TenantRecord, RegistryError> {
        Self::check(&self.fail_inserts)?;
        self.inner.insert(name, status).await
    }

    async fn update_status(&self, id: i64, status: TenantStatus) -> Result<(), RegistryError> {
        Self::check(&self.fail_updates)?;
        self.inner.update_status(id, status).await
    }

    async fn set_default(&self, id: i64) -> Result<(), RegistryError> {
        self.inner.set_default(id).await
    }

    async fn delete(&self, id: i64) -> Result<bool, RegistryError> {
        self.inner.delete(id).await
    }
}
