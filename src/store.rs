//! Persistence for tenant records. The registry table lives in the central database, in a
//! schema named from `TENANT_REGISTRY_SCHEMA` env (default `tenancy`).

use crate::error::RegistryError;
use crate::registry::{TenantRecord, TenantStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Mutex;

/// Row store for [`TenantRecord`]s keyed on id and on database name (unique).
#[async_trait]
pub trait TenantStore: Send + Sync + Debug {
    async fn find_by_id(&self, id: i64) -> Result<Option<TenantRecord>, RegistryError>;

    async fn find_by_database_name(&self, name: &str) -> Result<Option<TenantRecord>, RegistryError>;

    /// Records with `status`, ordered by id.
    async fn find_by_status(&self, status: TenantStatus) -> Result<Vec<TenantRecord>, RegistryError>;

    /// A created record, the flagged default first, otherwise the lowest id.
    async fn find_default(&self) -> Result<Option<TenantRecord>, RegistryError>;

    /// Fails with [`RegistryError::Duplicate`] when the database name is taken.
    async fn insert(&self, database_name: &str, status: TenantStatus) -> Result<TenantRecord, RegistryError>;

    async fn update_status(&self, id: i64, status: TenantStatus) -> Result<(), RegistryError>;

    /// Flag `id` as the default tenant, clearing the flag elsewhere.
    async fn set_default(&self, id: i64) -> Result<(), RegistryError>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: i64) -> Result<bool, RegistryError>;
}

/// Schema name for the registry table. From env `TENANT_REGISTRY_SCHEMA`, default `tenancy`.
pub fn registry_schema() -> String {
    std::env::var("TENANT_REGISTRY_SCHEMA").unwrap_or_else(|_| "tenancy".into())
}

/// Returns schema-qualified registry table name (e.g. "tenancy._tenant_databases").
pub fn qualified_registry_table(schema: &str) -> String {
    format!("{}._tenant_databases", schema)
}

const RECORD_COLUMNS: &str = "id, database_name, status, is_default, created_at, updated_at";

type RecordRow = (i64, String, String, bool, DateTime<Utc>, DateTime<Utc>);

fn record_from_row(row: RecordRow) -> Result<TenantRecord, RegistryError> {
    let (id, database_name, status, is_default, created_at, updated_at) = row;
    Ok(TenantRecord {
        id,
        database_name,
        status: status.parse()?,
        is_default,
        created_at,
        updated_at,
    })
}

fn interpret_error(error: sqlx::Error, database_name: &str) -> RegistryError {
    if let sqlx::Error::Database(ref d) = error {
        // Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
        if d.code().as_deref() == Some("23505") {
            return RegistryError::Duplicate(database_name.to_string());
        }
    }
    RegistryError::Store(error)
}

/// PostgreSQL-backed store on the central database pool.
#[derive(Clone, Debug)]
pub struct PgTenantStore {
    pool: PgPool,
    schema: String,
    table: String,
}

impl PgTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_schema(pool, &registry_schema())
    }

    pub fn with_schema(pool: PgPool, schema: &str) -> Self {
        PgTenantStore {
            pool,
            schema: schema.to_string(),
            table: qualified_registry_table(schema),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the registry schema and table if missing. `database_name` is unique so that
    /// concurrent onboarding of the same name resolves to one row.
    pub async fn ensure_registry_table(&self) -> Result<(), RegistryError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .execute(&self.pool)
            .await?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                database_name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'not_created',
                is_default BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        let status_index = format!(
            "CREATE INDEX IF NOT EXISTS _tenant_databases_status_idx ON {} (status)",
            self.table
        );
        sqlx::query(&status_index).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<TenantRecord>, RegistryError> {
        let sql = format!("SELECT {} FROM {} WHERE id = $1", RECORD_COLUMNS, self.table);
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(record_from_row).transpose()
    }

    async fn find_by_database_name(&self, name: &str) -> Result<Option<TenantRecord>, RegistryError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE database_name = $1",
            RECORD_COLUMNS, self.table
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(record_from_row).transpose()
    }

    async fn find_by_status(&self, status: TenantStatus) -> Result<Vec<TenantRecord>, RegistryError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE status = $1 ORDER BY id",
            RECORD_COLUMNS, self.table
        );
        tracing::debug!(sql = %sql, "query");
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn find_default(&self) -> Result<Option<TenantRecord>, RegistryError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE status = $1 ORDER BY is_default DESC, id ASC LIMIT 1",
            RECORD_COLUMNS, self.table
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(TenantStatus::Created.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(record_from_row).transpose()
    }

    async fn insert(&self, database_name: &str, status: TenantStatus) -> Result<TenantRecord, RegistryError> {
        let sql = format!(
            "INSERT INTO {} (database_name, status) VALUES ($1, $2) RETURNING {}",
            self.table, RECORD_COLUMNS
        );
        let row: RecordRow = sqlx::query_as(&sql)
            .bind(database_name)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| interpret_error(e, database_name))?;
        record_from_row(row)
    }

    async fn update_status(&self, id: i64, status: TenantStatus) -> Result<(), RegistryError> {
        let sql = format!(
            "UPDATE {} SET status = $1, updated_at = NOW() WHERE id = $2",
            self.table
        );
        let done = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("tenant record {}", id)));
        }
        Ok(())
    }

    async fn set_default(&self, id: i64) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "UPDATE {} SET is_default = FALSE, updated_at = NOW() WHERE is_default AND id <> $1",
            self.table
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let done = sqlx::query(&format!(
            "UPDATE {} SET is_default = TRUE, updated_at = NOW() WHERE id = $1",
            self.table
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!("tenant record {}", id)));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<bool, RegistryError> {
        let done = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    records: BTreeMap<i64, TenantRecord>,
}

/// In-process store with the same uniqueness rule as the table.
#[derive(Debug, Default)]
pub struct MemoryTenantStore {
    state: Mutex<MemoryState>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn len(&self) -> usize {
        self.with_state(|s| s.records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<TenantRecord>, RegistryError> {
        Ok(self.with_state(|s| s.records.get(&id).cloned()))
    }

    async fn find_by_database_name(&self, name: &str) -> Result<Option<TenantRecord>, RegistryError> {
        Ok(self.with_state(|s| {
            s.records
                .values()
                .find(|r| r.database_name == name)
                .cloned()
        }))
    }

    async fn find_by_status(&self, status: TenantStatus) -> Result<Vec<TenantRecord>, RegistryError> {
        Ok(self.with_state(|s| {
            s.records
                .values()
                .filter(|r| r.status == status)
                .cloned()
                .collect()
        }))
    }

    async fn find_default(&self) -> Result<Option<TenantRecord>, RegistryError> {
        Ok(self.with_state(|s| {
            let mut created = s.records.values().filter(|r| r.status == TenantStatus::Created);
            let first = created.clone().next().cloned();
            created.find(|r| r.is_default).cloned().or(first)
        }))
    }

    async fn insert(&self, database_name: &str, status: TenantStatus) -> Result<TenantRecord, RegistryError> {
        self.with_state(|s| {
            if s.records.values().any(|r| r.database_name == database_name) {
                return Err(RegistryError::Duplicate(database_name.to_string()));
            }
            s.next_id += 1;
            let now = Utc::now();
            let record = TenantRecord {
                id: s.next_id,
                database_name: database_name.to_string(),
                status,
                is_default: false,
                created_at: now,
                updated_at: now,
            };
            s.records.insert(record.id, record.clone());
            Ok(record)
        })
    }

    async fn update_status(&self, id: i64, status: TenantStatus) -> Result<(), RegistryError> {
        self.with_state(|s| {
            let record = s
                .records
                .get_mut(&id)
                .ok_or_else(|| RegistryError::NotFound(format!("tenant record {}", id)))?;
            record.status = status;
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn set_default(&self, id: i64) -> Result<(), RegistryError> {
        self.with_state(|s| {
            if !s.records.contains_key(&id) {
                return Err(RegistryError::NotFound(format!("tenant record {}", id)));
            }
            for record in s.records.values_mut() {
                record.is_default = record.id == id;
            }
            Ok(())
        })
    }

    async fn delete(&self, id: i64) -> Result<bool, RegistryError> {
        Ok(self.with_state(|s| s.records.remove(&id).is_some()))
    }
}
