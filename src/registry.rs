//! Tenant registry: maps tenants to their physical database and provisioning status.

use crate::error::RegistryError;
use crate::params::validate_database_name;
use crate::store::TenantStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Provisioning status of a tenant database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    NotCreated,
    Created,
    Failed,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::NotCreated => "not_created",
            TenantStatus::Created => "created",
            TenantStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_created" => Ok(TenantStatus::NotCreated),
            "created" => Ok(TenantStatus::Created),
            "failed" => Ok(TenantStatus::Failed),
            _ => Err(RegistryError::InvalidRecord(format!(
                "invalid tenant status: {} (expected not_created, created or failed)",
                s
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: i64,
    pub database_name: String,
    pub status: TenantStatus,
    /// Fallback tenant when a request names none.
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantRecord {
    pub fn is_created(&self) -> bool {
        self.status == TenantStatus::Created
    }
}

/// Registry operations over a [`TenantStore`]. Cheap to clone.
#[derive(Clone, Debug)]
pub struct TenantRegistry {
    store: Arc<dyn TenantStore>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        TenantRegistry { store }
    }

    pub fn store(&self) -> &Arc<dyn TenantStore> {
        &self.store
    }

    /// Id of the record for `database_name`, creating a `not_created` record if there is none.
    /// A concurrent insert of the same name loses on the unique constraint and re-reads.
    pub async fn onboard_new_database_config(&self, database_name: &str) -> Result<i64, RegistryError> {
        validate_database_name(database_name)
            .map_err(|e| RegistryError::InvalidRecord(e.to_string()))?;
        if let Some(existing) = self.store.find_by_database_name(database_name).await? {
            return Ok(existing.id);
        }
        match self.store.insert(database_name, TenantStatus::NotCreated).await {
            Ok(record) => {
                tracing::info!(database = %database_name, id = record.id, "onboarded tenant database");
                Ok(record.id)
            }
            Err(RegistryError::Duplicate(_)) => {
                tracing::debug!(database = %database_name, "lost onboarding race, reusing existing record");
                self.store
                    .find_by_database_name(database_name)
                    .await?
                    .map(|r| r.id)
                    .ok_or_else(|| RegistryError::NotFound(format!("tenant database {}", database_name)))
            }
            Err(e) => Err(e),
        }
    }

    /// Records still waiting for their database, ordered by id.
    pub async fn get_list_of_not_created_databases(&self) -> Result<Vec<TenantRecord>, RegistryError> {
        self.store.find_by_status(TenantStatus::NotCreated).await
    }

    pub async fn get_default_tenant_database(&self) -> Result<TenantRecord, RegistryError> {
        self.store
            .find_default()
            .await?
            .ok_or_else(|| RegistryError::NotFound("default tenant database".into()))
    }

    pub async fn get(&self, id: i64) -> Result<TenantRecord, RegistryError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("tenant {}", id)))
    }

    pub async fn find_by_database_name(&self, database_name: &str) -> Result<Option<TenantRecord>, RegistryError> {
        self.store.find_by_database_name(database_name).await
    }

    pub async fn mark_status(&self, id: i64, status: TenantStatus) -> Result<(), RegistryError> {
        self.store.update_status(id, status).await?;
        tracing::debug!(id, status = %status, "tenant status updated");
        Ok(())
    }

    pub async fn set_default(&self, id: i64) -> Result<(), RegistryError> {
        self.store.set_default(id).await
    }

    /// Delete the record for `database_name`. The physical database is left alone.
    pub async fn remove(&self, database_name: &str) -> Result<(), RegistryError> {
        let record = self
            .store
            .find_by_database_name(database_name)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("tenant database {}", database_name)))?;
        self.store.delete(record.id).await?;
        tracing::info!(database = %database_name, id = record.id, "removed tenant record");
        Ok(())
    }
}
