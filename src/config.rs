//! Static startup configuration, assembled once and passed to the lifecycle manager.

use crate::driver::DEFAULT_STATEMENT_TIMEOUT;
use crate::error::ConfigError;
use crate::params::ConnectionParams;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct TenancyConfig {
    /// Configured tenant connection. Host, credentials and driver are shared by all tenants.
    pub tenant: ConnectionParams,
    /// Central administrative database used for listing, creating and dropping databases.
    pub management_database: String,
    /// Central database holding the tenant registry (PostgreSQL).
    pub registry_url: String,
    pub registry_schema: String,
    pub statement_timeout: Duration,
    /// JSON file describing the tenant schema.
    pub metadata_path: Option<PathBuf>,
}

impl TenancyConfig {
    pub fn new(tenant: ConnectionParams, registry_url: impl Into<String>) -> Self {
        TenancyConfig {
            management_database: tenant.driver.default_management_database().to_string(),
            tenant,
            registry_url: registry_url.into(),
            registry_schema: "tenancy".into(),
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            metadata_path: None,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `TENANT_DB_URL` (required): tenant connection, e.g. `mysql://app:pw@db:3306/tenant_default`
    /// - `TENANT_MANAGEMENT_DATABASE`: admin database, default `postgres` / `mysql` per driver
    /// - `TENANT_REGISTRY_URL`: registry database, falls back to `DATABASE_URL`
    /// - `TENANT_REGISTRY_SCHEMA`: default `tenancy`
    /// - `TENANT_STATEMENT_TIMEOUT_SECS`: default 30
    /// - `TENANT_METADATA_PATH`: tenant schema JSON
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("TENANT_DB_URL").map_err(|_| ConfigError::Missing("TENANT_DB_URL"))?;
        let tenant = ConnectionParams::from_url(&url).map_err(|e| ConfigError::Invalid {
            var: "TENANT_DB_URL",
            reason: e.to_string(),
        })?;
        let registry_url = std::env::var("TENANT_REGISTRY_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::Missing("TENANT_REGISTRY_URL"))?;

        let mut config = TenancyConfig::new(tenant, registry_url);
        if let Ok(db) = std::env::var("TENANT_MANAGEMENT_DATABASE") {
            config.management_database = db;
        }
        if let Ok(schema) = std::env::var("TENANT_REGISTRY_SCHEMA") {
            config.registry_schema = schema;
        }
        if let Ok(secs) = std::env::var("TENANT_STATEMENT_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| ConfigError::Invalid {
                var: "TENANT_STATEMENT_TIMEOUT_SECS",
                reason: format!("'{}' is not a number of seconds", secs),
            })?;
            config.statement_timeout = Duration::from_secs(secs);
        }
        config.metadata_path = std::env::var("TENANT_METADATA_PATH").ok().map(PathBuf::from);
        Ok(config)
    }

    /// Tenant connection params pointed at the management database.
    pub fn management_params(&self) -> ConnectionParams {
        self.tenant.with_dbname(&self.management_database)
    }
}
