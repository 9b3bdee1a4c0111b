//! Physical tenant database lifecycle: create, bring schema up to date, drop.
//!
//! Every operation opens its own short-lived administrative connection and releases it on
//! all exit paths. Nothing here is shared between calls, so operations on different tenant
//! names can run concurrently.

use crate::config::TenancyConfig;
use crate::connection::release;
use crate::driver::{Driver, DriverConnection};
use crate::error::{DriverError, RegistryError, TenancyError, TenancyErrorKind};
use crate::metadata::TenantMetadata;
use crate::params::{validate_database_name, ConnectionParams};
use crate::registry::{TenantRegistry, TenantStatus};
use crate::schema::{new_schema_session, SchemaProvider, SchemaSession};
use std::sync::Arc;

/// Outcome of [`DatabaseManager::provision_pending`].
#[derive(Debug, Default)]
pub struct ProvisionReport {
    pub created: Vec<String>,
    pub failed: Vec<TenancyError>,
}

impl ProvisionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub struct DatabaseManager {
    driver: Arc<dyn Driver>,
    config: TenancyConfig,
    provider: Arc<dyn SchemaProvider>,
    metadata: Arc<TenantMetadata>,
    registry: TenantRegistry,
}

impl DatabaseManager {
    pub fn new(
        driver: Arc<dyn Driver>,
        config: TenancyConfig,
        provider: Arc<dyn SchemaProvider>,
        metadata: Arc<TenantMetadata>,
        registry: TenantRegistry,
    ) -> Self {
        DatabaseManager {
            driver,
            config,
            provider,
            metadata,
            registry,
        }
    }

    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// Onboard `name`, create its physical database and mark it created. Returns the record id.
    ///
    /// The record is written first, so a database that exists is always known to the registry.
    /// If a later step fails the record stays `not_created` and the next sweep picks it up.
    pub async fn create_database(&self, name: &str) -> Result<i64, TenancyError> {
        let context = format!("Unable to create new tenant database {}", name);
        let fail = |cause: DriverError| TenancyError::wrap(TenancyErrorKind::ProvisionFailed, name, &context, cause);

        validate_database_name(name)
            .map_err(|e| TenancyError::wrap(TenancyErrorKind::ProvisionFailed, name, &context, e))?;
        let id = self
            .registry
            .onboard_new_database_config(name)
            .await
            .map_err(|e| TenancyError::wrap(TenancyErrorKind::ProvisionFailed, name, &context, e))?;

        let mut mgmt = self.driver.connect(&self.config.management_params()).await.map_err(fail)?;
        let result = create_on(mgmt.as_mut(), name).await;
        release(mgmt.as_mut()).await;
        match result {
            Ok(true) => {}
            Ok(false) => return Err(TenancyError::already_exists(name)),
            Err(e) => return Err(fail(e)),
        }
        tracing::info!(database = %name, id, "created tenant database");

        self.registry
            .mark_status(id, TenantStatus::Created)
            .await
            .map_err(|e| TenancyError::wrap(TenancyErrorKind::ProvisionFailed, name, &context, e))?;
        Ok(id)
    }

    /// Apply the non-destructive schema diff to `name` inside one transaction.
    /// A failing statement rolls the update back. Where DDL is not transactional (MySQL) the
    /// statements before it stay applied and the error lists them.
    pub async fn create_or_update_schema_in_database(&self, name: &str) -> Result<(), TenancyError> {
        let mgmt_params = self.config.management_params();
        let mut mgmt = self.driver.connect(&mgmt_params).await.map_err(|e| {
            TenancyError::wrap(
                TenancyErrorKind::SchemaUpdateFailed,
                name,
                format!("Unable to check or update schema for database {}", name),
                e,
            )
        })?;
        let result = self.update_schema_via(mgmt.as_mut(), &mgmt_params, name).await;
        release(mgmt.as_mut()).await;
        result
    }

    async fn update_schema_via(
        &self,
        mgmt: &mut dyn DriverConnection,
        mgmt_params: &ConnectionParams,
        name: &str,
    ) -> Result<(), TenancyError> {
        let context = || format!("Unable to check or update schema for database {}", name);
        let exists = database_exists(mgmt, name)
            .await
            .map_err(|e| TenancyError::wrap(TenancyErrorKind::SchemaUpdateFailed, name, context(), e))?;
        if !exists {
            return Err(TenancyError::not_found(name));
        }

        let mut tenant = self
            .driver
            .connect(&mgmt_params.with_dbname(name))
            .await
            .map_err(|e| TenancyError::wrap(TenancyErrorKind::SchemaUpdateFailed, name, context(), e))?;
        let result = self.update_schema_on(tenant.as_mut(), name).await;
        release(tenant.as_mut()).await;
        result
    }

    async fn update_schema_on(&self, tenant: &mut dyn DriverConnection, name: &str) -> Result<(), TenancyError> {
        if let Some(sql) = tenant.platform().select_database_sql(name) {
            tenant.execute(&sql).await.map_err(|e| {
                TenancyError::wrap(
                    TenancyErrorKind::SchemaUpdateFailed,
                    name,
                    format!("Unable to select database {}", name),
                    e,
                )
            })?;
        }

        let mut session = new_schema_session(tenant, self.provider.clone(), self.metadata.clone());
        let result = run_schema_update(&mut session, name).await;
        session.close();
        let applied = result?;
        tracing::info!(database = %name, statements = applied, "tenant schema up to date");
        Ok(())
    }

    /// Drop the physical database `name`. The registry record is left alone.
    pub async fn drop_database(&self, name: &str) -> Result<(), TenancyError> {
        let context = format!("Unable to drop tenant database {}", name);
        let fail = |cause: DriverError| TenancyError::wrap(TenancyErrorKind::DropFailed, name, &context, cause);

        // A connection cannot drop the database it is attached to.
        let params = if self.config.tenant.dbname == name {
            self.config.management_params()
        } else {
            self.config.tenant.clone()
        };

        let mut admin = self.driver.connect(&params).await.map_err(fail)?;
        let result = drop_on(admin.as_mut(), name).await;
        release(admin.as_mut()).await;
        match result {
            Ok(true) => {
                tracing::info!(database = %name, "dropped tenant database");
                Ok(())
            }
            Ok(false) => Err(TenancyError::not_found(name)),
            Err(e) => Err(fail(e)),
        }
    }

    /// Create and migrate every tenant still marked `not_created`.
    /// A failing tenant is marked `failed` and the sweep moves on.
    pub async fn provision_pending(&self) -> Result<ProvisionReport, RegistryError> {
        let pending = self.registry.get_list_of_not_created_databases().await?;
        let mut report = ProvisionReport::default();

        for record in pending {
            let name = record.database_name;
            match self.provision_database(&name).await {
                Ok(()) => {
                    self.registry.mark_status(record.id, TenantStatus::Created).await?;
                    report.created.push(name);
                }
                Err(e) => {
                    tracing::warn!(database = %name, kind = %e.kind(), error = %e, "tenant provisioning failed");
                    self.registry.mark_status(record.id, TenantStatus::Failed).await?;
                    report.failed.push(e);
                }
            }
        }

        tracing::info!(
            created = report.created.len(),
            failed = report.failed.len(),
            "provisioning sweep finished"
        );
        Ok(report)
    }

    /// Create `name` unless it already exists, then bring its schema up to date.
    /// Registry status is left to the caller.
    pub async fn provision_database(&self, name: &str) -> Result<(), TenancyError> {
        match self.create_database(name).await {
            Ok(_) => {}
            Err(e) if e.kind() == TenancyErrorKind::AlreadyExists => {
                tracing::debug!(database = %name, "database already present, updating schema only");
            }
            Err(e) => return Err(e),
        }
        self.create_or_update_schema_in_database(name).await
    }

    /// Drop the physical database and delete its registry record.
    /// Either side may already be gone; both gone is `not_found`.
    pub async fn remove_tenant(&self, name: &str) -> Result<(), TenancyError> {
        let dropped = match self.drop_database(name).await {
            Ok(()) => true,
            Err(e) if e.kind() == TenancyErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        match self.registry.remove(name).await {
            Ok(()) => Ok(()),
            Err(RegistryError::NotFound(_)) if dropped => Ok(()),
            Err(RegistryError::NotFound(_)) => Err(TenancyError::not_found(name)),
            Err(e) => Err(TenancyError::wrap(
                TenancyErrorKind::DropFailed,
                name,
                format!("Unable to remove tenant record for {}", name),
                e,
            )),
        }
    }
}

async fn database_exists(conn: &mut dyn DriverConnection, name: &str) -> Result<bool, DriverError> {
    let sql = conn.platform().list_databases_sql();
    Ok(conn.fetch_first_column(sql).await?.iter().any(|db| db == name))
}

/// `Ok(false)` when the database is already there.
async fn create_on(conn: &mut dyn DriverConnection, name: &str) -> Result<bool, DriverError> {
    if database_exists(conn, name).await? {
        return Ok(false);
    }
    let sql = conn.platform().create_database_sql(name);
    conn.execute(&sql).await?;
    Ok(true)
}

/// `Ok(false)` when there is nothing to drop.
async fn drop_on(conn: &mut dyn DriverConnection, name: &str) -> Result<bool, DriverError> {
    if !database_exists(conn, name).await? {
        return Ok(false);
    }
    let sql = conn.platform().drop_database_sql(name);
    conn.execute(&sql).await?;
    Ok(true)
}

async fn run_schema_update(session: &mut SchemaSession<'_>, name: &str) -> Result<usize, TenancyError> {
    let context = || format!("Failed to update schema for database {}", name);

    session
        .begin()
        .await
        .map_err(|e| TenancyError::wrap(TenancyErrorKind::SchemaUpdateFailed, name, context(), e))?;

    let statements = match session.update_schema_statements().await {
        Ok(statements) => statements,
        Err(e) => {
            rollback_quietly(session).await;
            return Err(TenancyError::wrap(TenancyErrorKind::SchemaUpdateFailed, name, context(), e));
        }
    };

    if let Err(failure) = session.apply(&statements).await {
        rollback_quietly(session).await;
        let committed = &statements[..failure.position - 1];
        if session.platform().transactional_ddl() || committed.is_empty() {
            return Err(TenancyError::wrap(TenancyErrorKind::SchemaUpdateFailed, name, context(), failure));
        }
        // DDL commits implicitly here, so the rollback cannot undo what already ran.
        tracing::warn!(
            database = %name,
            committed = committed.len(),
            statements = ?committed,
            "schema update partially applied, earlier statements were not rolled back"
        );
        let context = format!(
            "Failed to update schema for database {}; statements 1 to {} were already applied and could not be rolled back ({})",
            name,
            committed.len(),
            committed.join("; ")
        );
        return Err(TenancyError::wrap(TenancyErrorKind::SchemaUpdateFailed, name, context, failure));
    }

    if let Err(e) = session.commit().await {
        rollback_quietly(session).await;
        return Err(TenancyError::wrap(TenancyErrorKind::SchemaUpdateFailed, name, context(), e));
    }
    Ok(statements.len())
}

async fn rollback_quietly(session: &mut SchemaSession<'_>) {
    if let Err(e) = session.rollback().await {
        tracing::warn!(database = %session.database(), error = %e, "rollback failed");
    }
}
