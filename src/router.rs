//! Tenant session router: resolves a tenant through the registry and points the shared
//! connection handle at its database.

use crate::connection::ConnectionHandle;
use crate::error::{RegistryError, RouterError, TenancyError};
use crate::events::TenancyEvent;
use crate::lifecycle::DatabaseManager;
use crate::params::ParamOverrides;
use crate::registry::{TenantRecord, TenantRegistry, TenantStatus};
use std::sync::Arc;

#[derive(Debug)]
pub struct TenantSessionRouter {
    registry: TenantRegistry,
    handle: ConnectionHandle,
    /// Provisions tenants on first use when attached.
    manager: Option<Arc<DatabaseManager>>,
    current: Option<TenantRecord>,
}

impl TenantSessionRouter {
    pub fn new(registry: TenantRegistry, handle: ConnectionHandle) -> Self {
        TenantSessionRouter {
            registry,
            handle,
            manager: None,
            current: None,
        }
    }

    pub fn with_manager(mut self, manager: Arc<DatabaseManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ConnectionHandle {
        &mut self.handle
    }

    pub fn current_tenant(&self) -> Option<&TenantRecord> {
        self.current.as_ref()
    }

    pub async fn switch_to_tenant(&mut self, id: i64) -> Result<&TenantRecord, RouterError> {
        let record = self.registry.get(id).await?;
        self.activate(record).await
    }

    pub async fn switch_to_database(&mut self, database_name: &str) -> Result<&TenantRecord, RouterError> {
        let record = self
            .registry
            .find_by_database_name(database_name)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("tenant database {}", database_name)))?;
        self.activate(record).await
    }

    pub async fn switch_to_default(&mut self) -> Result<&TenantRecord, RouterError> {
        let record = self.registry.get_default_tenant_database().await?;
        self.activate(record).await
    }

    async fn activate(&mut self, record: TenantRecord) -> Result<&TenantRecord, RouterError> {
        let record = if record.is_created() {
            record
        } else {
            self.provision(record).await?
        };

        self.handle
            .switch_connection(&ParamOverrides::database(record.database_name.as_str()))
            .await?;
        tracing::info!(tenant_id = record.id, database = %record.database_name, "switched tenant");
        self.handle.events().notify(&TenancyEvent::TenantSwitch {
            tenant_id: record.id,
            database_name: &record.database_name,
        });
        Ok(self.current.insert(record))
    }

    /// Bring an unprovisioned tenant up, or refuse it when no manager is attached.
    async fn provision(&self, record: TenantRecord) -> Result<TenantRecord, RouterError> {
        let Some(manager) = self.manager.as_ref() else {
            return Err(TenancyError::not_found(&record.database_name).into());
        };
        match manager.provision_database(&record.database_name).await {
            Ok(()) => {
                self.registry.mark_status(record.id, TenantStatus::Created).await?;
                Ok(self.registry.get(record.id).await?)
            }
            Err(e) => {
                self.registry.mark_status(record.id, TenantStatus::Failed).await?;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenancyConfig;
    use crate::error::TenancyErrorKind;
    use crate::events::EventBus;
    use crate::metadata::TenantMetadata;
    use crate::store::MemoryTenantStore;
    use crate::testutils::{FakeServer, StaticSchemaProvider};
    use std::sync::Mutex;

    fn setup(databases: &[&str]) -> (FakeServer, TenantRegistry, TenantSessionRouter) {
        let server = FakeServer::with_databases(databases);
        let registry = TenantRegistry::new(Arc::new(MemoryTenantStore::new()));
        let handle = ConnectionHandle::new(server.driver(), server.params("app"), EventBus::new());
        let router = TenantSessionRouter::new(registry.clone(), handle);
        (server, registry, router)
    }

    async fn created(registry: &TenantRegistry, name: &str) -> i64 {
        let id = registry.onboard_new_database_config(name).await.unwrap();
        registry.mark_status(id, TenantStatus::Created).await.unwrap();
        id
    }

    #[tokio::test]
    async fn switch_to_tenant_retargets_handle_and_emits_event() {
        let (server, registry, mut router) = setup(&["app", "acme"]);
        let id = created(&registry, "acme").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.handle().events().register(move |event| {
            if let TenancyEvent::TenantSwitch { tenant_id, database_name } = event {
                sink.lock().unwrap().push((*tenant_id, database_name.to_string()));
            }
        });

        let record = router.switch_to_tenant(id).await.unwrap();
        assert_eq!(record.database_name, "acme");
        assert!(router.handle().is_connected());
        assert_eq!(router.handle().database(), "acme");
        assert_eq!(router.current_tenant().map(|r| r.id), Some(id));
        assert_eq!(*seen.lock().unwrap(), vec![(id, "acme".to_string())]);
        assert_eq!(server.open_connections(), 1);
    }

    #[tokio::test]
    async fn switching_between_tenants_keeps_one_connection() {
        let (server, registry, mut router) = setup(&["app", "a", "b"]);
        created(&registry, "a").await;
        created(&registry, "b").await;

        router.switch_to_database("a").await.unwrap();
        router.switch_to_database("b").await.unwrap();
        assert_eq!(router.handle().database(), "b");
        assert_eq!(server.peak_open_connections(), 1);

        router.handle_mut().close().await;
        assert_eq!(server.open_connections(), 0);
    }

    #[tokio::test]
    async fn unknown_tenant_is_a_registry_miss() {
        let (_server, _registry, mut router) = setup(&["app"]);
        assert!(matches!(
            router.switch_to_tenant(42).await,
            Err(RouterError::Registry(RegistryError::NotFound(_)))
        ));
        assert!(matches!(
            router.switch_to_database("ghost").await,
            Err(RouterError::Registry(RegistryError::NotFound(_)))
        ));
        assert!(router.current_tenant().is_none());
    }

    #[tokio::test]
    async fn unprovisioned_tenant_without_manager_is_refused() {
        let (server, registry, mut router) = setup(&["app"]);
        let id = registry.onboard_new_database_config("fresh").await.unwrap();

        match router.switch_to_tenant(id).await {
            Err(RouterError::Tenancy(e)) => assert_eq!(e.kind(), TenancyErrorKind::NotFound),
            other => panic!("expected not_found, got {:?}", other),
        }
        assert_eq!(server.connects_to("fresh"), 0);
    }

    #[tokio::test]
    async fn unprovisioned_tenant_is_provisioned_by_attached_manager() {
        let (server, registry, router) = setup(&["postgres", "app"]);
        let mut config = TenancyConfig::new(server.params("app"), "postgres://localhost/central");
        config.management_database = "postgres".into();
        let manager = DatabaseManager::new(
            server.driver(),
            config,
            Arc::new(StaticSchemaProvider::new(&["CREATE TABLE notes (id INT)"])),
            Arc::new(TenantMetadata::default()),
            registry.clone(),
        );
        let mut router = router.with_manager(Arc::new(manager));
        let id = registry.onboard_new_database_config("fresh").await.unwrap();

        let record = router.switch_to_tenant(id).await.unwrap();
        assert_eq!(record.status, TenantStatus::Created);
        assert!(server.has_database("fresh"));
        assert_eq!(server.applied("fresh"), vec!["CREATE TABLE notes (id INT)".to_string()]);
        assert_eq!(router.handle().database(), "fresh");
        assert_eq!(server.open_connections(), 1);
    }

    #[tokio::test]
    async fn switch_to_default_prefers_flagged_tenant() {
        let (_server, registry, mut router) = setup(&["app", "a", "b"]);
        created(&registry, "a").await;
        let b = created(&registry, "b").await;
        registry.set_default(b).await.unwrap();

        let record = router.switch_to_default().await.unwrap();
        assert_eq!(record.database_name, "b");
    }
}
