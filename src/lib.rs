//! Tenant switch: per-tenant database routing. A retargetable connection handle, a lifecycle
//! manager that creates, migrates and drops tenant databases, and the registry that tracks them.

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod metadata;
pub mod params;
pub mod platform;
pub mod registry;
pub mod router;
pub mod schema;
pub mod store;

#[cfg(test)]
mod testutils;

pub use config::TenancyConfig;
pub use connection::ConnectionHandle;
pub use driver::{Driver, DriverConnection, SqlxDriver};
pub use error::{
    ConfigError, ConnectionError, DriverError, MetadataError, RegistryError, RouterError, TenancyError,
    TenancyErrorKind,
};
pub use events::{EventBus, TenancyEvent};
pub use lifecycle::{DatabaseManager, ProvisionReport};
pub use metadata::TenantMetadata;
pub use params::{ConnectionParams, ParamOverrides};
pub use platform::Platform;
pub use registry::{TenantRecord, TenantRegistry, TenantStatus};
pub use router::TenantSessionRouter;
pub use schema::{new_schema_session, CatalogSchemaProvider, SchemaProvider, SchemaSession};
pub use store::{MemoryTenantStore, PgTenantStore, TenantStore};
