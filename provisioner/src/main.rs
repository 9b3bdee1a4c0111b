//! Provisioning sweep: creates and migrates every tenant database still marked `not_created`.
//!
//! Run from repo root: `cargo run -p provisioner`
//! Onboard a tenant first: `cargo run -p provisioner -- onboard acme`

use std::sync::Arc;
use tenant_switch::{
    CatalogSchemaProvider, DatabaseManager, PgTenantStore, SqlxDriver, TenancyConfig, TenantMetadata,
    TenantRegistry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tenant_switch=info,provisioner=info")),
        )
        .init();

    let config = TenancyConfig::from_env()?;
    let metadata = match config.metadata_path {
        Some(ref path) => TenantMetadata::load(path)?,
        None => {
            tracing::warn!("TENANT_METADATA_PATH not set, tenants get an empty schema");
            TenantMetadata::default()
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.registry_url)
        .await?;
    let store = PgTenantStore::with_schema(pool, &config.registry_schema);
    store.ensure_registry_table().await?;
    let registry = TenantRegistry::new(Arc::new(store));

    let mut args = std::env::args().skip(1);
    if let (Some(cmd), Some(name)) = (args.next(), args.next()) {
        if cmd == "onboard" {
            let id = registry.onboard_new_database_config(&name).await?;
            tracing::info!(id, database = %name, "tenant onboarded");
        } else {
            return Err(format!("unknown command '{}'", cmd).into());
        }
    }

    let manager = DatabaseManager::new(
        Arc::new(SqlxDriver::new(config.statement_timeout)),
        config,
        Arc::new(CatalogSchemaProvider),
        Arc::new(metadata),
        registry,
    );
    let report = manager.provision_pending().await?;
    for failure in &report.failed {
        tracing::error!(database = %failure.database, kind = %failure.kind(), "{}", failure);
    }
    tracing::info!(
        created = report.created.len(),
        failed = report.failed.len(),
        "provisioning complete"
    );
    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
