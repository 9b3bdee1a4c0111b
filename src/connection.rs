//! Tenant connection handle: one physical connection at a time, retargetable in place.

use crate::driver::{Driver, DriverConnection};
use crate::error::{ConnectionError, DriverError};
use crate::events::{EventBus, TenancyEvent};
use crate::params::{ConnectionParams, ParamOverrides};
use std::sync::Arc;

/// Wraps a driver connection and can be pointed at another database without being rebuilt.
///
/// Not synchronized internally: retargeting takes `&mut self`, so a handle shared between
/// tasks needs an outer lock.
#[derive(Debug)]
pub struct ConnectionHandle {
    driver: Arc<dyn Driver>,
    params: ConnectionParams,
    conn: Option<Box<dyn DriverConnection>>,
    auto_commit: bool,
    in_transaction: bool,
    events: EventBus,
}

impl ConnectionHandle {
    /// Create a disconnected handle. The first query connects lazily.
    pub fn new(driver: Arc<dyn Driver>, params: ConnectionParams, events: EventBus) -> Self {
        ConnectionHandle {
            driver,
            params,
            conn: None,
            auto_commit: true,
            in_transaction: false,
            events,
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn database(&self) -> &str {
        &self.params.dbname
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Connect with the current params if not already connected.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        let params = self.params.clone();
        self.open(params).await
    }

    /// Retarget the handle. The live connection is released before the new one is opened,
    /// so the handle never holds two. On failure the handle is left disconnected.
    pub async fn switch_connection(&mut self, overrides: &ParamOverrides) -> Result<(), ConnectionError> {
        self.close().await;
        let params = self.params.merge(overrides)?;
        self.open(params).await?;
        tracing::info!(database = %self.params.dbname, host = %self.params.host, "switched tenant connection");
        Ok(())
    }

    async fn open(&mut self, params: ConnectionParams) -> Result<(), ConnectionError> {
        let mut conn = self
            .driver
            .connect(&params)
            .await
            .map_err(|source| ConnectionError::Connect {
                database: params.dbname.clone(),
                source,
            })?;

        if !self.auto_commit {
            if let Err(source) = conn.begin().await {
                release(conn.as_mut()).await;
                return Err(ConnectionError::Begin {
                    database: params.dbname.clone(),
                    source,
                });
            }
            self.in_transaction = true;
        }

        self.conn = Some(conn);
        self.params = params;
        self.events.notify(&TenancyEvent::PostConnect(self));
        Ok(())
    }

    /// Release the live connection, if any. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            release(conn.as_mut()).await;
        }
        self.in_transaction = false;
    }

    /// Disabling auto-commit opens a transaction on a live connection and on every
    /// connection opened afterwards. Enabling it commits the open transaction.
    pub async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), ConnectionError> {
        if self.auto_commit == enabled {
            return Ok(());
        }
        if self.is_connected() {
            if enabled {
                if self.in_transaction {
                    self.commit_inner().await?;
                }
            } else if !self.in_transaction {
                self.begin_inner().await?;
            }
        }
        self.auto_commit = enabled;
        Ok(())
    }

    pub async fn begin_transaction(&mut self) -> Result<(), ConnectionError> {
        self.connect().await?;
        self.begin_inner().await
    }

    /// Commit the open transaction. Without auto-commit a new one starts right away.
    pub async fn commit(&mut self) -> Result<(), ConnectionError> {
        self.connect().await?;
        self.commit_inner().await?;
        if !self.auto_commit {
            self.begin_inner().await?;
        }
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), ConnectionError> {
        self.connect().await?;
        let database = self.params.dbname.clone();
        self.live()?
            .rollback()
            .await
            .map_err(|source| ConnectionError::Statement { database, source })?;
        self.in_transaction = false;
        if !self.auto_commit {
            self.begin_inner().await?;
        }
        Ok(())
    }

    pub async fn execute(&mut self, sql: &str) -> Result<u64, ConnectionError> {
        self.connect().await?;
        let database = self.params.dbname.clone();
        self.live()?
            .execute(sql)
            .await
            .map_err(|source| ConnectionError::Statement { database, source })
    }

    pub async fn fetch_first_column(&mut self, sql: &str) -> Result<Vec<String>, ConnectionError> {
        self.connect().await?;
        let database = self.params.dbname.clone();
        self.live()?
            .fetch_first_column(sql)
            .await
            .map_err(|source| ConnectionError::Statement { database, source })
    }

    async fn begin_inner(&mut self) -> Result<(), ConnectionError> {
        let database = self.params.dbname.clone();
        self.live()?
            .begin()
            .await
            .map_err(|source| ConnectionError::Begin { database, source })?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit_inner(&mut self) -> Result<(), ConnectionError> {
        let database = self.params.dbname.clone();
        self.live()?
            .commit()
            .await
            .map_err(|source| ConnectionError::Statement { database, source })?;
        self.in_transaction = false;
        Ok(())
    }

    fn live(&mut self) -> Result<&mut (dyn DriverConnection + 'static), ConnectionError> {
        let database = &self.params.dbname;
        self.conn
            .as_deref_mut()
            .ok_or_else(|| ConnectionError::Statement {
                database: database.clone(),
                source: DriverError::Rejected("handle is not connected".into()),
            })
    }
}

/// Close a connection during cleanup. Failures are logged, not returned.
pub(crate) async fn release(conn: &mut dyn DriverConnection) {
    if let Err(e) = conn.close().await {
        tracing::warn!(database = %conn.database(), error = %e, "failed to close connection");
    }
}
