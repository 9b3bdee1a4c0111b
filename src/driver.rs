//! Driver seam: opens physical connections and runs statements on them.
//! [`SqlxDriver`] backs PostgreSQL and MySQL through sqlx, using the simple query protocol so
//! statements such as `USE` and `CREATE DATABASE` are accepted on both.

use crate::error::DriverError;
use crate::params::ConnectionParams;
use crate::platform::Platform;
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Driver: Send + Sync + Debug {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn DriverConnection>, DriverError>;
}

/// One live physical connection.
#[async_trait]
pub trait DriverConnection: Send + Debug {
    fn platform(&self) -> Platform;

    /// Database the connection was opened against.
    fn database(&self) -> &str;

    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Run a query and return its first column as text.
    async fn fetch_first_column(&mut self, sql: &str) -> Result<Vec<String>, DriverError>;

    async fn begin(&mut self) -> Result<(), DriverError> {
        let sql = self.platform().begin_sql();
        self.execute(sql).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    /// Release the connection. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// sqlx-backed driver. Every statement is bounded by `statement_timeout`.
#[derive(Clone, Debug)]
pub struct SqlxDriver {
    statement_timeout: Duration,
}

impl Default for SqlxDriver {
    fn default() -> Self {
        Self::new(DEFAULT_STATEMENT_TIMEOUT)
    }
}

impl SqlxDriver {
    pub fn new(statement_timeout: Duration) -> Self {
        SqlxDriver { statement_timeout }
    }
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(DriverError::Sqlx),
        Err(_) => Err(DriverError::Timeout(timeout)),
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn DriverConnection>, DriverError> {
        let inner = match params.driver {
            Platform::Postgres => {
                let mut opts = PgConnectOptions::new()
                    .host(&params.host)
                    .port(params.port)
                    .username(&params.user)
                    .database(&params.dbname);
                if let Some(ref password) = params.password {
                    opts = opts.password(password);
                }
                SqlxInner::Postgres(bounded(self.statement_timeout, opts.connect()).await?)
            }
            Platform::MySql => {
                let mut opts = MySqlConnectOptions::new()
                    .host(&params.host)
                    .port(params.port)
                    .username(&params.user)
                    .database(&params.dbname);
                if let Some(ref password) = params.password {
                    opts = opts.password(password);
                }
                if let Some(ref charset) = params.charset {
                    opts = opts.charset(charset);
                }
                SqlxInner::MySql(bounded(self.statement_timeout, opts.connect()).await?)
            }
        };
        tracing::debug!(database = %params.dbname, host = %params.host, driver = %params.driver, "connected");
        Ok(Box::new(SqlxConnection {
            inner: Some(inner),
            platform: params.driver,
            database: params.dbname.clone(),
            statement_timeout: self.statement_timeout,
        }))
    }
}

#[derive(Debug)]
enum SqlxInner {
    Postgres(PgConnection),
    MySql(MySqlConnection),
}

#[derive(Debug)]
pub struct SqlxConnection {
    inner: Option<SqlxInner>,
    platform: Platform,
    database: String,
    statement_timeout: Duration,
}

impl SqlxConnection {
    fn live(&mut self) -> Result<&mut SqlxInner, DriverError> {
        self.inner
            .as_mut()
            .ok_or_else(|| DriverError::Rejected(format!("connection to {} is closed", self.database)))
    }
}

#[async_trait]
impl DriverConnection for SqlxConnection {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        tracing::debug!(sql = %sql, database = %self.database, "execute");
        let timeout = self.statement_timeout;
        match self.live()? {
            SqlxInner::Postgres(conn) => {
                let done = bounded(timeout, (&mut *conn).execute(sql)).await?;
                Ok(done.rows_affected())
            }
            SqlxInner::MySql(conn) => {
                let done = bounded(timeout, (&mut *conn).execute(sql)).await?;
                Ok(done.rows_affected())
            }
        }
    }

    async fn fetch_first_column(&mut self, sql: &str) -> Result<Vec<String>, DriverError> {
        tracing::debug!(sql = %sql, database = %self.database, "query");
        let timeout = self.statement_timeout;
        match self.live()? {
            SqlxInner::Postgres(conn) => {
                let rows = bounded(timeout, (&mut *conn).fetch_all(sql)).await?;
                rows.iter()
                    .map(|row| row.try_get::<String, _>(0))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(DriverError::Sqlx)
            }
            SqlxInner::MySql(conn) => {
                let rows = bounded(timeout, (&mut *conn).fetch_all(sql)).await?;
                rows.iter()
                    .map(|row| row.try_get::<String, _>(0))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(DriverError::Sqlx)
            }
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        let timeout = self.statement_timeout;
        match inner {
            SqlxInner::Postgres(conn) => bounded(timeout, conn.close()).await?,
            SqlxInner::MySql(conn) => bounded(timeout, conn.close()).await?,
        }
        tracing::debug!(database = %self.database, "connection closed");
        Ok(())
    }
}
