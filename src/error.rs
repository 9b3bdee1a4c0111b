//! Typed errors for driver calls, connection retargeting, tenant lifecycle and registry lookups.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the low-level driver (sqlx or a test double).
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Rejected(String),
}

/// A statement of a schema diff that the database refused.
#[derive(Error, Debug)]
#[error("statement {position} of {total} failed ({statement}): {source}")]
pub struct StatementFailure {
    pub position: usize,
    pub total: usize,
    pub statement: String,
    #[source]
    pub source: DriverError,
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid connection params: {0}")]
    InvalidParams(String),
    /// Static params (driver, charset) are inherited across a switch and may not change.
    #[error("cannot switch {field} from '{current}' to '{requested}' on a live handle")]
    Conflict {
        field: &'static str,
        current: String,
        requested: String,
    },
    #[error("unable to connect to database {database}: {source}")]
    Connect {
        database: String,
        #[source]
        source: DriverError,
    },
    #[error("unable to begin transaction on database {database}: {source}")]
    Begin {
        database: String,
        #[source]
        source: DriverError,
    },
    #[error("statement on database {database} failed: {source}")]
    Statement {
        database: String,
        #[source]
        source: DriverError,
    },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate tenant database: {0}")]
    Duplicate(String),
    #[error("tenant store: {0}")]
    Store(#[from] sqlx::Error),
    #[error("tenant store: invalid record: {0}")]
    InvalidRecord(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata load: {0}")]
    Load(String),
    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },
    #[error("table {table}: unknown column '{column}' in {context}")]
    UnknownColumn {
        table: String,
        column: String,
        context: &'static str,
    },
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TenancyErrorKind {
    AlreadyExists,
    NotFound,
    ProvisionFailed,
    SchemaUpdateFailed,
    DropFailed,
}

impl fmt::Display for TenancyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TenancyErrorKind::AlreadyExists => "already_exists",
            TenancyErrorKind::NotFound => "not_found",
            TenancyErrorKind::ProvisionFailed => "provision_failed",
            TenancyErrorKind::SchemaUpdateFailed => "schema_update_failed",
            TenancyErrorKind::DropFailed => "drop_failed",
        };
        f.write_str(s)
    }
}

/// Underlying cause carried by a [`TenancyError`].
#[derive(Error, Debug)]
pub enum Cause {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Schema(#[from] StatementFailure),
}

/// Lifecycle failure. The message names the database and embeds the cause.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct TenancyError {
    pub kind: TenancyErrorKind,
    pub database: String,
    message: String,
    #[source]
    source: Option<Cause>,
}

impl TenancyError {
    pub fn new(kind: TenancyErrorKind, database: &str, message: impl Into<String>) -> Self {
        TenancyError {
            kind,
            database: database.to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Wraps `cause`, appending its text to `context` so the message stands on its own.
    pub fn wrap(
        kind: TenancyErrorKind,
        database: &str,
        context: impl fmt::Display,
        cause: impl Into<Cause>,
    ) -> Self {
        let cause = cause.into();
        TenancyError {
            kind,
            database: database.to_string(),
            message: format!("{}: {}", context, cause),
            source: Some(cause),
        }
    }

    pub fn already_exists(database: &str) -> Self {
        Self::new(
            TenancyErrorKind::AlreadyExists,
            database,
            format!("Database {} already exists.", database),
        )
    }

    pub fn not_found(database: &str) -> Self {
        Self::new(
            TenancyErrorKind::NotFound,
            database,
            format!("Database {} does not exist.", database),
        )
    }

    pub fn kind(&self) -> TenancyErrorKind {
        self.kind
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.source.as_ref()
    }
}

/// Errors surfaced by the tenant session router.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Tenancy(#[from] TenancyError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
