//! SQL dialect per driver: database listing, create/drop, database selection and catalog queries.

use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Database platform a connection talks to. Selected by the `driver` connection param.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Postgres,
    MySql,
}

impl std::str::FromStr for Platform {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pgsql" | "pdo_pgsql" => Ok(Platform::Postgres),
            "mysql" | "mariadb" | "pdo_mysql" | "mysqli" => Ok(Platform::MySql),
            _ => Err(ConnectionError::InvalidParams(format!(
                "unsupported driver: {} (expected postgres or mysql)",
                s
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl Platform {
    /// URL scheme, also the canonical driver name.
    pub fn scheme(&self) -> &'static str {
        match self {
            Platform::Postgres => "postgres",
            Platform::MySql => "mysql",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Platform::Postgres => 5432,
            Platform::MySql => 3306,
        }
    }

    /// Database a management connection attaches to when none is configured.
    pub fn default_management_database(&self) -> &'static str {
        match self {
            Platform::Postgres => "postgres",
            Platform::MySql => "mysql",
        }
    }

    pub fn quote_identifier(&self, name: &str) -> String {
        match self {
            Platform::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
            Platform::MySql => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// MySQL has a native listing command; PostgreSQL goes through its catalog.
    pub fn list_databases_sql(&self) -> &'static str {
        match self {
            Platform::Postgres => {
                "SELECT datname::text FROM pg_database WHERE datistemplate = false ORDER BY datname"
            }
            Platform::MySql => "SHOW DATABASES",
        }
    }

    pub fn create_database_sql(&self, name: &str) -> String {
        format!("CREATE DATABASE {}", self.quote_identifier(name))
    }

    pub fn drop_database_sql(&self, name: &str) -> String {
        format!("DROP DATABASE {}", self.quote_identifier(name))
    }

    /// Statement that makes `name` the active database, if the platform has one.
    /// A PostgreSQL connection is bound to its database at connect time.
    pub fn select_database_sql(&self, name: &str) -> Option<String> {
        match self {
            Platform::Postgres => None,
            Platform::MySql => Some(format!("USE {}", self.quote_identifier(name))),
        }
    }

    pub fn begin_sql(&self) -> &'static str {
        match self {
            Platform::Postgres => "BEGIN",
            Platform::MySql => "START TRANSACTION",
        }
    }

    /// One row per live column, rendered as `table.column`.
    pub fn list_columns_sql(&self) -> &'static str {
        match self {
            Platform::Postgres => {
                "SELECT (table_name || '.' || column_name)::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() ORDER BY table_name, ordinal_position"
            }
            Platform::MySql => {
                "SELECT CAST(CONCAT(table_name, '.', column_name) AS CHAR) FROM information_schema.columns \
                 WHERE table_schema = DATABASE() ORDER BY table_name, ordinal_position"
            }
        }
    }

    pub fn list_tables_sql(&self) -> &'static str {
        match self {
            Platform::Postgres => {
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' ORDER BY table_name"
            }
            Platform::MySql => {
                "SELECT CAST(table_name AS CHAR) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' ORDER BY table_name"
            }
        }
    }

    pub fn list_indexes_sql(&self) -> &'static str {
        match self {
            Platform::Postgres => {
                "SELECT indexname::text FROM pg_indexes WHERE schemaname = current_schema() ORDER BY indexname"
            }
            Platform::MySql => {
                "SELECT DISTINCT CAST(index_name AS CHAR) FROM information_schema.statistics \
                 WHERE table_schema = DATABASE() ORDER BY 1"
            }
        }
    }

    /// Whether DDL participates in transactions. MySQL commits implicitly on DDL.
    pub fn transactional_ddl(&self) -> bool {
        matches!(self, Platform::Postgres)
    }
}
