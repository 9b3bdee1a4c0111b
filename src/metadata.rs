//! Desired tenant schema: tables, columns, primary keys and indexes.
//! Shared read-only by every tenant; loaded from JSON and validated once at startup.

use crate::error::MetadataError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TenantMetadata {
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKeyDef {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKeyDef {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            PrimaryKeyDef::Single(s) => vec![s.as_str()],
            PrimaryKeyDef::Composite(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Option<PrimaryKeyDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Clone, Debug, Serialize)]
pub enum ColumnDefault {
    Literal(String),
    Expression { expression: String },
}

impl<'de> Deserialize<'de> for ColumnDefault {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = serde_json::Value::deserialize(deserializer)?;
        match v {
            serde_json::Value::String(s) => Ok(ColumnDefault::Literal(s)),
            serde_json::Value::Number(n) => Ok(ColumnDefault::Expression {
                expression: n.to_string(),
            }),
            serde_json::Value::Bool(b) => Ok(ColumnDefault::Expression {
                expression: if b { "TRUE".into() } else { "FALSE".into() },
            }),
            serde_json::Value::Object(mut obj) => {
                if let Some(serde_json::Value::String(s)) = obj.remove("expression") {
                    return Ok(ColumnDefault::Expression { expression: s });
                }
                Err(serde::de::Error::custom(format!(
                    "column default object must be {{ \"expression\": \"...\" }}; got keys: {:?}",
                    obj.keys().collect::<Vec<_>>()
                )))
            }
            other => Err(serde::de::Error::custom(format!(
                "column default must be a string, number, boolean or {{ \"expression\": \"...\" }}; got {}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<ColumnDefault>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl TenantMetadata {
    pub fn from_json(json: &str) -> Result<Self, MetadataError> {
        let metadata: TenantMetadata =
            serde_json::from_str(json).map_err(|e| MetadataError::Load(e.to_string()))?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| MetadataError::Load(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Names are unique per kind, keys and indexes only reference declared columns.
    pub fn validate(&self) -> Result<(), MetadataError> {
        let mut tables = HashSet::new();
        let mut indexes = HashSet::new();
        for t in &self.tables {
            if !tables.insert(t.name.as_str()) {
                return Err(MetadataError::Duplicate {
                    kind: "table",
                    name: t.name.clone(),
                });
            }
            if t.columns.is_empty() {
                return Err(MetadataError::Validation(format!(
                    "table {} has no columns",
                    t.name
                )));
            }
            let mut columns = HashSet::new();
            for c in &t.columns {
                if !columns.insert(c.name.as_str()) {
                    return Err(MetadataError::Duplicate {
                        kind: "column",
                        name: format!("{}.{}", t.name, c.name),
                    });
                }
            }
            if let Some(pk) = &t.primary_key {
                for col in pk.columns() {
                    if !columns.contains(col) {
                        return Err(MetadataError::UnknownColumn {
                            table: t.name.clone(),
                            column: col.to_string(),
                            context: "primary key",
                        });
                    }
                }
            }
            for idx in &t.indexes {
                if !indexes.insert(idx.name.as_str()) {
                    return Err(MetadataError::Duplicate {
                        kind: "index",
                        name: idx.name.clone(),
                    });
                }
                if idx.columns.is_empty() {
                    return Err(MetadataError::Validation(format!(
                        "index {} has no columns",
                        idx.name
                    )));
                }
                for col in &idx.columns {
                    if !columns.contains(col.as_str()) {
                        return Err(MetadataError::UnknownColumn {
                            table: t.name.clone(),
                            column: col.clone(),
                            context: "index",
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
