//! Resource schema: columns, key, nested relationships.
//!
//! The schema drives value coercion (each column has a [`ColumnKind`]),
//! column-level validation rules (pattern / enumerated values), and the
//! shape of the change tree (one child list per relationship).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ConfigError;

/// Schema of one resource (or one nested relationship's target).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Resource name (storage namespace, URL segment for the root).
    pub name: String,

    /// Primary key column.
    #[serde(default = "default_key")]
    pub key: String,

    /// Column holding the row's last modification time, if the resource
    /// tracks one. Drives the `Last-Modified` header and the
    /// `If-(Un)Modified-Since` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_column: Option<String>,

    /// Declared columns.
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSpec>,

    /// Nested relationships: name to child specification. Relationship
    /// names are unique within one parent, so dotted path prefixes never
    /// collide across siblings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, RelationSpec>,
}

fn default_key() -> String {
    "id".to_string()
}

impl ResourceSchema {
    /// Check that a column is declared.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Column specification, if declared.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.get(name)
    }

    /// Structural validation, recursing into relations. `path` is the
    /// dotted prefix used in error messages.
    pub(crate) fn validate(&self, path: &str) -> Result<(), ConfigError> {
        if !self.columns.contains_key(&self.key) {
            return Err(ConfigError::Config(format!(
                "resource '{}{}': key column '{}' is not declared",
                path, self.name, self.key
            )));
        }
        if let Some(modified) = &self.modified_column {
            if !self.columns.contains_key(modified) {
                return Err(ConfigError::Config(format!(
                    "resource '{}{}': modified_column '{}' is not declared",
                    path, self.name, modified
                )));
            }
        }
        for (rel, spec) in &self.relations {
            if !spec.resource.columns.contains_key(&spec.parent_link) {
                return Err(ConfigError::Config(format!(
                    "relation '{}{}': parent_link '{}' is not a column of '{}'",
                    path, rel, spec.parent_link, spec.resource.name
                )));
            }
            spec.resource.validate(&format!("{}{}.", path, rel))?;
        }
        Ok(())
    }
}

/// One declared column.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ColumnSpec {
    /// Value kind, used for coercion and the column's equality rule.
    #[serde(default)]
    pub kind: ColumnKind,

    /// Regex the (text) value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Enumeration of allowed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<serde_json::Value>>,
}

/// Value kind of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    #[default]
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
}

/// One nested relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationSpec {
    /// Child column referencing the parent's key.
    pub parent_link: String,

    /// When true, a stored child absent from a submitted list is deleted.
    /// When false, absent children are left untouched.
    #[serde(default)]
    pub prune_missing: bool,

    /// Schema of the child rows.
    pub resource: ResourceSchema,
}
