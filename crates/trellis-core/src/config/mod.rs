//! Engine configuration for a Trellis resource.
//!
//! One configuration file describes one REST resource: its schema (columns,
//! key, nested relationships), the permit table governing column access, and
//! per-action settings. Configuration is loaded from YAML and validated once
//! at engine build time; a misconfigured action is never served.
//!
//! # Configuration File
//!
//! ```yaml
//! resource:
//!   name: orders
//!   key: id
//!   modified_column: updated_at
//!   columns:
//!     id: { kind: integer }
//!     status:
//!       kind: text
//!       values: [open, shipped, closed]
//!   relations:
//!     items:
//!       parent_link: order_id
//!       prune_missing: true
//!       resource:
//!         name: order_items
//!         key: id
//!         columns:
//!           id: { kind: integer }
//!           sku: { kind: text }
//! permits:
//!   read: { deny: [] }
//!   update: { allow: [status] }
//!   "items.write": { allow: [sku] }
//! actions:
//!   update:
//!     require_identity: true
//! ```

pub mod schema;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::Action;

pub use schema::{ColumnKind, ColumnSpec, RelationSpec, ResourceSchema};

/// Error raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Complete engine configuration for one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Schema of the resource this engine serves.
    pub resource: ResourceSchema,

    /// Permit table: attribute name (optionally prefixed with a dotted
    /// relationship path, e.g. `items.read`) to permit value.
    #[serde(default)]
    pub permits: BTreeMap<String, PermitConfig>,

    /// Per-action overrides.
    #[serde(default)]
    pub actions: BTreeMap<Action, ActionConfig>,

    /// Cache header configuration for successful reads.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation: key/link columns exist, patterns compile.
    /// Permit resolution per action and path is validated separately at
    /// engine build, where the fallback chains are known.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resource.validate("")
    }

    /// The configured settings for an action, or defaults.
    pub fn action(&self, action: Action) -> ActionConfig {
        self.actions.get(&action).cloned().unwrap_or_default()
    }

    /// The permit fallback chain for an action: the configured override, or
    /// the action's built-in default.
    pub fn fallback_chain(&self, action: Action) -> Vec<String> {
        let configured = self
            .actions
            .get(&action)
            .map(|a| a.fallback.clone())
            .unwrap_or_default();
        if configured.is_empty() {
            action
                .default_fallback()
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            configured
        }
    }
}

/// Per-action configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionConfig {
    /// Context attributes this action's response demands. Empty means the
    /// engine's built-in demands for the action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub demands: Vec<String>,

    /// Permit fallback chain override (attribute names probed in order).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback: Vec<String>,

    /// Reject the request with 401 when no identity is established.
    #[serde(default)]
    pub require_identity: bool,
}

/// A permit value in configuration: either an allow-list or a deny-list of
/// column names. `deny: []` allows everything; `allow: []` denies everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermitConfig {
    Allow { allow: Vec<String> },
    Deny { deny: Vec<String> },
}

/// Cache header configuration for read responses.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Verbatim `Cache-Control` header value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,

    /// `Expires` offset in seconds from the time of the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}
