use serde::{Deserialize, Serialize};
use std::fmt;

/// The unit of request processing: one configured step sequence and one
/// permit fallback chain exist per action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Get,
    List,
    Insert,
    Update,
    Delete,
}

impl Action {
    /// All actions an engine serves.
    pub const ALL: [Action; 5] = [
        Action::Get,
        Action::List,
        Action::Insert,
        Action::Update,
        Action::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Get => "get",
            Action::List => "list",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Default permit fallback chain: the attribute names probed, in order,
    /// when resolving which permit governs this action's column access.
    /// Overridable per action via [`crate::ActionConfig::fallback`].
    pub fn default_fallback(&self) -> &'static [&'static str] {
        match self {
            Action::Get => &["get", "read"],
            Action::List => &["list", "read"],
            Action::Insert => &["insert", "write"],
            Action::Update => &["update", "write"],
            Action::Delete => &["delete", "write"],
        }
    }

    /// Whether this action writes to storage.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Action::Insert | Action::Update | Action::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
