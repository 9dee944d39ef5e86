//! Column authorization scopes.
//!
//! An [`AccessScope`] answers: for this action, at this nested-resource
//! path, which [`Permit`] governs column access? Resolution probes a chain
//! of fallback attribute names in order (e.g. `update` then `write`), each
//! prefixed with the dotted path, against a [`PermitSource`]; the first
//! present value wins. A miss is a configuration bug, not a request-time
//! condition: engines validate every action and path at build time.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use trellis_core::Action;

use crate::Permit;

/// Separator between relationship names in a path prefix.
pub const PATH_SEPARATOR: char = '.';

/// Anything that can look up a permit by attribute name. The request
/// context implements this; a plain map works for tests and build-time
/// validation.
pub trait PermitSource {
    fn permit(&self, name: &str) -> Option<&Permit>;
}

impl PermitSource for BTreeMap<String, Permit> {
    fn permit(&self, name: &str) -> Option<&Permit> {
        self.get(name)
    }
}

/// Raised when no permit is configured for an action at a path. This is a
/// deployment/configuration failure; it must prevent the action from being
/// served rather than surface per-request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no permit configured for action '{action}' at path '{path}' (probed: {probed})")]
pub struct ScopeError {
    pub action: Action,
    pub path: String,
    pub probed: String,
}

/// A resolver scoped to one action and one nested path.
#[derive(Debug, Clone)]
pub struct AccessScope {
    action: Action,
    /// Dotted prefix including the trailing separator; empty at the root.
    path: String,
    /// Fallback attribute names, probed in order.
    fallback: Vec<String>,
}

impl AccessScope {
    /// Root scope for an action. An empty fallback list means the action's
    /// default chain.
    pub fn new(action: Action, fallback: Vec<String>) -> Self {
        let fallback = if fallback.is_empty() {
            action
                .default_fallback()
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            fallback
        };
        Self {
            action,
            path: String::new(),
            fallback,
        }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// The dotted path prefix (empty at the root).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// A scope for a nested relationship, reusing the same fallback chain.
    pub fn descend(&self, relation: &str) -> AccessScope {
        AccessScope {
            action: self.action,
            path: format!("{}{}{}", self.path, relation, PATH_SEPARATOR),
            fallback: self.fallback.clone(),
        }
    }

    /// Probe the fallback chain against `source`; first hit wins.
    pub fn resolve<'s, S: PermitSource + ?Sized>(
        &self,
        source: &'s S,
    ) -> Result<&'s Permit, ScopeError> {
        for name in &self.fallback {
            let key = format!("{}{}", self.path, name);
            if let Some(permit) = source.permit(&key) {
                return Ok(permit);
            }
        }
        Err(ScopeError {
            action: self.action,
            path: self.path.clone(),
            probed: self.fallback.join(", "),
        })
    }

    /// Split candidate columns via the resolved permit.
    pub fn partition<'a, S, I>(
        &self,
        source: &S,
        candidates: I,
    ) -> Result<(BTreeSet<String>, BTreeSet<String>), ScopeError>
    where
        S: PermitSource + ?Sized,
        I: IntoIterator<Item = &'a str>,
    {
        Ok(self.resolve(source)?.partition(candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> BTreeMap<String, Permit> {
        BTreeMap::from([
            ("read".to_string(), Permit::deny(["secret"])),
            ("update".to_string(), Permit::allow(["status"])),
            ("items.write".to_string(), Permit::allow(["sku", "qty"])),
        ])
    }

    #[test]
    fn test_first_fallback_wins() {
        let source = source();
        let scope = AccessScope::new(Action::Update, vec![]);
        // "update" is present, so the chain never reaches "write".
        assert_eq!(scope.resolve(&source).unwrap(), &Permit::allow(["status"]));
    }

    #[test]
    fn test_fallback_reaches_later_names() {
        let source = source();
        let scope = AccessScope::new(Action::Get, vec![]);
        // No "get" permit configured; "read" answers.
        assert_eq!(scope.resolve(&source).unwrap(), &Permit::deny(["secret"]));
    }

    #[test]
    fn test_descend_prefixes_the_probe() {
        let source = source();
        let scope = AccessScope::new(Action::Update, vec![]).descend("items");
        assert_eq!(scope.path(), "items.");
        // "items.update" is absent; "items.write" answers.
        assert_eq!(
            scope.resolve(&source).unwrap(),
            &Permit::allow(["sku", "qty"])
        );
    }

    #[test]
    fn test_missing_permit_names_action_path_and_probes() {
        let source = source();
        let scope = AccessScope::new(Action::Insert, vec![]).descend("items").descend("notes");
        let err = scope.resolve(&source).unwrap_err();
        assert_eq!(err.path, "items.notes.");
        let message = err.to_string();
        assert!(message.contains("insert"));
        assert!(message.contains("items.notes."));
        assert!(message.contains("write"));
    }

    #[test]
    fn test_partition_delegates_to_the_resolved_permit() {
        let source = source();
        let scope = AccessScope::new(Action::Update, vec![]);
        let (allowed, denied) = scope.partition(&source, ["status", "total"]).unwrap();
        assert!(allowed.contains("status"));
        assert!(denied.contains("total"));
    }

    #[test]
    fn test_custom_fallback_chain() {
        let mut source = source();
        source.insert("edit".to_string(), Permit::allow(["notes"]));
        let scope = AccessScope::new(Action::Update, vec!["edit".to_string()]);
        assert_eq!(scope.resolve(&source).unwrap(), &Permit::allow(["notes"]));
    }
}
