//! Collaborator interfaces.
//!
//! The engine decides *what* changed; these traits are where collaborators
//! plug in: storage (fetch/apply/transactions), identity, and session
//! validation. All calls are awaited one at a time from the runner; the
//! engine imposes no timeout or retry policy of its own.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use trellis_core::config::ResourceSchema;
use trellis_policy::ChangeNode;

use crate::context::Identity;

/// Outcome of a single-row fetch by unique key.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found(Value),
    /// No row for the key.
    Missing,
    /// The row existed but was (soft-)deleted.
    Gone,
    /// More than one row matched a unique key; storage corruption.
    Ambiguous,
}

/// The enclosing parent of a nested change node.
#[derive(Debug, Clone)]
pub struct ApplyParent<'a> {
    /// Key column of the parent schema.
    pub key_column: &'a str,
    /// Child column referencing the parent's key.
    pub link_column: &'a str,
    /// The parent's key, known by the time children are applied.
    pub key: Value,
}

/// One change node handed to storage, with enough context to place it.
#[derive(Debug)]
pub struct ApplyCall<'a> {
    /// Dotted relation path; empty for the root resource.
    pub path: &'a str,
    /// Schema at this node's level.
    pub schema: &'a ResourceSchema,
    pub parent: Option<ApplyParent<'a>>,
    pub node: &'a ChangeNode,
}

/// Storage collaborator. The engine opens one transaction per request
/// around the step sequence and hands committed change nodes over in
/// document order: parents before children for new nodes, deletions last.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn begin(&self) -> anyhow::Result<()>;
    async fn commit(&self) -> anyhow::Result<()>;
    async fn rollback(&self) -> anyhow::Result<()>;

    /// Fetch one row by unique key, with distinguishable outcomes.
    async fn fetch(&self, schema: &ResourceSchema, key: &Value) -> anyhow::Result<FetchOutcome>;

    async fn list(
        &self,
        schema: &ResourceSchema,
        query: &BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<Value>>;

    /// Apply one change node; returns the node's key after application
    /// (newly assigned for `new` nodes).
    async fn apply(&self, call: ApplyCall<'_>) -> anyhow::Result<Value>;
}

/// Identity collaborator: read-only input to the engine.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current(&self, headers: &BTreeMap<String, String>)
        -> anyhow::Result<Option<Identity>>;
}

/// Session collaborator: CSRF-token validation outcome for mutations.
#[async_trait]
pub trait SessionGuard: Send + Sync {
    async fn validate(
        &self,
        headers: &BTreeMap<String, String>,
        identity: Option<&Identity>,
    ) -> anyhow::Result<bool>;
}

/// Identity provider that never authenticates anyone.
pub struct AnonymousIdentity;

#[async_trait]
impl IdentityProvider for AnonymousIdentity {
    async fn current(
        &self,
        _headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<Option<Identity>> {
        Ok(None)
    }
}

/// Identity provider reading `x-user` / `x-roles` headers. Intended for
/// demos and tests, where a fronting proxy is assumed to have
/// authenticated the caller.
pub struct HeaderIdentity;

#[async_trait]
impl IdentityProvider for HeaderIdentity {
    async fn current(
        &self,
        headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<Option<Identity>> {
        Ok(headers.get("x-user").map(|user| Identity {
            id: user.clone(),
            roles: headers
                .get("x-roles")
                .map(|raw| raw.split(',').map(|r| r.trim().to_string()).collect())
                .unwrap_or_default(),
            fresh: true,
        }))
    }
}

/// Session guard that accepts every request.
pub struct PermissiveGuard;

#[async_trait]
impl SessionGuard for PermissiveGuard {
    async fn validate(
        &self,
        _headers: &BTreeMap<String, String>,
        _identity: Option<&Identity>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}
