//! The per-request context.
//!
//! One context is created at the start of a request, owned exclusively by
//! the runner for the request's duration, and discarded at the end. Steps
//! read and write its typed slots by reference; they never hold one across
//! requests. Attribute names (see [`crate::attrs`]) are the declarative
//! metadata the compiler validates; the values live here.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use trellis_core::Action;
use trellis_policy::{ChangeNode, Permit, PermitSource};

use crate::conditional::Preconditions;
use crate::runner::EngineRequest;

/// Authenticated caller, as reported by the identity collaborator.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub roles: Vec<String>,
    /// Whether the session was freshly established.
    pub fresh: bool,
}

/// Mutable per-request state.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub action: Action,
    pub method: String,
    pub started_at: DateTime<Utc>,

    /// Routed entity key, for item-scoped actions.
    pub key: Option<Value>,
    /// Request headers, names lowercased.
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    /// Raw parsed request body.
    pub body: Option<Value>,
    /// Parsed conditional-request headers.
    pub preconditions: Preconditions,

    /// Permit table the authorization scopes probe. Seeded from engine
    /// configuration; steps may install request-specific permits before
    /// reconciliation.
    pub permits: BTreeMap<String, Permit>,

    pub identity: Option<Identity>,
    pub session_ok: bool,
    /// Validated submission (body with transport noise stripped).
    pub submitted: Option<Value>,
    /// Stored instance fetched for item-scoped actions.
    pub item: Option<Value>,
    /// The stored instance's last modification time, when tracked.
    pub modified_at: Option<DateTime<Utc>>,
    pub collection: Option<Vec<Value>>,
    /// Authorization-filtered rendering of the current representation.
    pub output: Option<Value>,
    pub list_output: Option<Value>,
    /// Strong validator of `output`, unquoted.
    pub etag: Option<String>,
    pub precondition_ok: bool,
    pub changes: Option<ChangeNode>,
    /// Stored state after changes were applied.
    pub applied: Option<Value>,
    pub created_key: Option<Value>,
    pub deleted: bool,

    pub status: Option<u16>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Option<Value>,
}

impl RequestContext {
    pub(crate) fn new(request: EngineRequest, permits: BTreeMap<String, Permit>) -> Self {
        let headers: BTreeMap<String, String> = request
            .headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        let preconditions = Preconditions::from_headers(&headers);
        Self {
            request_id: Uuid::new_v4(),
            action: request.action,
            method: request.method,
            started_at: Utc::now(),
            key: request.key,
            headers,
            query: request.query,
            body: request.body,
            preconditions,
            permits,
            identity: None,
            session_ok: false,
            submitted: None,
            item: None,
            modified_at: None,
            collection: None,
            output: None,
            list_output: None,
            etag: None,
            precondition_ok: false,
            changes: None,
            applied: None,
            created_key: None,
            deleted: false,
            status: None,
            response_headers: Vec::new(),
            response_body: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Set a response header, replacing any earlier value.
    pub fn set_response_header(&mut self, name: &str, value: impl Into<String>) {
        self.response_headers.retain(|(n, _)| n != name);
        self.response_headers.push((name.to_string(), value.into()));
    }

    /// The routed key as a path segment.
    pub fn key_segment(&self) -> String {
        match &self.key {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

impl PermitSource for RequestContext {
    fn permit(&self, name: &str) -> Option<&Permit> {
        self.permits.get(name)
    }
}
