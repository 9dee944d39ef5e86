//! Built-in steps.
//!
//! The standard pool wires the engine's REST semantics: identity and
//! session checks, body validation, fetch, rendering, fingerprinting,
//! conditional evaluation, reconciliation, change application, and one
//! respond step per action. Each descriptor's requires/provides list is
//! the step's read/write contract against the request context.
//!
//! Rendering and fingerprinting form refinement chains: `output` and
//! `etag` are provided once from stored state and again after changes are
//! applied, so update responses demand `output@1`/`etag@1` while reads
//! stop at depth 0.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};

use trellis_core::config::ResourceSchema;
use trellis_core::Action;
use trellis_policy::{AccessScope, ChangeNode, ChangeStatus, Reconciler, ScopeError};

use crate::adapter::{ApplyCall, ApplyParent, FetchOutcome};
use crate::attrs;
use crate::conditional::{self, GetCheck, WriteCheck};
use crate::context::RequestContext;
use crate::engine::StepEnv;
use crate::error::EngineError;
use crate::step::{Flow, Step, StepDescriptor};

use std::sync::Arc;

/// The standard step pool, in registration order. Registration order is
/// load-bearing for refinement chains: stored-state renderers come before
/// their post-apply refreshers.
pub fn standard_steps() -> Vec<Arc<dyn Step>> {
    vec![
        Arc::new(ResolveIdentity::new()),
        Arc::new(GuardSession::new()),
        Arc::new(ParseBody::new()),
        Arc::new(FetchItem::new()),
        Arc::new(ListItems::new()),
        Arc::new(RenderItem::new()),
        Arc::new(RenderCollection::new()),
        Arc::new(Fingerprint::new()),
        Arc::new(CheckPreconditions::new()),
        Arc::new(ReconcileChanges::new()),
        Arc::new(ReconcileCreate::new()),
        Arc::new(ApplyChanges::new()),
        Arc::new(ApplyCreate::new()),
        Arc::new(DeleteItem::new()),
        Arc::new(RenderRefreshed::new()),
        Arc::new(RefreshFingerprint::new()),
        Arc::new(RespondGet::new()),
        Arc::new(RespondList::new()),
        Arc::new(RespondUpdate::new()),
        Arc::new(RespondCreate::new()),
        Arc::new(RespondDelete::new()),
    ]
}

/// Rendering always uses read visibility, whatever the current action, so
/// a validator computed for a GET matches one computed during a PUT.
fn read_scope(env: &StepEnv) -> AccessScope {
    AccessScope::new(Action::Get, env.config.fallback_chain(Action::Get))
}

/// Authorization-filtered rendering of one stored instance: declared,
/// readable columns plus recursively filtered relationship lists.
/// Internal fields are dropped.
fn filter_item(
    schema: &ResourceSchema,
    scope: &AccessScope,
    source: &RequestContext,
    item: &Value,
) -> Result<Value, ScopeError> {
    let permit = scope.resolve(source)?;
    let mut out = Map::new();
    let Some(object) = item.as_object() else {
        return Ok(Value::Object(out));
    };
    for (name, value) in object {
        if let Some(relation) = schema.relations.get(name) {
            let child_scope = scope.descend(name);
            let mut filtered = Vec::new();
            if let Some(children) = value.as_array() {
                for child in children {
                    filtered.push(filter_item(&relation.resource, &child_scope, source, child)?);
                }
            }
            out.insert(name.clone(), Value::Array(filtered));
        } else if schema.has_column(name) && permit.test(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    Ok(Value::Object(out))
}

fn set_cache_headers(cx: &mut RequestContext, env: &StepEnv) {
    if let Some(cache_control) = env.config.cache.cache_control.clone() {
        cx.set_response_header("Cache-Control", cache_control);
    }
    if let Some(seconds) = env.config.cache.expires_in {
        let expires = cx.started_at + chrono::Duration::seconds(seconds);
        cx.set_response_header("Expires", conditional::format_http_date(expires));
    }
}

fn parse_modified(doc: &Value, schema: &ResourceSchema) -> Option<DateTime<Utc>> {
    let column = schema.modified_column.as_ref()?;
    let raw = doc.get(column)?.as_str()?;
    let parsed = DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc));
    if parsed.is_none() {
        tracing::warn!(column = column.as_str(), value = raw, "stored modification time does not parse");
    }
    parsed
}

fn context_gap(what: &str) -> EngineError {
    EngineError::Storage(anyhow::anyhow!("context attribute '{}' missing", what))
}

fn self_link(env: &StepEnv, segment: &str) -> Value {
    json!({ "self": format!("/{}/{}", env.config.resource.name, segment) })
}

fn attach_change_trees(body: &mut Map<String, Value>, changes: Option<&ChangeNode>) {
    if let Some(node) = changes {
        if let Some(errors) = node.errors_value() {
            body.insert("errors".to_string(), errors);
        }
        if let Some(revised) = node.revised_value() {
            body.insert("revised".to_string(), revised);
        }
    }
}

/// Apply a change tree in document order: parents before children (a new
/// parent's key must exist before its children link to it), deletions
/// last to avoid referential conflicts. Nodes carrying their own errors
/// are classified only; they and their subtrees are skipped.
async fn apply_tree(env: &StepEnv, root: &ChangeNode) -> Result<Option<Value>, EngineError> {
    struct Pending<'a> {
        path: String,
        schema: &'a ResourceSchema,
        parent: Option<ApplyParent<'a>>,
        node: &'a ChangeNode,
    }

    let mut queue: VecDeque<Pending> = VecDeque::new();
    queue.push_back(Pending {
        path: String::new(),
        schema: &env.config.resource,
        parent: None,
        node: root,
    });
    let mut deletions: Vec<Pending> = Vec::new();
    let mut root_key: Option<Value> = None;

    while let Some(pending) = queue.pop_front() {
        if pending.node.has_local_errors() {
            continue;
        }
        let key = match pending.node.status {
            ChangeStatus::Deleted => {
                deletions.push(pending);
                continue;
            }
            ChangeStatus::Unchanged => pending.node.key.clone(),
            ChangeStatus::New | ChangeStatus::Updated => Some(
                env.adapter
                    .apply(ApplyCall {
                        path: &pending.path,
                        schema: pending.schema,
                        parent: pending.parent.clone(),
                        node: pending.node,
                    })
                    .await?,
            ),
        };
        if pending.path.is_empty() {
            root_key = key.clone();
        }
        for (rel_name, list) in &pending.node.children {
            let Some(relation) = pending.schema.relations.get(rel_name) else {
                continue;
            };
            let child_path = if pending.path.is_empty() {
                rel_name.clone()
            } else {
                format!("{}.{}", pending.path, rel_name)
            };
            let parent = ApplyParent {
                key_column: pending.schema.key.as_str(),
                link_column: relation.parent_link.as_str(),
                key: key.clone().unwrap_or(Value::Null),
            };
            for child in &list.nodes {
                queue.push_back(Pending {
                    path: child_path.clone(),
                    schema: &relation.resource,
                    parent: Some(parent.clone()),
                    node: child,
                });
            }
        }
    }

    for pending in deletions {
        env.adapter
            .apply(ApplyCall {
                path: &pending.path,
                schema: pending.schema,
                parent: pending.parent,
                node: pending.node,
            })
            .await?;
    }

    Ok(root_key)
}

// ---------------------------------------------------------------------------
// Identity and session
// ---------------------------------------------------------------------------

pub struct ResolveIdentity {
    descriptor: StepDescriptor,
}

impl ResolveIdentity {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("resolve_identity")
                .provides(attrs::IDENTITY)
                .milestone(10),
        }
    }
}

#[async_trait]
impl Step for ResolveIdentity {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let identity = env.identity.current(&cx.headers).await?;
        if identity.is_none() && env.config.action(cx.action).require_identity {
            return Err(EngineError::Unauthorized);
        }
        cx.identity = identity;
        Ok(Flow::Continue)
    }
}

pub struct GuardSession {
    descriptor: StepDescriptor,
}

impl GuardSession {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("guard_session")
                .requires(attrs::IDENTITY)
                .provides(attrs::SESSION_OK)
                .milestone(10),
        }
    }
}

#[async_trait]
impl Step for GuardSession {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let valid = env
            .session
            .validate(&cx.headers, cx.identity.as_ref())
            .await?;
        if !valid {
            return Err(EngineError::Forbidden);
        }
        cx.session_ok = true;
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

pub struct ParseBody {
    descriptor: StepDescriptor,
}

impl ParseBody {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("parse_body")
                .requires(attrs::BODY)
                .provides(attrs::SUBMITTED)
                .milestone(10),
        }
    }
}

#[async_trait]
impl Step for ParseBody {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, _env: &StepEnv) -> Result<Flow, EngineError> {
        let Some(body) = cx.body.take() else {
            return Err(EngineError::BadRequest("request body is required".to_string()));
        };
        let Value::Object(mut submitted) = body else {
            return Err(EngineError::BadRequest(
                "request body must be a JSON object".to_string(),
            ));
        };
        // Transport decoration from an earlier GET, not data.
        submitted.remove("_links");
        cx.submitted = Some(Value::Object(submitted));
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Storage reads
// ---------------------------------------------------------------------------

pub struct FetchItem {
    descriptor: StepDescriptor,
}

impl FetchItem {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("fetch_item")
                .requires(attrs::KEY)
                .provides(attrs::ITEM)
                .provides(attrs::MODIFIED_AT)
                .milestone(20),
        }
    }
}

#[async_trait]
impl Step for FetchItem {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let key = cx
            .key
            .clone()
            .ok_or_else(|| EngineError::BadRequest("missing resource key".to_string()))?;
        match env.adapter.fetch(&env.config.resource, &key).await? {
            FetchOutcome::Found(doc) => {
                cx.modified_at = parse_modified(&doc, &env.config.resource);
                cx.item = Some(doc);
                Ok(Flow::Continue)
            }
            FetchOutcome::Missing => Err(EngineError::NotFound),
            FetchOutcome::Gone => Err(EngineError::Gone),
            FetchOutcome::Ambiguous => Err(EngineError::Ambiguous),
        }
    }
}

pub struct ListItems {
    descriptor: StepDescriptor,
}

impl ListItems {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("list_items")
                .provides(attrs::COLLECTION)
                .milestone(20),
        }
    }
}

#[async_trait]
impl Step for ListItems {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        cx.collection = Some(env.adapter.list(&env.config.resource, &cx.query).await?);
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Rendering and fingerprints
// ---------------------------------------------------------------------------

pub struct RenderItem {
    descriptor: StepDescriptor,
}

impl RenderItem {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("render_item")
                .requires(attrs::ITEM)
                .requires(attrs::IDENTITY)
                .provides(attrs::OUTPUT)
                .milestone(30),
        }
    }
}

#[async_trait]
impl Step for RenderItem {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let item = cx.item.clone().ok_or_else(|| context_gap(attrs::ITEM))?;
        let output = filter_item(&env.config.resource, &read_scope(env), cx, &item)?;
        cx.output = Some(output);
        Ok(Flow::Continue)
    }
}

pub struct RenderCollection {
    descriptor: StepDescriptor,
}

impl RenderCollection {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("render_collection")
                .requires(attrs::COLLECTION)
                .requires(attrs::IDENTITY)
                .provides(attrs::LIST_OUTPUT)
                .milestone(30),
        }
    }
}

#[async_trait]
impl Step for RenderCollection {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let documents = cx.collection.clone().unwrap_or_default();
        let scope = read_scope(env);
        let mut items = Vec::with_capacity(documents.len());
        for document in &documents {
            items.push(filter_item(&env.config.resource, &scope, cx, document)?);
        }
        // List payloads are wrapped: the response body is always a single
        // JSON object, never a top-level array.
        cx.list_output = Some(json!({ "items": items }));
        Ok(Flow::Continue)
    }
}

pub struct Fingerprint {
    descriptor: StepDescriptor,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self {
            // Conditional: a custom step that already established a
            // validator pre-empts the standard one.
            descriptor: StepDescriptor::new("fingerprint")
                .requires(attrs::OUTPUT)
                .provides(attrs::ETAG)
                .milestone(30)
                .conditional(),
        }
    }
}

#[async_trait]
impl Step for Fingerprint {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, _env: &StepEnv) -> Result<Flow, EngineError> {
        let output = cx.output.as_ref().ok_or_else(|| context_gap(attrs::OUTPUT))?;
        let etag = conditional::etag_for(output);
        cx.etag = Some(etag);
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Conditional evaluation
// ---------------------------------------------------------------------------

pub struct CheckPreconditions {
    descriptor: StepDescriptor,
}

impl CheckPreconditions {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("check_preconditions")
                .requires(attrs::ETAG)
                .provides(attrs::PRECONDITION_OK)
                .milestone(35),
        }
    }
}

#[async_trait]
impl Step for CheckPreconditions {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let etag = cx.etag.clone().unwrap_or_default();
        match cx.action {
            Action::Get => match cx.preconditions.evaluate_get(&etag, cx.modified_at) {
                GetCheck::Proceed => {}
                GetCheck::NotModified => {
                    // No body, but every header that could differ across
                    // responses. The runner rolls the transaction back.
                    cx.status = Some(304);
                    cx.response_body = None;
                    cx.set_response_header("ETag", conditional::quote_etag(&etag));
                    set_cache_headers(cx, env);
                    return Ok(Flow::Stop);
                }
                GetCheck::Failed => return Err(EngineError::PreconditionFailed),
            },
            Action::Update | Action::Delete => {
                match cx.preconditions.evaluate_write(&etag, cx.modified_at) {
                    WriteCheck::Proceed => {}
                    WriteCheck::Missing(header) => {
                        return Err(EngineError::BadConditional(format!(
                            "{} is required for {}",
                            header, cx.method
                        )));
                    }
                    WriteCheck::Failed => return Err(EngineError::PreconditionFailed),
                }
            }
            _ => {}
        }
        cx.precondition_ok = true;
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

pub struct ReconcileChanges {
    descriptor: StepDescriptor,
}

impl ReconcileChanges {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("reconcile_changes")
                .requires(attrs::ITEM)
                .requires(attrs::SUBMITTED)
                .requires(attrs::SESSION_OK)
                .requires(attrs::PRECONDITION_OK)
                .provides(attrs::CHANGES)
                .milestone(40),
        }
    }
}

#[async_trait]
impl Step for ReconcileChanges {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let node = {
            let stored = cx
                .item
                .as_ref()
                .and_then(Value::as_object)
                .ok_or_else(|| context_gap(attrs::ITEM))?;
            let submitted = cx
                .submitted
                .as_ref()
                .and_then(Value::as_object)
                .ok_or_else(|| context_gap(attrs::SUBMITTED))?;
            let reconciler = Reconciler::with_chains(
                &env.config.resource,
                &*cx,
                env.config.fallback_chain(Action::Insert),
                env.config.fallback_chain(Action::Update),
            );
            reconciler.update(stored, submitted)?
        };
        if node.status == ChangeStatus::Unchanged {
            return Err(EngineError::NoChange {
                errors: node.errors_value(),
                revised: node.revised_value(),
            });
        }
        cx.changes = Some(node);
        Ok(Flow::Continue)
    }
}

pub struct ReconcileCreate {
    descriptor: StepDescriptor,
}

impl ReconcileCreate {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("reconcile_create")
                .requires(attrs::SUBMITTED)
                .requires(attrs::SESSION_OK)
                .provides(attrs::CREATE_CHANGES)
                .milestone(40),
        }
    }
}

#[async_trait]
impl Step for ReconcileCreate {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let node = {
            let submitted = cx
                .submitted
                .as_ref()
                .and_then(Value::as_object)
                .ok_or_else(|| context_gap(attrs::SUBMITTED))?;
            let reconciler = Reconciler::with_chains(
                &env.config.resource,
                &*cx,
                env.config.fallback_chain(Action::Insert),
                env.config.fallback_chain(Action::Update),
            );
            reconciler.create(submitted)?
        };
        // Errors on the root mean nothing can be created; child errors are
        // partial and ride along with the applied remainder.
        if node.has_local_errors() {
            return Err(EngineError::Invalid {
                errors: node.errors_value(),
                revised: node.revised_value(),
            });
        }
        cx.changes = Some(node);
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Change application
// ---------------------------------------------------------------------------

pub struct ApplyChanges {
    descriptor: StepDescriptor,
}

impl ApplyChanges {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("apply_changes")
                .requires(attrs::CHANGES)
                .provides(attrs::APPLIED)
                .milestone(50),
        }
    }
}

#[async_trait]
impl Step for ApplyChanges {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let node = cx.changes.clone().ok_or_else(|| context_gap(attrs::CHANGES))?;
        apply_tree(env, &node).await?;
        let key = cx.key.clone().ok_or_else(|| context_gap(attrs::KEY))?;
        match env.adapter.fetch(&env.config.resource, &key).await? {
            FetchOutcome::Found(doc) => {
                cx.modified_at = parse_modified(&doc, &env.config.resource);
                cx.applied = Some(doc);
                Ok(Flow::Continue)
            }
            _ => Err(EngineError::Storage(anyhow::anyhow!(
                "row vanished while applying changes"
            ))),
        }
    }
}

pub struct ApplyCreate {
    descriptor: StepDescriptor,
}

impl ApplyCreate {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("apply_create")
                .requires(attrs::CREATE_CHANGES)
                .provides(attrs::CREATED)
                .provides(attrs::CREATED_STATE)
                .milestone(50),
        }
    }
}

#[async_trait]
impl Step for ApplyCreate {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let node = cx.changes.clone().ok_or_else(|| context_gap(attrs::CREATE_CHANGES))?;
        let key = apply_tree(env, &node)
            .await?
            .ok_or_else(|| EngineError::Storage(anyhow::anyhow!("create yielded no key")))?;
        match env.adapter.fetch(&env.config.resource, &key).await? {
            FetchOutcome::Found(doc) => {
                cx.modified_at = parse_modified(&doc, &env.config.resource);
                cx.applied = Some(doc);
            }
            _ => {
                return Err(EngineError::Storage(anyhow::anyhow!(
                    "created row vanished"
                )));
            }
        }
        cx.created_key = Some(key);
        Ok(Flow::Continue)
    }
}

pub struct DeleteItem {
    descriptor: StepDescriptor,
}

impl DeleteItem {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("delete_item")
                .requires(attrs::ITEM)
                .requires(attrs::SESSION_OK)
                .requires(attrs::PRECONDITION_OK)
                .provides(attrs::DELETED)
                .milestone(50),
        }
    }
}

#[async_trait]
impl Step for DeleteItem {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let stored = cx
            .item
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| context_gap(attrs::ITEM))?;
        let key = stored.get(&env.config.resource.key).cloned();
        let node = ChangeNode {
            status: ChangeStatus::Deleted,
            stored: Some(stored),
            changes: BTreeMap::new(),
            errors: BTreeMap::new(),
            revised: BTreeMap::new(),
            children: BTreeMap::new(),
            index: 0,
            key,
        };
        env.adapter
            .apply(ApplyCall {
                path: "",
                schema: &env.config.resource,
                parent: None,
                node: &node,
            })
            .await?;
        cx.deleted = true;
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Refreshed rendering (refinement chain, depth 1)
// ---------------------------------------------------------------------------

pub struct RenderRefreshed {
    descriptor: StepDescriptor,
}

impl RenderRefreshed {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("render_refreshed")
                .requires(attrs::APPLIED)
                .provides(attrs::OUTPUT)
                .milestone(55),
        }
    }
}

#[async_trait]
impl Step for RenderRefreshed {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let applied = cx.applied.clone().ok_or_else(|| context_gap(attrs::APPLIED))?;
        let output = filter_item(&env.config.resource, &read_scope(env), cx, &applied)?;
        cx.output = Some(output);
        Ok(Flow::Continue)
    }
}

pub struct RefreshFingerprint {
    descriptor: StepDescriptor,
}

impl RefreshFingerprint {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("refresh_fingerprint")
                .requires_refined(attrs::OUTPUT, 1)
                .provides(attrs::ETAG)
                .milestone(55),
        }
    }
}

#[async_trait]
impl Step for RefreshFingerprint {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, _env: &StepEnv) -> Result<Flow, EngineError> {
        let output = cx.output.as_ref().ok_or_else(|| context_gap(attrs::OUTPUT))?;
        let etag = conditional::etag_for(output);
        cx.etag = Some(etag);
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Respond steps, one per action
// ---------------------------------------------------------------------------

pub struct RespondGet {
    descriptor: StepDescriptor,
}

impl RespondGet {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("respond_get")
                .requires(attrs::OUTPUT)
                .requires(attrs::ETAG)
                .requires(attrs::PRECONDITION_OK)
                .provides(attrs::GET_RESPONSE)
                .milestone(60),
        }
    }
}

#[async_trait]
impl Step for RespondGet {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let mut body = cx
            .output
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| context_gap(attrs::OUTPUT))?;
        body.insert("_links".to_string(), self_link(env, &cx.key_segment()));
        if let Some(etag) = cx.etag.clone() {
            cx.set_response_header("ETag", conditional::quote_etag(&etag));
        }
        if let Some(modified) = cx.modified_at {
            cx.set_response_header("Last-Modified", conditional::format_http_date(modified));
        }
        set_cache_headers(cx, env);
        cx.status = Some(200);
        cx.response_body = Some(Value::Object(body));
        Ok(Flow::Continue)
    }
}

pub struct RespondList {
    descriptor: StepDescriptor,
}

impl RespondList {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("respond_list")
                .requires(attrs::LIST_OUTPUT)
                .provides(attrs::LIST_RESPONSE)
                .milestone(60),
        }
    }
}

#[async_trait]
impl Step for RespondList {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let body = cx
            .list_output
            .clone()
            .ok_or_else(|| context_gap(attrs::LIST_OUTPUT))?;
        set_cache_headers(cx, env);
        cx.status = Some(200);
        cx.response_body = Some(body);
        Ok(Flow::Continue)
    }
}

pub struct RespondUpdate {
    descriptor: StepDescriptor,
}

impl RespondUpdate {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("respond_update")
                .requires(attrs::APPLIED)
                .requires_refined(attrs::OUTPUT, 1)
                .requires_refined(attrs::ETAG, 1)
                .provides(attrs::UPDATE_RESPONSE)
                .milestone(60),
        }
    }
}

#[async_trait]
impl Step for RespondUpdate {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let mut body = cx
            .output
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| context_gap(attrs::OUTPUT))?;
        body.insert("_links".to_string(), self_link(env, &cx.key_segment()));
        attach_change_trees(&mut body, cx.changes.as_ref());
        if let Some(etag) = cx.etag.clone() {
            cx.set_response_header("ETag", conditional::quote_etag(&etag));
        }
        if let Some(modified) = cx.modified_at {
            cx.set_response_header("Last-Modified", conditional::format_http_date(modified));
        }
        cx.status = Some(200);
        cx.response_body = Some(Value::Object(body));
        Ok(Flow::Continue)
    }
}

pub struct RespondCreate {
    descriptor: StepDescriptor,
}

impl RespondCreate {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("respond_create")
                .requires(attrs::CREATED)
                .requires(attrs::CREATED_STATE)
                .provides(attrs::CREATE_RESPONSE)
                .milestone(60),
        }
    }
}

#[async_trait]
impl Step for RespondCreate {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError> {
        let applied = cx.applied.clone().ok_or_else(|| context_gap(attrs::CREATED_STATE))?;
        let output = filter_item(&env.config.resource, &read_scope(env), cx, &applied)?;
        let mut body = output
            .as_object()
            .cloned()
            .ok_or_else(|| context_gap(attrs::CREATED_STATE))?;
        let segment = match cx.created_key.as_ref() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(context_gap(attrs::CREATED)),
        };
        let location = format!("/{}/{}", env.config.resource.name, segment);
        body.insert("_links".to_string(), json!({ "self": location.clone() }));
        attach_change_trees(&mut body, cx.changes.as_ref());
        let etag = conditional::etag_for(&output);
        cx.set_response_header("Location", location);
        cx.set_response_header("ETag", conditional::quote_etag(&etag));
        cx.status = Some(201);
        cx.response_body = Some(Value::Object(body));
        Ok(Flow::Continue)
    }
}

pub struct RespondDelete {
    descriptor: StepDescriptor,
}

impl RespondDelete {
    pub fn new() -> Self {
        Self {
            descriptor: StepDescriptor::new("respond_delete")
                .requires(attrs::DELETED)
                .provides(attrs::DELETE_RESPONSE)
                .milestone(60),
        }
    }
}

#[async_trait]
impl Step for RespondDelete {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    async fn run(&self, cx: &mut RequestContext, _env: &StepEnv) -> Result<Flow, EngineError> {
        cx.status = Some(204);
        cx.response_body = None;
        Ok(Flow::Continue)
    }
}
