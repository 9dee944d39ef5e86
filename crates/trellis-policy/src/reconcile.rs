//! Change-tree reconciliation.
//!
//! The reconciler compares a submitted value for an entity (and recursively
//! its nested relationship lists) against its stored counterpart, or
//! absence, and produces a typed change tree. Column authorization is
//! applied at each level: new nodes partition under the insert scope,
//! existing nodes under the update scope. Nothing is persisted here; the
//! tree only classifies, and a storage collaborator applies it node by
//! node afterwards (parents before children for new nodes, deletions last).
//!
//! Error policy: a disallowed or invalid column is recorded in that node's
//! error accumulator and excluded from the change map; it never aborts
//! sibling columns or sibling nodes. Duplicate keys within one submitted
//! list and parent-link conflicts are fatal to the affected node only.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use trellis_core::config::ResourceSchema;
use trellis_core::value as column_value;
use trellis_core::Action;

use crate::rules::check_column_rules;
use crate::{AccessScope, PermitSource, ScopeError};

/// Submitted key that explicitly marks an entity for deletion.
pub const DELETE_MARKER: &str = "_delete";

/// Proposed disposition of one entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    New,
    Updated,
    Unchanged,
    Deleted,
}

/// One relationship's ordered change nodes.
#[derive(Debug, Clone, Default)]
pub struct ChangeList {
    pub nodes: Vec<ChangeNode>,
}

impl ChangeList {
    /// True when every node in the list is unchanged.
    pub fn is_unchanged(&self) -> bool {
        self.nodes.iter().all(|n| n.status == ChangeStatus::Unchanged)
    }
}

/// One entity instance's proposed change.
#[derive(Debug, Clone)]
pub struct ChangeNode {
    pub status: ChangeStatus,

    /// The old stored instance; absent for new nodes.
    pub stored: Option<Map<String, Value>>,

    /// Changed columns and their canonical new values. Unchanged columns
    /// are omitted.
    pub changes: BTreeMap<String, Value>,

    /// Per-column error accumulator.
    pub errors: BTreeMap<String, Vec<String>>,

    /// Server-corrected values (e.g. coercions that altered the literal).
    pub revised: BTreeMap<String, Value>,

    /// Child change lists, one per submitted nested relationship.
    pub children: BTreeMap<String, ChangeList>,

    /// Original position in the submitted list, for error and revision
    /// attribution. Pruned deletions carry their stored position offset
    /// past the end of the submitted list.
    pub index: usize,

    /// Entity key, when known.
    pub key: Option<Value>,
}

impl ChangeNode {
    fn empty(status: ChangeStatus, index: usize) -> Self {
        Self {
            status,
            stored: None,
            changes: BTreeMap::new(),
            errors: BTreeMap::new(),
            revised: BTreeMap::new(),
            children: BTreeMap::new(),
            index,
            key: None,
        }
    }

    fn invalid(index: usize, column: &str, message: impl Into<String>) -> Self {
        let mut node = Self::empty(ChangeStatus::Unchanged, index);
        node.errors.insert(column.to_string(), vec![message.into()]);
        node
    }

    /// Errors recorded on this node itself (not descendants). A node with
    /// local errors must not be applied: its change map may be incomplete.
    pub fn has_local_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether this node or any descendant carries errors.
    pub fn has_errors(&self) -> bool {
        self.has_local_errors()
            || self
                .children
                .values()
                .any(|list| list.nodes.iter().any(ChangeNode::has_errors))
    }

    /// The error tree, mirroring the change-node shape, with empty
    /// branches pruned. Child nodes are keyed by their original index.
    pub fn errors_value(&self) -> Option<Value> {
        let mut map = Map::new();
        for (column, messages) in &self.errors {
            map.insert(column.clone(), Value::from(messages.clone()));
        }
        for (relation, list) in &self.children {
            let mut branch = Map::new();
            for node in &list.nodes {
                if let Some(value) = node.errors_value() {
                    branch.insert(node.index.to_string(), value);
                }
            }
            if !branch.is_empty() {
                map.insert(relation.clone(), Value::Object(branch));
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    /// The revised-value tree, same shape as [`Self::errors_value`].
    pub fn revised_value(&self) -> Option<Value> {
        let mut map = Map::new();
        for (column, value) in &self.revised {
            map.insert(column.clone(), value.clone());
        }
        for (relation, list) in &self.children {
            let mut branch = Map::new();
            for node in &list.nodes {
                if let Some(value) = node.revised_value() {
                    branch.insert(node.index.to_string(), value);
                }
            }
            if !branch.is_empty() {
                map.insert(relation.clone(), Value::Object(branch));
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }
}

/// Expected parent linkage for nodes of a nested list.
struct ParentLink<'a> {
    column: &'a str,
    key: Option<&'a Value>,
}

/// Diffs submitted object graphs against stored state.
pub struct Reconciler<'a, S: PermitSource + ?Sized> {
    schema: &'a ResourceSchema,
    source: &'a S,
    insert_scope: AccessScope,
    update_scope: AccessScope,
}

impl<'a, S: PermitSource + ?Sized> Reconciler<'a, S> {
    /// Reconciler with the default permit fallback chains.
    pub fn new(schema: &'a ResourceSchema, source: &'a S) -> Self {
        Self::with_chains(schema, source, Vec::new(), Vec::new())
    }

    /// Reconciler with configured fallback chains for insert and update.
    pub fn with_chains(
        schema: &'a ResourceSchema,
        source: &'a S,
        insert_chain: Vec<String>,
        update_chain: Vec<String>,
    ) -> Self {
        Self {
            schema,
            source,
            insert_scope: AccessScope::new(Action::Insert, insert_chain),
            update_scope: AccessScope::new(Action::Update, update_chain),
        }
    }

    /// Reconcile a submission with no stored counterpart: an all-new tree.
    pub fn create(&self, submitted: &Map<String, Value>) -> Result<ChangeNode, ScopeError> {
        self.node(
            self.schema,
            &self.insert_scope,
            &self.update_scope,
            None,
            submitted,
            0,
            None,
        )
    }

    /// Reconcile a submission against its stored counterpart.
    pub fn update(
        &self,
        stored: &Map<String, Value>,
        submitted: &Map<String, Value>,
    ) -> Result<ChangeNode, ScopeError> {
        self.node(
            self.schema,
            &self.insert_scope,
            &self.update_scope,
            Some(stored),
            submitted,
            0,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn node(
        &self,
        schema: &ResourceSchema,
        insert_scope: &AccessScope,
        update_scope: &AccessScope,
        stored: Option<&Map<String, Value>>,
        submitted: &Map<String, Value>,
        index: usize,
        parent: Option<ParentLink<'_>>,
    ) -> Result<ChangeNode, ScopeError> {
        // Explicit deletion wins over everything else; it only applies to
        // entities present in stored state.
        if let Some(stored) = stored {
            if submitted
                .get(DELETE_MARKER)
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                let mut node = ChangeNode::empty(ChangeStatus::Deleted, index);
                node.key = stored.get(&schema.key).cloned();
                node.stored = Some(stored.clone());
                return Ok(node);
            }
        }

        let is_new = stored.is_none();
        let scope = if is_new { insert_scope } else { update_scope };
        let permit = scope.resolve(self.source)?;

        let mut node = ChangeNode::empty(
            if is_new {
                ChangeStatus::New
            } else {
                ChangeStatus::Unchanged
            },
            index,
        );
        node.stored = stored.cloned();
        node.key = stored.and_then(|s| s.get(&schema.key)).cloned();

        // A submitted parent link must agree with the enclosing resource.
        // A conflict is fatal to this node: no changes are taken from it.
        if let Some(parent) = &parent {
            if let Some(value) = submitted.get(parent.column) {
                let kind = schema
                    .column(parent.column)
                    .map(|c| c.kind)
                    .unwrap_or_default();
                let conflicting = match parent.key {
                    Some(expected) => !column_value::equal(kind, value, expected),
                    // The enclosing parent is new; its key is not known
                    // yet, so a child cannot legitimately name it.
                    None => !value.is_null(),
                };
                if conflicting {
                    node.errors.insert(
                        parent.column.to_string(),
                        vec!["parent link conflicts with the enclosing resource".to_string()],
                    );
                    node.status = if is_new {
                        ChangeStatus::New
                    } else {
                        ChangeStatus::Unchanged
                    };
                    return Ok(node);
                }
            }
        }

        for (name, raw) in submitted {
            if name == DELETE_MARKER || schema.relations.contains_key(name) {
                continue;
            }
            if let Some(parent) = &parent {
                if name == parent.column {
                    // Consistent with the enclosing resource (checked
                    // above); the link is not a column change.
                    continue;
                }
            }
            let Some(spec) = schema.column(name) else {
                node.errors
                    .entry(name.clone())
                    .or_default()
                    .push(format!("unknown column '{}'", name));
                continue;
            };
            // The key identifies an existing node; it never changes.
            if !is_new && name == &schema.key {
                let unchanged = stored
                    .and_then(|s| s.get(name))
                    .map(|old| column_value::equal(spec.kind, old, raw))
                    .unwrap_or(false);
                if !unchanged {
                    node.errors
                        .entry(name.clone())
                        .or_default()
                        .push("key column may not change".to_string());
                }
                continue;
            }
            let coerced = match column_value::coerce(spec.kind, raw) {
                Ok(value) => value,
                Err(message) => {
                    node.errors.entry(name.clone()).or_default().push(message);
                    continue;
                }
            };
            // A column only counts as changed under its own equality rule.
            // Submitting a stored value back verbatim is not a write, so it
            // does not go through the permit gate; a full read-modify-write
            // round trip of an identical payload stays wholly unchanged.
            let changed = match stored.and_then(|s| s.get(name)) {
                Some(old) => !column_value::equal(spec.kind, old, &coerced),
                None => true,
            };
            if !changed {
                continue;
            }
            if !permit.test(name) {
                node.errors.entry(name.clone()).or_default().push(format!(
                    "column '{}' is not writable for {}",
                    name,
                    scope.action()
                ));
                continue;
            }
            if let Err(message) = check_column_rules(name, spec, &coerced) {
                node.errors.entry(name.clone()).or_default().push(message);
                continue;
            }
            if &coerced != raw {
                node.revised.insert(name.clone(), coerced.clone());
            }
            node.changes.insert(name.clone(), coerced);
        }

        for (rel_name, rel_spec) in &schema.relations {
            let Some(submitted_rel) = submitted.get(rel_name) else {
                continue;
            };
            let Some(submitted_list) = submitted_rel.as_array() else {
                node.errors
                    .entry(rel_name.clone())
                    .or_default()
                    .push(format!("'{}' must be a list", rel_name));
                continue;
            };

            let child_schema = &rel_spec.resource;
            let child_insert = insert_scope.descend(rel_name);
            let child_update = update_scope.descend(rel_name);
            let key_kind = child_schema
                .column(&child_schema.key)
                .map(|c| c.kind)
                .unwrap_or_default();

            let stored_list: Vec<&Map<String, Value>> = stored
                .and_then(|s| s.get(rel_name))
                .and_then(Value::as_array)
                .map(|list| list.iter().filter_map(Value::as_object).collect())
                .unwrap_or_default();
            let stored_by_key: BTreeMap<String, &Map<String, Value>> = stored_list
                .iter()
                .filter_map(|child| {
                    child
                        .get(&child_schema.key)
                        .map(|k| (k.to_string(), *child))
                })
                .collect();

            let mut nodes = Vec::new();
            let mut seen: BTreeSet<String> = BTreeSet::new();
            for (i, item) in submitted_list.iter().enumerate() {
                let Some(item) = item.as_object() else {
                    nodes.push(ChangeNode::invalid(
                        i,
                        &child_schema.key,
                        "list items must be objects",
                    ));
                    continue;
                };
                let link = ParentLink {
                    column: &rel_spec.parent_link,
                    key: node.key.as_ref(),
                };
                match item.get(&child_schema.key) {
                    Some(submitted_key) => {
                        let canonical = match column_value::coerce(key_kind, submitted_key) {
                            Ok(value) => value.to_string(),
                            Err(message) => {
                                nodes.push(ChangeNode::invalid(i, &child_schema.key, message));
                                continue;
                            }
                        };
                        if !seen.insert(canonical.clone()) {
                            nodes.push(ChangeNode::invalid(
                                i,
                                &child_schema.key,
                                "duplicate key in submitted list",
                            ));
                            continue;
                        }
                        match stored_by_key.get(&canonical) {
                            Some(stored_child) => {
                                let child = self.node(
                                    child_schema,
                                    &child_insert,
                                    &child_update,
                                    Some(*stored_child),
                                    item,
                                    i,
                                    Some(link),
                                )?;
                                nodes.push(child);
                            }
                            None => {
                                // The key names an entity that is not a
                                // member of this collection: either it
                                // does not exist or it belongs to another
                                // parent. Cross-parent moves are rejected.
                                nodes.push(ChangeNode::invalid(
                                    i,
                                    &child_schema.key,
                                    "key does not belong to this collection",
                                ));
                            }
                        }
                    }
                    None => {
                        let child = self.node(
                            child_schema,
                            &child_insert,
                            &child_update,
                            None,
                            item,
                            i,
                            Some(link),
                        )?;
                        nodes.push(child);
                    }
                }
            }

            if rel_spec.prune_missing {
                let mut offset = submitted_list.len();
                for stored_child in &stored_list {
                    let Some(key) = stored_child.get(&child_schema.key) else {
                        continue;
                    };
                    if !seen.contains(&key.to_string()) {
                        let mut deleted = ChangeNode::empty(ChangeStatus::Deleted, offset);
                        deleted.key = Some(key.clone());
                        deleted.stored = Some((*stored_child).clone());
                        nodes.push(deleted);
                        offset += 1;
                    }
                }
            }

            if !nodes.is_empty() {
                node.children.insert(rel_name.clone(), ChangeList { nodes });
            }
        }

        if !is_new {
            let children_changed = node.children.values().any(|list| !list.is_unchanged());
            node.status = if node.changes.is_empty() && !children_changed {
                ChangeStatus::Unchanged
            } else {
                ChangeStatus::Updated
            };
        }

        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Permit;
    use serde_json::json;

    fn schema() -> ResourceSchema {
        serde_yaml::from_str(
            r#"
name: orders
key: id
columns:
  id: { kind: integer }
  status:
    kind: text
    values: [open, shipped, closed]
  total: { kind: float }
  secret: { kind: text }
relations:
  items:
    parent_link: order_id
    prune_missing: true
    resource:
      name: order_items
      key: id
      columns:
        id: { kind: integer }
        order_id: { kind: integer }
        sku: { kind: text }
        qty: { kind: integer }
"#,
        )
        .unwrap()
    }

    fn permits() -> BTreeMap<String, Permit> {
        BTreeMap::from([
            ("write".to_string(), Permit::deny(["secret"])),
            ("items.write".to_string(), Permit::deny([] as [&str; 0])),
        ])
    }

    fn stored() -> Map<String, Value> {
        json!({
            "id": 1,
            "status": "open",
            "total": 10.0,
            "secret": "s",
            "items": [
                {"id": 11, "order_id": 1, "sku": "A", "qty": 2},
                {"id": 12, "order_id": 1, "sku": "B", "qty": 1},
            ],
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn submitted(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_identical_submission_is_wholly_unchanged() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler.update(&stored, &stored).unwrap();
        assert_eq!(node.status, ChangeStatus::Unchanged);
        assert!(node.changes.is_empty());
        assert!(!node.has_errors());
        for list in node.children.values() {
            assert!(list.is_unchanged());
        }
    }

    #[test]
    fn test_create_yields_all_new_tree() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let node = reconciler
            .create(&submitted(json!({
                "status": "open",
                "items": [{"sku": "A", "qty": 1}],
            })))
            .unwrap();
        assert_eq!(node.status, ChangeStatus::New);
        assert_eq!(node.changes.get("status"), Some(&json!("open")));
        let items = &node.children["items"];
        assert_eq!(items.nodes.len(), 1);
        assert_eq!(items.nodes[0].status, ChangeStatus::New);
        assert!(!node.has_errors());
    }

    #[test]
    fn test_disallowed_column_is_recorded_not_applied() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler
            .update(&stored, &submitted(json!({"id": 1, "secret": "x", "status": "shipped"})))
            .unwrap();
        assert!(!node.changes.contains_key("secret"));
        assert!(node.errors.contains_key("secret"));
        // The allowed sibling column still goes through.
        assert_eq!(node.changes.get("status"), Some(&json!("shipped")));
        assert_eq!(node.status, ChangeStatus::Updated);
    }

    #[test]
    fn test_field_equality_uses_column_kind() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        // 10 == 10.0 for a float column: not a change.
        let node = reconciler
            .update(&stored, &submitted(json!({"id": 1, "total": 10})))
            .unwrap();
        assert_eq!(node.status, ChangeStatus::Unchanged);
    }

    #[test]
    fn test_coercion_records_revised_value() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler
            .update(
                &stored,
                &submitted(json!({"id": 1, "items": [{"id": 11, "qty": "5"}]})),
            )
            .unwrap();
        let item = &node.children["items"].nodes[0];
        assert_eq!(item.changes.get("qty"), Some(&json!(5)));
        assert_eq!(item.revised.get("qty"), Some(&json!(5)));
        assert_eq!(node.status, ChangeStatus::Updated);
    }

    #[test]
    fn test_values_rule_violation_goes_to_errors() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler
            .update(&stored, &submitted(json!({"id": 1, "status": "lost"})))
            .unwrap();
        assert!(node.errors.contains_key("status"));
        assert!(node.changes.is_empty());
    }

    #[test]
    fn test_missing_stored_child_is_pruned() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler
            .update(
                &stored,
                &submitted(json!({
                    "id": 1,
                    "items": [{"id": 11, "qty": 3}],
                })),
            )
            .unwrap();
        let items = &node.children["items"];
        assert_eq!(items.nodes.len(), 2);
        assert_eq!(items.nodes[0].status, ChangeStatus::Updated);
        assert_eq!(items.nodes[1].status, ChangeStatus::Deleted);
        assert_eq!(items.nodes[1].key, Some(json!(12)));
        // Deletions keep a position past the submitted list.
        assert_eq!(items.nodes[1].index, 1);
    }

    #[test]
    fn test_explicit_delete_marker() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler
            .update(
                &stored,
                &submitted(json!({
                    "id": 1,
                    "items": [
                        {"id": 11, "_delete": true},
                        {"id": 12},
                    ],
                })),
            )
            .unwrap();
        let items = &node.children["items"];
        assert_eq!(items.nodes[0].status, ChangeStatus::Deleted);
        assert_eq!(items.nodes[1].status, ChangeStatus::Unchanged);
        assert_eq!(node.status, ChangeStatus::Updated);
    }

    #[test]
    fn test_duplicate_keys_are_fatal_to_the_node() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler
            .update(
                &stored,
                &submitted(json!({
                    "id": 1,
                    "items": [
                        {"id": 11, "qty": 3},
                        {"id": 11, "qty": 4},
                        {"id": 12},
                    ],
                })),
            )
            .unwrap();
        let items = &node.children["items"];
        assert_eq!(items.nodes[0].status, ChangeStatus::Updated);
        assert!(items.nodes[1].has_local_errors());
        assert!(items.nodes[1].changes.is_empty());
    }

    #[test]
    fn test_foreign_key_in_list_is_rejected() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler
            .update(
                &stored,
                &submitted(json!({
                    "id": 1,
                    "items": [
                        {"id": 11},
                        {"id": 999, "sku": "C"},
                        {"id": 12},
                    ],
                })),
            )
            .unwrap();
        let conflicting = &node.children["items"].nodes[1];
        assert!(conflicting.has_local_errors());
        assert_eq!(conflicting.index, 1);
        let errors = node.errors_value().unwrap();
        assert!(errors["items"]["1"]["id"].is_array());
    }

    #[test]
    fn test_parent_link_conflict_is_fatal_to_that_node() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler
            .update(
                &stored,
                &submitted(json!({
                    "id": 1,
                    "items": [{"id": 11, "order_id": 2, "qty": 9}],
                })),
            )
            .unwrap();
        let child = &node.children["items"].nodes[0];
        assert!(child.errors.contains_key("order_id"));
        assert!(child.changes.is_empty());
    }

    #[test]
    fn test_nested_create_with_one_conflicting_child() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let node = reconciler
            .create(&submitted(json!({
                "status": "open",
                "items": [
                    {"sku": "A", "qty": 1},
                    {"id": 11, "sku": "B"},
                ],
            })))
            .unwrap();
        assert_eq!(node.status, ChangeStatus::New);
        let items = &node.children["items"];
        assert_eq!(items.nodes[0].status, ChangeStatus::New);
        assert!(!items.nodes[0].has_errors());
        assert!(items.nodes[1].has_local_errors());
        let errors = node.errors_value().unwrap();
        assert!(errors["items"]["1"]["id"].is_array());
        assert!(errors["items"].get("0").is_none());
    }

    #[test]
    fn test_error_tree_prunes_empty_branches() {
        let schema = schema();
        let permits = permits();
        let reconciler = Reconciler::new(&schema, &permits);
        let stored = stored();
        let node = reconciler.update(&stored, &stored).unwrap();
        assert!(node.errors_value().is_none());
        assert!(node.revised_value().is_none());
    }
}
