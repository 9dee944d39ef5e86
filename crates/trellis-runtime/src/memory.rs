//! In-memory storage adapter.
//!
//! Reference implementation of [`StorageAdapter`] backing tests and the
//! demo server. Documents are stored whole: one JSON object per root
//! entity, nested relationship rows as arrays inside it. Transactions use
//! a working copy: `begin` clones the committed set, mutations apply to
//! the clone, `commit` swaps it in, `rollback` discards it.
//!
//! One working copy means one transaction at a time; that matches the
//! engine's one-request-per-run discipline and is not a general
//! concurrent store.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

use trellis_core::config::ResourceSchema;
use trellis_policy::ChangeStatus;

use crate::adapter::{ApplyCall, FetchOutcome, StorageAdapter};

/// Marker column the adapter uses to represent soft-deleted rows.
pub const DELETED_COLUMN: &str = "_deleted";

pub struct MemoryAdapter {
    key_column: String,
    state: Mutex<Store>,
}

struct Store {
    committed: Vec<Value>,
    working: Option<Vec<Value>>,
    next_key: i64,
}

impl MemoryAdapter {
    pub fn new(key_column: &str) -> Self {
        Self::with_documents(key_column, Vec::new())
    }

    /// Seed with documents. The key counter continues past the largest
    /// integer value found under `key_column` anywhere in the seed.
    pub fn with_documents(key_column: &str, documents: Vec<Value>) -> Self {
        let mut highest = 0;
        for document in &documents {
            scan_keys(document, key_column, &mut highest);
        }
        Self {
            key_column: key_column.to_string(),
            state: Mutex::new(Store {
                committed: documents,
                working: None,
                next_key: highest + 1,
            }),
        }
    }

    /// Snapshot of the committed documents, for assertions.
    pub fn documents(&self) -> Vec<Value> {
        self.state.lock().expect("memory adapter poisoned").committed.clone()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn begin(&self) -> anyhow::Result<()> {
        let mut store = self.state.lock().expect("memory adapter poisoned");
        if store.working.is_some() {
            bail!("transaction already active");
        }
        store.working = Some(store.committed.clone());
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()> {
        let mut store = self.state.lock().expect("memory adapter poisoned");
        let working = store
            .working
            .take()
            .ok_or_else(|| anyhow!("commit without an active transaction"))?;
        store.committed = working;
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        let mut store = self.state.lock().expect("memory adapter poisoned");
        store.working = None;
        Ok(())
    }

    async fn fetch(&self, schema: &ResourceSchema, key: &Value) -> anyhow::Result<FetchOutcome> {
        let store = self.state.lock().expect("memory adapter poisoned");
        let documents = store.working.as_ref().unwrap_or(&store.committed);
        let matches: Vec<&Value> = documents
            .iter()
            .filter(|doc| {
                doc.get(&schema.key)
                    .map(|candidate| keys_equal(candidate, key))
                    .unwrap_or(false)
            })
            .collect();
        Ok(match matches.as_slice() {
            [] => FetchOutcome::Missing,
            [doc] => {
                if doc
                    .get(DELETED_COLUMN)
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    FetchOutcome::Gone
                } else {
                    FetchOutcome::Found((*doc).clone())
                }
            }
            _ => FetchOutcome::Ambiguous,
        })
    }

    async fn list(
        &self,
        _schema: &ResourceSchema,
        _query: &BTreeMap<String, String>,
    ) -> anyhow::Result<Vec<Value>> {
        let store = self.state.lock().expect("memory adapter poisoned");
        let documents = store.working.as_ref().unwrap_or(&store.committed);
        Ok(documents
            .iter()
            .filter(|doc| {
                !doc.get(DELETED_COLUMN)
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn apply(&self, call: ApplyCall<'_>) -> anyhow::Result<Value> {
        let mut store = self.state.lock().expect("memory adapter poisoned");
        let Store {
            working, next_key, ..
        } = &mut *store;
        let working = working
            .as_mut()
            .ok_or_else(|| anyhow!("apply without an active transaction"))?;
        let segments: Vec<&str> = call.path.split('.').filter(|s| !s.is_empty()).collect();
        apply_in(working, &segments, &call, next_key)?
            .ok_or_else(|| anyhow!("no parent row found for path '{}'", call.path))
    }
}

fn apply_in(
    list: &mut Vec<Value>,
    segments: &[&str],
    call: &ApplyCall<'_>,
    next_key: &mut i64,
) -> anyhow::Result<Option<Value>> {
    if segments.is_empty() {
        return apply_here(list, call, next_key).map(Some);
    }
    let (head, rest) = (segments[0], &segments[1..]);
    for document in list.iter_mut() {
        if rest.is_empty() {
            if let Some(parent) = &call.parent {
                let matched = document
                    .get(parent.key_column)
                    .map(|candidate| keys_equal(candidate, &parent.key))
                    .unwrap_or(false);
                if !matched {
                    continue;
                }
            }
        }
        let Some(object) = document.as_object_mut() else {
            continue;
        };
        let children = object
            .entry(head.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(children) = children.as_array_mut() else {
            continue;
        };
        if let Some(key) = apply_in(children, rest, call, next_key)? {
            return Ok(Some(key));
        }
    }
    Ok(None)
}

fn apply_here(
    list: &mut Vec<Value>,
    call: &ApplyCall<'_>,
    next_key: &mut i64,
) -> anyhow::Result<Value> {
    let key_column = &call.schema.key;
    match call.node.status {
        ChangeStatus::New => {
            let mut row = Map::new();
            for (column, value) in &call.node.changes {
                row.insert(column.clone(), value.clone());
            }
            let key = match row.get(key_column) {
                Some(key) => key.clone(),
                None => {
                    let key = Value::from(*next_key);
                    *next_key += 1;
                    row.insert(key_column.clone(), key.clone());
                    key
                }
            };
            if let Some(parent) = &call.parent {
                row.insert(parent.link_column.to_string(), parent.key.clone());
            }
            touch(&mut row, call.schema);
            list.push(Value::Object(row));
            Ok(key)
        }
        ChangeStatus::Updated => {
            let key = call
                .node
                .key
                .clone()
                .ok_or_else(|| anyhow!("update without a key"))?;
            for document in list.iter_mut() {
                let matched = document
                    .get(key_column)
                    .map(|candidate| keys_equal(candidate, &key))
                    .unwrap_or(false);
                if !matched {
                    continue;
                }
                if let Some(row) = document.as_object_mut() {
                    for (column, value) in &call.node.changes {
                        row.insert(column.clone(), value.clone());
                    }
                    touch(row, call.schema);
                }
                return Ok(key);
            }
            bail!("no row with key {} to update", key)
        }
        ChangeStatus::Deleted => {
            let key = call
                .node
                .key
                .clone()
                .ok_or_else(|| anyhow!("delete without a key"))?;
            list.retain(|document| {
                !document
                    .get(key_column)
                    .map(|candidate| keys_equal(candidate, &key))
                    .unwrap_or(false)
            });
            Ok(key)
        }
        ChangeStatus::Unchanged => Ok(call.node.key.clone().unwrap_or(Value::Null)),
    }
}

/// Maintain the modification-time column on write.
fn touch(row: &mut Map<String, Value>, schema: &ResourceSchema) {
    if let Some(column) = &schema.modified_column {
        row.insert(column.clone(), Value::String(Utc::now().to_rfc3339()));
    }
}

fn keys_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn scan_keys(value: &Value, key_column: &str, highest: &mut i64) {
    match value {
        Value::Object(object) => {
            for (name, nested) in object {
                if name == key_column {
                    if let Some(key) = nested.as_i64() {
                        *highest = (*highest).max(key);
                    }
                }
                scan_keys(nested, key_column, highest);
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_keys(item, key_column, highest);
            }
        }
        _ => {}
    }
}
