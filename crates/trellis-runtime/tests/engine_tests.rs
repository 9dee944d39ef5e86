//! End-to-end engine tests against the in-memory adapter.
//!
//! Run with: cargo test --package trellis-runtime --test engine_tests

use serde_json::{json, Value};
use std::sync::Arc;

use trellis_core::EngineConfig;
use trellis_runtime::{
    AnonymousIdentity, BuildError, Engine, EngineRequest, MemoryAdapter, PermissiveGuard,
};

const CONFIG: &str = r#"
resource:
  name: orders
  key: id
  modified_column: updated_at
  columns:
    id: { kind: integer }
    status: { kind: text, values: [open, shipped, closed] }
    total: { kind: float }
    secret: { kind: text }
    updated_at: { kind: timestamp }
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
permits:
  read: { deny: [secret] }
  write: { deny: [secret, updated_at] }
  "items.read": { deny: [] }
  "items.write": { deny: [] }
cache:
  cache_control: "private, max-age=0"
"#;

fn order() -> Value {
    json!({
        "id": 1,
        "status": "open",
        "total": 10.0,
        "secret": "s",
        "updated_at": "2026-03-01T12:00:00+00:00",
        "items": [
            {"id": 11, "order_id": 1, "sku": "A", "qty": 2},
            {"id": 12, "order_id": 1, "sku": "B", "qty": 1},
        ],
    })
}

fn engine_with(documents: Vec<Value>) -> (Engine, Arc<MemoryAdapter>) {
    let adapter = Arc::new(MemoryAdapter::with_documents("id", documents));
    let engine = Engine::new(
        EngineConfig::from_yaml(CONFIG).unwrap(),
        adapter.clone(),
        Arc::new(AnonymousIdentity),
        Arc::new(PermissiveGuard),
    )
    .unwrap();
    (engine, adapter)
}

/// GET the fixture and return (etag, last_modified, body).
async fn get_current(engine: &Engine) -> (String, String, Value) {
    let response = engine
        .handle(EngineRequest::new(trellis_core::Action::Get).with_key(json!(1)))
        .await;
    assert_eq!(response.status, 200);
    (
        response.header("ETag").unwrap().to_string(),
        response.header("Last-Modified").unwrap().to_string(),
        response.body.unwrap(),
    )
}

#[tokio::test]
async fn test_get_filters_columns_and_sets_validators() {
    let (engine, _adapter) = engine_with(vec![order()]);
    let (etag, last_modified, body) = get_current(&engine).await;

    assert!(etag.starts_with('"') && etag.ends_with('"'));
    assert_eq!(last_modified, "Sun, 01 Mar 2026 12:00:00 GMT");
    assert_eq!(body["id"], json!(1));
    assert!(body.get("secret").is_none(), "denied column leaked");
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["_links"]["self"], json!("/orders/1"));
}

#[tokio::test]
async fn test_get_if_none_match_hit_is_304_with_no_body() {
    let (engine, _adapter) = engine_with(vec![order()]);
    let (etag, _, _) = get_current(&engine).await;

    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Get)
                .with_key(json!(1))
                .with_header("If-None-Match", &etag),
        )
        .await;
    assert_eq!(response.status, 304);
    assert!(response.body.is_none());
    assert_eq!(response.header("ETag"), Some(etag.as_str()));
}

#[tokio::test]
async fn test_get_if_none_match_miss_returns_full_response() {
    let (engine, _adapter) = engine_with(vec![order()]);
    let (etag, _, _) = get_current(&engine).await;

    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Get)
                .with_key(json!(1))
                .with_header("If-None-Match", "\"different\""),
        )
        .await;
    assert_eq!(response.status, 200);
    assert!(response.body.is_some());
    assert_eq!(response.header("ETag"), Some(etag.as_str()));
}

#[tokio::test]
async fn test_put_identical_payload_is_no_change() {
    let (engine, _adapter) = engine_with(vec![order()]);
    let (etag, last_modified, body) = get_current(&engine).await;

    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Update)
                .with_key(json!(1))
                .with_header("If-Match", &etag)
                .with_header("If-Unmodified-Since", &last_modified)
                .with_body(body),
        )
        .await;
    assert_eq!(response.status, 409);
    assert_eq!(response.body.unwrap()["message"], json!("No change"));
}

#[tokio::test]
async fn test_put_with_stale_date_is_412_and_writes_nothing() {
    let (engine, adapter) = engine_with(vec![order()]);
    let (etag, _, _) = get_current(&engine).await;
    let before = adapter.documents();

    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Update)
                .with_key(json!(1))
                .with_header("If-Match", &etag)
                .with_header("If-Unmodified-Since", "Sun, 01 Mar 2026 11:00:00 GMT")
                .with_body(json!({"status": "shipped"})),
        )
        .await;
    assert_eq!(response.status, 412);
    assert_eq!(adapter.documents(), before);
}

#[tokio::test]
async fn test_put_applies_changes_and_refreshes_validator() {
    let (engine, adapter) = engine_with(vec![order()]);
    let (etag, last_modified, _) = get_current(&engine).await;

    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Update)
                .with_key(json!(1))
                .with_header("If-Match", &etag)
                .with_header("If-Unmodified-Since", &last_modified)
                .with_body(json!({"status": "shipped"})),
        )
        .await;
    assert_eq!(response.status, 200);
    let body = response.body.clone().unwrap();
    assert_eq!(body["status"], json!("shipped"));
    assert_ne!(response.header("ETag"), Some(etag.as_str()));
    assert_eq!(adapter.documents()[0]["status"], json!("shipped"));
}

#[tokio::test]
async fn test_put_without_if_match_is_rejected() {
    let (engine, _adapter) = engine_with(vec![order()]);
    let (_, last_modified, _) = get_current(&engine).await;

    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Update)
                .with_key(json!(1))
                .with_header("If-Unmodified-Since", &last_modified)
                .with_body(json!({"status": "shipped"})),
        )
        .await;
    assert_eq!(response.status, 400);
    let message = response.body.unwrap()["message"].as_str().unwrap().to_string();
    assert!(message.contains("If-Match"));
}

#[tokio::test]
async fn test_put_with_if_none_match_is_rejected() {
    let (engine, _adapter) = engine_with(vec![order()]);
    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Update)
                .with_key(json!(1))
                .with_header("If-None-Match", "\"anything\"")
                .with_body(json!({"status": "shipped"})),
        )
        .await;
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn test_nested_create_applies_good_child_and_records_conflict() {
    let (engine, adapter) = engine_with(vec![order()]);
    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Insert).with_body(json!({
                "status": "open",
                "total": 5.5,
                "items": [
                    {"sku": "C", "qty": 1},
                    {"id": 11, "sku": "D"},
                ],
            })),
        )
        .await;
    assert_eq!(response.status, 201);
    assert_eq!(response.header("Location"), Some("/orders/13"));

    let body = response.body.unwrap();
    assert_eq!(body["status"], json!("open"));
    // The conflicting child is an error branch keyed by its submitted
    // position; the valid sibling went through.
    assert!(body["errors"]["items"]["1"]["id"].is_array());
    assert!(body["errors"]["items"].get("0").is_none());

    let documents = adapter.documents();
    let created = documents
        .iter()
        .find(|doc| doc["id"] == json!(13))
        .expect("created order missing");
    let items = created["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["sku"], json!("C"));
    assert_eq!(items[0]["order_id"], json!(13));
}

#[tokio::test]
async fn test_nested_update_prunes_missing_children() {
    let (engine, adapter) = engine_with(vec![order()]);
    let (etag, last_modified, _) = get_current(&engine).await;

    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Update)
                .with_key(json!(1))
                .with_header("If-Match", &etag)
                .with_header("If-Unmodified-Since", &last_modified)
                .with_body(json!({
                    "items": [{"id": 11, "qty": 5}],
                })),
        )
        .await;
    assert_eq!(response.status, 200);

    let items = adapter.documents()[0]["items"].as_array().unwrap().clone();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], json!(11));
    assert_eq!(items[0]["qty"], json!(5));
}

#[tokio::test]
async fn test_delete_requires_and_honors_preconditions() {
    let (engine, adapter) = engine_with(vec![order()]);
    let (etag, last_modified, _) = get_current(&engine).await;

    let refused = engine
        .handle(EngineRequest::new(trellis_core::Action::Delete).with_key(json!(1)))
        .await;
    assert_eq!(refused.status, 400);

    let response = engine
        .handle(
            EngineRequest::new(trellis_core::Action::Delete)
                .with_key(json!(1))
                .with_header("If-Match", &etag)
                .with_header("If-Unmodified-Since", &last_modified),
        )
        .await;
    assert_eq!(response.status, 204);
    assert!(response.body.is_none());
    assert!(adapter.documents().is_empty());
}

#[tokio::test]
async fn test_soft_deleted_row_is_410() {
    let mut doc = order();
    doc["_deleted"] = json!(true);
    let (engine, _adapter) = engine_with(vec![doc]);
    let response = engine
        .handle(EngineRequest::new(trellis_core::Action::Get).with_key(json!(1)))
        .await;
    assert_eq!(response.status, 410);
}

#[tokio::test]
async fn test_action_requiring_identity_is_401_for_anonymous() {
    let config_yaml = format!(
        "{}\nactions:\n  get:\n    require_identity: true\n",
        CONFIG.trim_end()
    );
    let adapter = Arc::new(MemoryAdapter::with_documents("id", vec![order()]));
    let engine = Engine::new(
        EngineConfig::from_yaml(&config_yaml).unwrap(),
        adapter,
        Arc::new(AnonymousIdentity),
        Arc::new(PermissiveGuard),
    )
    .unwrap();
    let response = engine
        .handle(EngineRequest::new(trellis_core::Action::Get).with_key(json!(1)))
        .await;
    assert_eq!(response.status, 401);
}

#[tokio::test]
async fn test_get_missing_is_404() {
    let (engine, _adapter) = engine_with(vec![order()]);
    let response = engine
        .handle(EngineRequest::new(trellis_core::Action::Get).with_key(json!(99)))
        .await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_list_wraps_items_under_fixed_key() {
    let (engine, _adapter) = engine_with(vec![order()]);
    let response = engine.handle(EngineRequest::new(trellis_core::Action::List)).await;
    assert_eq!(response.status, 200);
    let body = response.body.unwrap();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0].get("secret").is_none());
}

#[test]
fn test_build_fails_when_permits_are_missing() {
    let config = EngineConfig::from_yaml(
        r#"
resource:
  name: notes
  key: id
  columns:
    id: { kind: integer }
"#,
    )
    .unwrap();
    let adapter = Arc::new(MemoryAdapter::new("id"));
    let error = Engine::new(
        config,
        adapter,
        Arc::new(AnonymousIdentity),
        Arc::new(PermissiveGuard),
    )
    .unwrap_err();
    assert!(matches!(error, BuildError::Scope(_)));
}

#[test]
fn test_build_fails_on_unsatisfiable_demand() {
    let config = EngineConfig::from_yaml(
        r#"
resource:
  name: notes
  key: id
  columns:
    id: { kind: integer }
permits:
  read: { deny: [] }
  write: { deny: [] }
actions:
  get:
    demands: [unobtainable]
"#,
    )
    .unwrap();
    let adapter = Arc::new(MemoryAdapter::new("id"));
    let error = Engine::new(
        config,
        adapter,
        Arc::new(AnonymousIdentity),
        Arc::new(PermissiveGuard),
    )
    .unwrap_err();
    assert!(matches!(error, BuildError::Compile(_)));
}
