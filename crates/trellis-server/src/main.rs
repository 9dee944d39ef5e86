use std::sync::Arc;

use trellis_core::EngineConfig;
use trellis_runtime::{Engine, HeaderIdentity, MemoryAdapter, PermissiveGuard};
use trellis_server::{router, AppState};

/// Built-in demo resource, served when no configuration file is given.
const DEMO_CONFIG: &str = r#"
resource:
  name: orders
  key: id
  modified_column: updated_at
  columns:
    id: { kind: integer }
    status: { kind: text, values: [open, shipped, closed] }
    total: { kind: float }
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
  read: { deny: [] }
  write: { deny: [updated_at] }
  "items.read": { deny: [] }
  "items.write": { deny: [] }
cache:
  cache_control: "private, max-age=0"
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::from_yaml(DEMO_CONFIG)?,
    };
    let key_column = config.resource.key.clone();
    let adapter = Arc::new(MemoryAdapter::new(&key_column));
    let engine = Arc::new(Engine::new(
        config,
        adapter,
        Arc::new(HeaderIdentity),
        Arc::new(PermissiveGuard),
    )?);

    let app = router(AppState::new([engine]));

    let addr = "0.0.0.0:8080";
    tracing::info!("trellis-server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
