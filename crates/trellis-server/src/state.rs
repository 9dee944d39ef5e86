use std::collections::BTreeMap;
use std::sync::Arc;

use trellis_runtime::Engine;

/// Shared server state: one engine per registered resource.
#[derive(Clone, Default)]
pub struct AppState {
    engines: Arc<BTreeMap<String, Arc<Engine>>>,
}

impl AppState {
    pub fn new(engines: impl IntoIterator<Item = Arc<Engine>>) -> Self {
        let engines = engines
            .into_iter()
            .map(|engine| (engine.resource_name().to_string(), engine))
            .collect();
        Self {
            engines: Arc::new(engines),
        }
    }

    pub fn engine(&self, resource: &str) -> Option<Arc<Engine>> {
        self.engines.get(resource).cloned()
    }
}
