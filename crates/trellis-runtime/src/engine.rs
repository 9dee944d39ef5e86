//! Engine construction.
//!
//! An engine serves one resource. Building it does all the
//! configuration-shaped work exactly once: permit tables are materialized,
//! permit resolution is validated for every action and nested path, column
//! patterns are compiled, and one step pipeline is compiled and cached per
//! action. Any failure here is a [`BuildError`]; a misconfigured action is
//! never served.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use trellis_core::config::ResourceSchema;
use trellis_core::{Action, EngineConfig};
use trellis_policy::{validate_patterns, AccessScope, Permit};

use crate::adapter::{IdentityProvider, SessionGuard, StorageAdapter};
use crate::attrs;
use crate::compile::{compile, Pipeline};
use crate::error::BuildError;
use crate::runner::{self, EngineRequest, EngineResponse};
use crate::step::{Requirement, Step};
use crate::steps::standard_steps;

/// Shared collaborators handed to every step.
pub struct StepEnv {
    pub config: Arc<EngineConfig>,
    pub adapter: Arc<dyn StorageAdapter>,
    pub identity: Arc<dyn IdentityProvider>,
    pub session: Arc<dyn SessionGuard>,
}

/// A configured engine for one resource.
pub struct Engine {
    pub(crate) env: StepEnv,
    pub(crate) pool: Vec<Arc<dyn Step>>,
    pub(crate) pipelines: BTreeMap<Action, Pipeline>,
    pub(crate) permits: BTreeMap<String, Permit>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("actions", &self.pipelines.keys().collect::<Vec<_>>())
            .field("permits", &self.permits.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build with the standard step pool.
    pub fn new(
        config: EngineConfig,
        adapter: Arc<dyn StorageAdapter>,
        identity: Arc<dyn IdentityProvider>,
        session: Arc<dyn SessionGuard>,
    ) -> Result<Self, BuildError> {
        Self::with_steps(config, adapter, identity, session, Vec::new())
    }

    /// Build with additional steps appended to the standard pool. Extra
    /// steps join refinement chains after the built-in providers.
    pub fn with_steps(
        config: EngineConfig,
        adapter: Arc<dyn StorageAdapter>,
        identity: Arc<dyn IdentityProvider>,
        session: Arc<dyn SessionGuard>,
        extra_steps: Vec<Arc<dyn Step>>,
    ) -> Result<Self, BuildError> {
        config.validate()?;
        validate_patterns(&config.resource)?;

        let permits: BTreeMap<String, Permit> = config
            .permits
            .iter()
            .map(|(name, value)| (name.clone(), Permit::from(value)))
            .collect();
        for action in Action::ALL {
            let scope = AccessScope::new(action, config.fallback_chain(action));
            validate_scope(&scope, &config.resource, &permits)?;
        }

        let mut pool = standard_steps();
        pool.extend(extra_steps);
        let descriptors: Vec<_> = pool.iter().map(|step| step.descriptor().clone()).collect();
        let mut pipelines = BTreeMap::new();
        for action in Action::ALL {
            let demands = demands_for(action, &config);
            let preset = preset_for(action);
            let pipeline = compile(&descriptors, action.as_str(), &demands, &preset)?;
            pipelines.insert(action, pipeline);
        }

        Ok(Self {
            env: StepEnv {
                config: Arc::new(config),
                adapter,
                identity,
                session,
            },
            pool,
            pipelines,
            permits,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.env.config
    }

    pub fn resource_name(&self) -> &str {
        &self.env.config.resource.name
    }

    /// Handle one request end to end.
    pub async fn handle(&self, request: EngineRequest) -> EngineResponse {
        runner::run(self, request).await
    }
}

/// Every action must resolve a permit at every nested path; a gap is a
/// deployment bug and surfaces here, at build.
fn validate_scope(
    scope: &AccessScope,
    schema: &ResourceSchema,
    permits: &BTreeMap<String, Permit>,
) -> Result<(), BuildError> {
    scope.resolve(permits)?;
    for (name, relation) in &schema.relations {
        validate_scope(&scope.descend(name), &relation.resource, permits)?;
    }
    Ok(())
}

fn demands_for(action: Action, config: &EngineConfig) -> Vec<Requirement> {
    let configured = config.action(action).demands;
    if !configured.is_empty() {
        return configured
            .iter()
            .map(|spec| Requirement::parse(spec))
            .collect();
    }
    let attr = match action {
        Action::Get => attrs::GET_RESPONSE,
        Action::List => attrs::LIST_RESPONSE,
        Action::Insert => attrs::CREATE_RESPONSE,
        Action::Update => attrs::UPDATE_RESPONSE,
        Action::Delete => attrs::DELETE_RESPONSE,
    };
    vec![Requirement::of(attr)]
}

/// Attributes present in the context before any step runs.
fn preset_for(action: Action) -> BTreeSet<String> {
    let mut preset: BTreeSet<String> = [attrs::METHOD, attrs::HEADERS, attrs::QUERY]
        .iter()
        .map(|attr| attr.to_string())
        .collect();
    if matches!(action, Action::Get | Action::Update | Action::Delete) {
        preset.insert(attrs::KEY.to_string());
    }
    if matches!(action, Action::Insert | Action::Update) {
        preset.insert(attrs::BODY.to_string());
    }
    preset
}
