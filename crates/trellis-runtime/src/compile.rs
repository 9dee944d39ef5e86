//! Pipeline compilation.
//!
//! Turns a pool of step descriptors plus one action's demanded outputs
//! into a single ordered, deduplicated execution sequence. Compilation
//! happens once per action at engine build; an unsatisfiable requirement
//! is a configuration error and the action is never served.
//!
//! Resolution is a depth-first worklist over attribute names: each
//! demanded attribute is traced to a providing step, whose own
//! requirements join the worklist unless already satisfied. The final
//! order is a deterministic topological sort where milestone tags break
//! ties among dependency-independent steps.

use std::collections::{BTreeMap, BTreeSet};

use crate::step::{Requirement, StepDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("no step provides attribute '{attribute}' demanded for action '{action}'")]
    Unsatisfied { attribute: String, action: String },

    #[error("dependency cycle through step '{step}' while compiling action '{action}'")]
    Cycle { step: String, action: String },
}

/// A compiled execution sequence: indices into the step pool, in order.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub steps: Vec<usize>,
}

/// Compile the step sequence for one action.
///
/// `preset` names the attributes present in the context before any step
/// runs (method, headers, the routed key, the raw body).
pub fn compile(
    pool: &[StepDescriptor],
    action: &str,
    demands: &[Requirement],
    preset: &BTreeSet<String>,
) -> Result<Pipeline, CompileError> {
    let mut providers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, step) in pool.iter().enumerate() {
        for attr in &step.provides {
            providers.entry(attr.as_str()).or_default().push(index);
        }
    }

    let mut compiler = Compiler {
        pool,
        action,
        preset,
        providers,
        scheduled: BTreeSet::new(),
        discovery: Vec::new(),
        visiting: BTreeSet::new(),
        deps: BTreeMap::new(),
    };

    for demand in demands {
        compiler.require(demand, None)?;
    }

    let sequence = compiler.order()?;
    tracing::debug!(
        action,
        steps = ?sequence.iter().map(|&i| pool[i].name.as_str()).collect::<Vec<_>>(),
        "compiled pipeline"
    );
    let unused: Vec<&str> = (0..pool.len())
        .filter(|i| !compiler.scheduled.contains(i))
        .map(|i| pool[i].name.as_str())
        .collect();
    if !unused.is_empty() {
        tracing::debug!(action, ?unused, "steps not needed for action");
    }

    Ok(Pipeline { steps: sequence })
}

struct Compiler<'a> {
    pool: &'a [StepDescriptor],
    action: &'a str,
    preset: &'a BTreeSet<String>,
    providers: BTreeMap<&'a str, Vec<usize>>,
    scheduled: BTreeSet<usize>,
    /// Scheduling order of discovery; the secondary sort key.
    discovery: Vec<usize>,
    visiting: BTreeSet<usize>,
    /// Hard dependency edges: step -> steps that must run before it.
    deps: BTreeMap<usize, BTreeSet<usize>>,
}

impl<'a> Compiler<'a> {
    /// Satisfy one requirement, scheduling providers as needed.
    /// `dependent` is the step that raised the requirement, if any.
    fn require(
        &mut self,
        requirement: &Requirement,
        dependent: Option<usize>,
    ) -> Result<(), CompileError> {
        // Preset attributes are fully refined inputs; nothing to schedule.
        if self.preset.contains(&requirement.attr) {
            return Ok(());
        }

        let chain = self
            .providers
            .get(requirement.attr.as_str())
            .cloned()
            .ok_or_else(|| CompileError::Unsatisfied {
                attribute: requirement.label(),
                action: self.action.to_string(),
            })?;
        if chain.len() <= requirement.depth {
            return Err(CompileError::Unsatisfied {
                attribute: requirement.label(),
                action: self.action.to_string(),
            });
        }

        // A plain requirement is satisfied by any already-scheduled
        // provider; only the ordering edge is still needed. Refined
        // requirements pin the chain prefix explicitly.
        if requirement.depth == 0 {
            let existing: Vec<usize> = chain
                .iter()
                .copied()
                .filter(|index| self.scheduled.contains(index))
                .collect();
            if !existing.is_empty() {
                if let Some(dependent) = dependent {
                    for provider in existing {
                        self.deps.entry(dependent).or_default().insert(provider);
                    }
                }
                return Ok(());
            }
        }

        for position in 0..=requirement.depth {
            self.ensure(chain[position])?;
            // Refinement chains run in registration order.
            if position > 0
                && self.scheduled.contains(&chain[position])
                && self.scheduled.contains(&chain[position - 1])
            {
                self.deps
                    .entry(chain[position])
                    .or_default()
                    .insert(chain[position - 1]);
            }
        }

        if let Some(dependent) = dependent {
            for position in 0..=requirement.depth {
                if self.scheduled.contains(&chain[position]) {
                    self.deps
                        .entry(dependent)
                        .or_default()
                        .insert(chain[position]);
                }
            }
        }

        Ok(())
    }

    /// Schedule a step (exactly once), resolving its requirements first.
    fn ensure(&mut self, index: usize) -> Result<(), CompileError> {
        if self.scheduled.contains(&index) {
            return Ok(());
        }
        let step = &self.pool[index];
        if step.conditional && step.provides.iter().all(|attr| self.guaranteed(attr)) {
            tracing::debug!(
                action = self.action,
                step = step.name.as_str(),
                "conditional step pre-empted"
            );
            return Ok(());
        }
        if self.visiting.contains(&index) {
            return Err(CompileError::Cycle {
                step: step.name.clone(),
                action: self.action.to_string(),
            });
        }
        self.visiting.insert(index);
        for requirement in &self.pool[index].requires.clone() {
            self.require(requirement, Some(index))?;
        }
        self.visiting.remove(&index);
        self.scheduled.insert(index);
        self.discovery.push(index);
        Ok(())
    }

    /// Whether an attribute is already guaranteed present.
    fn guaranteed(&self, attr: &str) -> bool {
        self.preset.contains(attr)
            || self
                .scheduled
                .iter()
                .any(|&i| self.pool[i].provides.iter().any(|a| a == attr))
    }

    /// Deterministic topological order: among ready steps, the lowest
    /// (milestone, discovery rank) runs first. Dependencies always win
    /// over milestones.
    fn order(&self) -> Result<Vec<usize>, CompileError> {
        let rank: BTreeMap<usize, usize> = self
            .discovery
            .iter()
            .enumerate()
            .map(|(rank, &index)| (index, rank))
            .collect();
        let mut placed: BTreeSet<usize> = BTreeSet::new();
        let mut sequence = Vec::with_capacity(self.discovery.len());
        while sequence.len() < self.discovery.len() {
            let next = self
                .discovery
                .iter()
                .copied()
                .filter(|index| !placed.contains(index))
                .filter(|index| {
                    self.deps
                        .get(index)
                        .is_none_or(|deps| deps.iter().all(|dep| placed.contains(dep)))
                })
                .min_by_key(|index| (self.pool[*index].milestone, rank[index]));
            match next {
                Some(index) => {
                    placed.insert(index);
                    sequence.push(index);
                }
                None => {
                    let stuck = self
                        .discovery
                        .iter()
                        .find(|index| !placed.contains(index))
                        .copied()
                        .unwrap_or(0);
                    return Err(CompileError::Cycle {
                        step: self.pool[stuck].name.clone(),
                        action: self.action.to_string(),
                    });
                }
            }
        }
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> StepDescriptor {
        StepDescriptor::new(name)
    }

    fn names(pool: &[StepDescriptor], pipeline: &Pipeline) -> Vec<String> {
        pipeline
            .steps
            .iter()
            .map(|&i| pool[i].name.clone())
            .collect()
    }

    /// Every required attribute of a scheduled step is produced by an
    /// earlier step or preset.
    fn assert_well_ordered(pool: &[StepDescriptor], pipeline: &Pipeline, preset: &BTreeSet<String>) {
        let mut available: BTreeSet<String> = preset.clone();
        for &index in &pipeline.steps {
            for requirement in &pool[index].requires {
                assert!(
                    available.contains(&requirement.attr),
                    "step '{}' runs before its requirement '{}' is available",
                    pool[index].name,
                    requirement.attr
                );
            }
            for attr in &pool[index].provides {
                available.insert(attr.clone());
            }
        }
    }

    #[test]
    fn test_linear_chain() {
        let pool = vec![
            step("c").requires("b").provides("out"),
            step("a").provides("x"),
            step("b").requires("x").provides("b"),
        ];
        let preset = BTreeSet::new();
        let pipeline = compile(&pool, "get", &[Requirement::of("out")], &preset).unwrap();
        assert_eq!(names(&pool, &pipeline), vec!["a", "b", "c"]);
        assert_well_ordered(&pool, &pipeline, &preset);
    }

    #[test]
    fn test_diamond_schedules_shared_step_once() {
        let pool = vec![
            step("base").provides("x"),
            step("left").requires("x").provides("y"),
            step("right").requires("x").provides("z"),
            step("top").requires("y").requires("z").provides("out"),
        ];
        let preset = BTreeSet::new();
        let pipeline = compile(&pool, "get", &[Requirement::of("out")], &preset).unwrap();
        assert_eq!(pipeline.steps.len(), 4);
        assert_eq!(
            pipeline.steps.iter().filter(|&&i| i == 0).count(),
            1,
            "shared step scheduled twice"
        );
        assert_well_ordered(&pool, &pipeline, &preset);
    }

    #[test]
    fn test_unsatisfied_requirement_fails_compilation() {
        let pool = vec![step("a").requires("missing").provides("out")];
        let err = compile(&pool, "update", &[Requirement::of("out")], &BTreeSet::new()).unwrap_err();
        match err {
            CompileError::Unsatisfied { attribute, action } => {
                assert_eq!(attribute, "missing");
                assert_eq!(action, "update");
            }
            other => panic!("expected Unsatisfied, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_fails_compilation() {
        let pool = vec![
            step("a").requires("b").provides("a"),
            step("b").requires("a").provides("b"),
        ];
        let err = compile(&pool, "get", &[Requirement::of("a")], &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, CompileError::Cycle { .. }));
    }

    #[test]
    fn test_preset_attributes_need_no_provider() {
        let pool = vec![step("a").requires("key").provides("out")];
        let preset = BTreeSet::from(["key".to_string()]);
        let pipeline = compile(&pool, "get", &[Requirement::of("out")], &preset).unwrap();
        assert_eq!(pipeline.steps, vec![0]);
    }

    #[test]
    fn test_milestones_break_ties_between_independent_steps() {
        let pool = vec![
            step("late").provides("x").milestone(50),
            step("early").provides("y").milestone(10),
            step("top").requires("x").requires("y").provides("out").milestone(60),
        ];
        let preset = BTreeSet::new();
        let pipeline = compile(&pool, "get", &[Requirement::of("out")], &preset).unwrap();
        assert_eq!(names(&pool, &pipeline), vec!["early", "late", "top"]);
    }

    #[test]
    fn test_dependencies_override_milestones() {
        // The provider carries a later milestone than its dependent; the
        // hard dependency still places it first.
        let pool = vec![
            step("provider").provides("x").milestone(50),
            step("dependent").requires("x").provides("out").milestone(10),
        ];
        let preset = BTreeSet::new();
        let pipeline = compile(&pool, "get", &[Requirement::of("out")], &preset).unwrap();
        assert_eq!(names(&pool, &pipeline), vec!["provider", "dependent"]);
    }

    #[test]
    fn test_conditional_step_preempted_by_earlier_provider() {
        let pool = vec![
            step("setup").provides("x").provides("y"),
            step("expensive").provides("x").conditional(),
        ];
        let preset = BTreeSet::new();
        // "y" forces setup first; the conditional provider of "x" is then
        // pre-empted.
        let pipeline = compile(
            &pool,
            "get",
            &[Requirement::of("y"), Requirement::of("x")],
            &preset,
        )
        .unwrap();
        assert_eq!(names(&pool, &pipeline), vec!["setup"]);
    }

    #[test]
    fn test_conditional_step_runs_when_output_not_guaranteed() {
        let pool = vec![step("only").provides("x").conditional()];
        let pipeline = compile(&pool, "get", &[Requirement::of("x")], &BTreeSet::new()).unwrap();
        assert_eq!(pipeline.steps, vec![0]);
    }

    #[test]
    fn test_refinement_chain_depth() {
        let pool = vec![
            step("render").requires("item").provides("view"),
            step("refresh").requires("applied").provides("view"),
            step("supply_item").provides("item"),
            step("supply_applied").provides("applied"),
        ];
        let preset = BTreeSet::new();

        // Depth 0: only the first provider in the chain.
        let shallow = compile(&pool, "get", &[Requirement::of("view")], &preset).unwrap();
        assert_eq!(names(&pool, &shallow), vec!["supply_item", "render"]);

        // Depth 1: both providers, in registration order.
        let deep = compile(&pool, "update", &[Requirement::refined("view", 1)], &preset).unwrap();
        let order = names(&pool, &deep);
        let render = order.iter().position(|n| n == "render").unwrap();
        let refresh = order.iter().position(|n| n == "refresh").unwrap();
        assert!(render < refresh);
    }

    #[test]
    fn test_refinement_depth_exceeding_chain_fails() {
        let pool = vec![step("render").provides("view")];
        let err = compile(
            &pool,
            "update",
            &[Requirement::refined("view", 1)],
            &BTreeSet::new(),
        )
        .unwrap_err();
        match err {
            CompileError::Unsatisfied { attribute, .. } => assert_eq!(attribute, "view@1"),
            other => panic!("expected Unsatisfied, got {other:?}"),
        }
    }
}
