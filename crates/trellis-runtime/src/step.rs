//! Step descriptors and the step trait.
//!
//! A step is a named unit of request processing. Its descriptor declares
//! the context attributes it requires and produces; those declarations are
//! the per-step read/write contract, and the compiler resolves execution
//! order from them. Descriptors are built once per engine configuration
//! and never per request.

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::engine::StepEnv;
use crate::error::EngineError;

/// One required context attribute, with an optional depth qualifier.
///
/// Several steps may provide the same attribute, forming a refinement
/// chain in pool registration order. Depth `d` demands chain members
/// `0..=d`; plain requirements are depth 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub attr: String,
    pub depth: usize,
}

impl Requirement {
    pub fn of(attr: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            depth: 0,
        }
    }

    pub fn refined(attr: impl Into<String>, depth: usize) -> Self {
        Self {
            attr: attr.into(),
            depth,
        }
    }

    /// Parse `"attr"` or `"attr@depth"`.
    pub fn parse(spec: &str) -> Self {
        match spec.split_once('@') {
            Some((attr, depth)) => match depth.parse() {
                Ok(depth) => Self::refined(attr, depth),
                Err(_) => Self::of(spec),
            },
            None => Self::of(spec),
        }
    }

    /// Display form: `attr` or `attr@depth`.
    pub fn label(&self) -> String {
        if self.depth == 0 {
            self.attr.clone()
        } else {
            format!("{}@{}", self.attr, self.depth)
        }
    }
}

/// Declared shape of one step.
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    /// Step name, for diagnostics and compile errors.
    pub name: String,

    /// Context attributes this step reads.
    pub requires: Vec<Requirement>,

    /// Context attributes this step writes.
    pub provides: Vec<String>,

    /// Coarse ordering tag: milestones execute in ascending order and
    /// break ties among dependency-independent steps. They never override
    /// a hard dependency.
    pub milestone: i32,

    /// A conditional step is only scheduled when its outputs are not
    /// already guaranteed by earlier configuration, letting a cheaper step
    /// pre-empt a more expensive one computing the same attribute.
    pub conditional: bool,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: Vec::new(),
            provides: Vec::new(),
            milestone: 0,
            conditional: false,
        }
    }

    pub fn requires(mut self, attr: &str) -> Self {
        self.requires.push(Requirement::of(attr));
        self
    }

    pub fn requires_refined(mut self, attr: &str, depth: usize) -> Self {
        self.requires.push(Requirement::refined(attr, depth));
        self
    }

    pub fn provides(mut self, attr: &str) -> Self {
        self.provides.push(attr.to_string());
        self
    }

    pub fn milestone(mut self, milestone: i32) -> Self {
        self.milestone = milestone;
        self
    }

    pub fn conditional(mut self) -> Self {
        self.conditional = true;
        self
    }
}

/// Outcome of one step execution.
///
/// `Stop` aborts the remaining steps while preserving everything already
/// written to the context; the runner proceeds straight to response
/// assembly. This is the explicit early-exit signal - steps do not abort
/// the loop by raising.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// A unit of request processing.
#[async_trait]
pub trait Step: Send + Sync {
    fn descriptor(&self) -> &StepDescriptor;

    async fn run(&self, cx: &mut RequestContext, env: &StepEnv) -> Result<Flow, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirement_parse() {
        assert_eq!(Requirement::parse("output"), Requirement::of("output"));
        assert_eq!(Requirement::parse("output@2"), Requirement::refined("output", 2));
        assert_eq!(Requirement::parse("output@2").label(), "output@2");
    }
}
