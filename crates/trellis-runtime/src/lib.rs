//! The Trellis request-processing engine.
//!
//! Given a named action (get/list/insert/update/delete), the engine:
//!
//! 1. resolves, from a pool of steps with declared input/output attributes,
//!    the exact ordered subset needed to satisfy that action (once, at
//!    engine build - see [`compile`])
//! 2. runs the compiled sequence against a mutable per-request
//!    [`context::RequestContext`] under HTTP conditional-request rules
//!    (see [`conditional`])
//! 3. applies column-level authorization and change-tree reconciliation
//!    through the built-in steps (see [`steps`])
//!
//! Everything configuration-shaped fails at engine build, never at request
//! time: unsatisfiable step dependencies, missing permit attributes, and
//! malformed column patterns all surface as [`error::BuildError`].

pub mod adapter;
pub mod attrs;
pub mod compile;
pub mod conditional;
pub mod context;
pub mod engine;
pub mod error;
pub mod memory;
pub mod runner;
pub mod step;
pub mod steps;

pub use adapter::{
    AnonymousIdentity, ApplyCall, ApplyParent, FetchOutcome, HeaderIdentity, IdentityProvider,
    PermissiveGuard, SessionGuard, StorageAdapter,
};
pub use compile::{compile, CompileError, Pipeline};
pub use context::{Identity, RequestContext};
pub use engine::{Engine, StepEnv};
pub use error::{BuildError, EngineError};
pub use memory::MemoryAdapter;
pub use runner::{EngineRequest, EngineResponse};
pub use step::{Flow, Requirement, Step, StepDescriptor};
