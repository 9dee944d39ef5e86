//! Engine error taxonomy.
//!
//! [`BuildError`] covers everything configuration-shaped: it is raised at
//! engine build and prevents the action from ever being served.
//! [`EngineError`] covers per-request outcomes; every variant maps to one
//! HTTP status, and every error outcome rolls back the storage
//! transaction. Nothing is retried.

use serde_json::{json, Map, Value};

use trellis_core::ConfigError;
use trellis_policy::ScopeError;

use crate::compile::CompileError;

/// Raised at engine build time; fatal to the configuration.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Scope(#[from] ScopeError),
}

/// Raised while handling one request.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("resource not found")]
    NotFound,

    #[error("resource is gone")]
    Gone,

    #[error("multiple rows matched a unique key")]
    Ambiguous,

    #[error("precondition failed")]
    PreconditionFailed,

    /// A conditional header is missing or not allowed for the method.
    #[error("{0}")]
    BadConditional(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("request is not permitted")]
    Forbidden,

    /// Reconciliation produced a wholly unchanged tree for an update.
    #[error("no change")]
    NoChange {
        errors: Option<Value>,
        revised: Option<Value>,
    },

    /// The submission is invalid at the root; nothing was applied.
    #[error("validation failed")]
    Invalid {
        errors: Option<Value>,
        revised: Option<Value>,
    },

    /// Missing permit attribute observed at request time. Build-time
    /// validation makes this unreachable for built-in paths; custom steps
    /// can still surface it.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn status(&self) -> u16 {
        match self {
            EngineError::NotFound => 404,
            EngineError::Gone => 410,
            EngineError::Ambiguous => 500,
            EngineError::PreconditionFailed => 412,
            EngineError::BadConditional(_) | EngineError::BadRequest(_) => 400,
            EngineError::Unauthorized => 401,
            EngineError::Forbidden => 403,
            EngineError::NoChange { .. } => 409,
            EngineError::Invalid { .. } => 400,
            EngineError::Scope(_) | EngineError::Storage(_) => 500,
        }
    }

    /// The response body: `{message}`, or `{errors, revised}` trees
    /// mirroring the change-node shape with empty branches pruned.
    pub fn body(&self) -> Value {
        match self {
            EngineError::NoChange { errors, revised } => {
                let mut body = Map::new();
                body.insert("message".to_string(), json!("No change"));
                if let Some(errors) = errors {
                    body.insert("errors".to_string(), errors.clone());
                }
                if let Some(revised) = revised {
                    body.insert("revised".to_string(), revised.clone());
                }
                Value::Object(body)
            }
            EngineError::Invalid { errors, revised } => {
                let mut body = Map::new();
                if let Some(errors) = errors {
                    body.insert("errors".to_string(), errors.clone());
                }
                if let Some(revised) = revised {
                    body.insert("revised".to_string(), revised.clone());
                }
                Value::Object(body)
            }
            EngineError::Scope(_) | EngineError::Storage(_) => {
                // Internal detail stays in the log, not the response.
                json!({ "message": "internal error" })
            }
            other => json!({ "message": other.to_string() }),
        }
    }
}
