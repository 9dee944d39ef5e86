//! The per-request runner.
//!
//! One run moves through: initializing, evaluating-conditionals,
//! running-steps, terminated (normally or by early exit), and
//! assembling-response. Conditional evaluation before the steps covers
//! method/header consistency (the 400 rules); validator comparisons run
//! inside the step sequence once the stored representation's fingerprint
//! exists, and may short-circuit to a prebuilt 304 via [`Flow::Stop`].
//!
//! The whole step phase sits inside one storage transaction: begin before
//! the first step; commit on normal or early-exit completion; rollback on
//! any error outcome and on 304, which must not depend on mutations.
//! Steps execute strictly sequentially and are never retried.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use trellis_core::Action;

use crate::context::RequestContext;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::step::Flow;

/// One request, as handed to [`Engine::handle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequest {
    pub action: Action,
    pub method: String,
    pub key: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl EngineRequest {
    pub fn new(action: Action) -> Self {
        let method = match action {
            Action::Get | Action::List => "GET",
            Action::Insert => "POST",
            Action::Update => "PUT",
            Action::Delete => "DELETE",
        };
        Self {
            action,
            method: method.to_string(),
            key: None,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_key(mut self, key: Value) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }
}

/// The assembled response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl EngineResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Normal,
    Early,
}

pub(crate) async fn run(engine: &Engine, request: EngineRequest) -> EngineResponse {
    let action = request.action;
    let Some(pipeline) = engine.pipelines.get(&action) else {
        // Pipelines exist for every action by construction.
        return failure(&EngineError::Storage(anyhow::anyhow!(
            "no pipeline for action '{}'",
            action
        )));
    };

    // initializing
    let mut cx = RequestContext::new(request, engine.permits.clone());
    tracing::debug!(request_id = %cx.request_id, action = %cx.action, "request accepted");

    // evaluating-conditionals: header consistency before any work
    if let Err(error) = conditional_consistency(&cx) {
        tracing::debug!(request_id = %cx.request_id, %error, "conditional headers rejected");
        return failure(&error);
    }

    if let Err(error) = engine.env.adapter.begin().await {
        return failure(&EngineError::Storage(error));
    }

    // running-steps
    let mut outcome: Result<Termination, EngineError> = Ok(Termination::Normal);
    for &index in &pipeline.steps {
        let step = &engine.pool[index];
        tracing::debug!(request_id = %cx.request_id, step = %step.descriptor().name, "running step");
        match step.run(&mut cx, &engine.env).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => {
                outcome = Ok(Termination::Early);
                break;
            }
            Err(error) => {
                outcome = Err(error);
                break;
            }
        }
    }

    // assembling-response
    let response = match &outcome {
        Ok(termination) => {
            tracing::debug!(
                request_id = %cx.request_id,
                early = *termination == Termination::Early,
                status = cx.status.unwrap_or(200),
                "steps terminated"
            );
            EngineResponse {
                status: cx.status.unwrap_or(200),
                headers: cx.response_headers.clone(),
                body: cx.response_body.clone(),
            }
        }
        Err(error) => {
            if error.status() >= 500 {
                tracing::error!(request_id = %cx.request_id, %error, "request failed");
            } else {
                tracing::debug!(request_id = %cx.request_id, %error, "request rejected");
            }
            failure(error)
        }
    };

    // Transaction boundary: 304 and all error statuses roll back.
    let rollback = response.status >= 400 || response.status == 304;
    let boundary = if rollback {
        engine.env.adapter.rollback().await
    } else {
        engine.env.adapter.commit().await
    };
    if let Err(error) = boundary {
        tracing::error!(request_id = %cx.request_id, %error, "transaction boundary failed");
        if !rollback {
            return failure(&EngineError::Storage(error));
        }
    }

    response
}

/// The 400 rules: `If-None-Match` and `If-Modified-Since` are rejected on
/// PUT/DELETE outright. Required-header rules need the stored validator
/// and are evaluated in the precondition step.
fn conditional_consistency(cx: &RequestContext) -> Result<(), EngineError> {
    if matches!(cx.action, Action::Update | Action::Delete) {
        if cx.preconditions.if_none_match.is_some() {
            return Err(EngineError::BadConditional(format!(
                "If-None-Match is not allowed for {}",
                cx.method
            )));
        }
        if cx.preconditions.if_modified_since.is_some() {
            return Err(EngineError::BadConditional(format!(
                "If-Modified-Since is not allowed for {}",
                cx.method
            )));
        }
    }
    Ok(())
}

fn failure(error: &EngineError) -> EngineResponse {
    EngineResponse {
        status: error.status(),
        headers: Vec::new(),
        body: Some(error.body()),
    }
}
