//! HTTP surface for Trellis resources.
//!
//! Routes `/{resource}` and `/{resource}/{key}` onto the engine's
//! actions. This layer owns content negotiation (406/415), body parsing
//! into a JSON object graph, and the mapping between engine responses and
//! HTTP responses; everything else - conditional headers, authorization,
//! reconciliation - happens inside the engine.

mod state;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tower_http::trace::TraceLayer;

use trellis_core::Action;
use trellis_runtime::{EngineRequest, EngineResponse};

pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/{resource}", get(list_resource).post(create_resource))
        .route(
            "/{resource}/{key}",
            get(get_resource).put(update_resource).delete(delete_resource),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true, "service": "trellis-server" }))
}

async fn get_resource(
    State(state): State<AppState>,
    Path((resource, key)): Path<(String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    dispatch(&state, &resource, Action::Get, Some(key), headers, query, None).await
}

async fn list_resource(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    dispatch(&state, &resource, Action::List, None, headers, query, None).await
}

async fn create_resource(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(
        &state,
        &resource,
        Action::Insert,
        None,
        headers,
        query,
        Some(body),
    )
    .await
}

async fn update_resource(
    State(state): State<AppState>,
    Path((resource, key)): Path<(String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(
        &state,
        &resource,
        Action::Update,
        Some(key),
        headers,
        query,
        Some(body),
    )
    .await
}

async fn delete_resource(
    State(state): State<AppState>,
    Path((resource, key)): Path<(String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    dispatch(
        &state,
        &resource,
        Action::Delete,
        Some(key),
        headers,
        query,
        None,
    )
    .await
}

async fn dispatch(
    state: &AppState,
    resource: &str,
    action: Action,
    key: Option<String>,
    headers: HeaderMap,
    query: BTreeMap<String, String>,
    body: Option<Bytes>,
) -> Response {
    let Some(engine) = state.engine(resource) else {
        return error_response(StatusCode::NOT_FOUND, "unknown resource");
    };
    if !acceptable(&headers) {
        return error_response(StatusCode::NOT_ACCEPTABLE, "only application/json is served");
    }

    let parsed_body = match body {
        Some(bytes) => {
            if !json_content_type(&headers) {
                return error_response(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "request bodies must be application/json",
                );
            }
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => Some(value),
                Err(_) => return error_response(StatusCode::BAD_REQUEST, "malformed JSON body"),
            }
        }
        None => None,
    };

    let mut request = EngineRequest::new(action);
    request.key = key.map(|raw| parse_key(&raw));
    request.headers = plain_headers(&headers);
    request.query = query;
    request.body = parsed_body;

    into_http(engine.handle(request).await)
}

/// Accept is satisfied by JSON or any wildcard covering it.
fn acceptable(headers: &HeaderMap) -> bool {
    match headers.get(ACCEPT).and_then(|value| value.to_str().ok()) {
        Some(accept) => {
            accept.contains("application/json")
                || accept.contains("application/*")
                || accept.contains("*/*")
        }
        None => true,
    }
}

fn json_content_type(headers: &HeaderMap) -> bool {
    match headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok()) {
        Some(content_type) => content_type
            .split(';')
            .next()
            .map(str::trim)
            .is_some_and(|essence| essence.eq_ignore_ascii_case("application/json")),
        None => true,
    }
}

fn plain_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Numeric path segments become numeric keys; everything else is opaque.
fn parse_key(raw: &str) -> Value {
    match raw.parse::<i64>() {
        Ok(number) => Value::from(number),
        Err(_) => Value::String(raw.to_string()),
    }
}

fn into_http(engine: EngineResponse) -> Response {
    let status =
        StatusCode::from_u16(engine.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = match engine.body {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    };
    for (name, value) in engine.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}
