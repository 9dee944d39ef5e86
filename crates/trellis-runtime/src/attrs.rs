//! Context attribute names.
//!
//! Attribute names are declarative metadata: steps name what they read and
//! write, and the compiler resolves the dependency graph over these names
//! before any request is served. At run time the values live in typed slots
//! on [`crate::RequestContext`].

// Preset by the runner at request initialization.
pub const METHOD: &str = "method";
pub const HEADERS: &str = "headers";
pub const QUERY: &str = "query";
pub const KEY: &str = "key";
pub const BODY: &str = "body";

// Produced by built-in steps.
pub const IDENTITY: &str = "identity";
pub const SESSION_OK: &str = "session_ok";
pub const SUBMITTED: &str = "submitted";
pub const ITEM: &str = "item";
pub const MODIFIED_AT: &str = "modified_at";
pub const COLLECTION: &str = "collection";
pub const OUTPUT: &str = "output";
pub const LIST_OUTPUT: &str = "list_output";
pub const ETAG: &str = "etag";
pub const PRECONDITION_OK: &str = "precondition_ok";
pub const CHANGES: &str = "changes";
pub const CREATE_CHANGES: &str = "create_changes";
pub const APPLIED: &str = "applied";
pub const CREATED: &str = "created";
pub const CREATED_STATE: &str = "created_state";
pub const DELETED: &str = "deleted";

// Terminal attributes, one per action.
pub const GET_RESPONSE: &str = "get_response";
pub const LIST_RESPONSE: &str = "list_response";
pub const UPDATE_RESPONSE: &str = "update_response";
pub const CREATE_RESPONSE: &str = "create_response";
pub const DELETE_RESPONSE: &str = "delete_response";
