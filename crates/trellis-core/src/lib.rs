//! Shared types and configuration for the Trellis resource engine.
//!
//! This crate holds everything the other Trellis crates agree on:
//! - [`Action`]: the unit for which a step sequence and permit fallback
//!   chain are configured (get/list/insert/update/delete)
//! - [`config`]: YAML-loadable engine configuration (resource schema,
//!   per-action settings, permit table, cache headers)
//! - [`value`]: column-kind aware value coercion and equality

pub mod config;
pub mod value;

mod action;

pub use action::Action;
pub use config::{
    ActionConfig, CacheConfig, ColumnKind, ColumnSpec, ConfigError, EngineConfig, PermitConfig,
    RelationSpec, ResourceSchema,
};
