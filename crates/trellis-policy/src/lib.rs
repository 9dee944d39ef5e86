//! Authorization and reconciliation for the Trellis resource engine.
//!
//! Three layers build on each other:
//!
//! 1. [`Permit`] - immutable allow/deny rule values over column names, with
//!    set algebra (intersect, union, subtract)
//! 2. [`AccessScope`] - resolves, per action and nested path, which permit
//!    governs column access, via a prefix + fallback-name probe
//! 3. [`Reconciler`] - diffs a submitted object graph against stored state
//!    into a typed change tree, applying column authorization at each level

mod permit;
mod reconcile;
mod rules;
mod scope;

pub use permit::Permit;
pub use reconcile::{ChangeList, ChangeNode, ChangeStatus, Reconciler, DELETE_MARKER};
pub use rules::{check_column_rules, validate_patterns};
pub use scope::{AccessScope, PermitSource, ScopeError, PATH_SEPARATOR};
