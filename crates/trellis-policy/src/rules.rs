//! Column value rules: regex patterns and enumerated values.
//!
//! Rules live on the column specification and apply to values about to be
//! written. Violations are reported as plain messages for the per-column
//! error accumulator; they never abort a whole node.

use serde_json::Value;

use trellis_core::config::{ColumnSpec, ConfigError, ResourceSchema};

/// Check a candidate value against a column's pattern/values rules.
pub fn check_column_rules(column: &str, spec: &ColumnSpec, value: &Value) -> Result<(), String> {
    if let Some(pattern) = &spec.pattern {
        if let Some(s) = value.as_str() {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        return Err(format!(
                            "value for '{}' does not match required pattern {}",
                            column, pattern
                        ));
                    }
                }
                Err(_) => {
                    tracing::warn!("invalid regex pattern for column {}: {}", column, pattern);
                }
            }
        }
    }

    if let Some(allowed) = &spec.values {
        if !value.is_null() && !allowed.contains(value) {
            return Err(format!("value for '{}' is not in the allowed values", column));
        }
    }

    Ok(())
}

/// Compile every pattern in a schema tree, so malformed patterns surface at
/// engine build instead of being skipped per request.
pub fn validate_patterns(schema: &ResourceSchema) -> Result<(), ConfigError> {
    for (column, spec) in &schema.columns {
        if let Some(pattern) = &spec.pattern {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Config(format!(
                    "resource '{}': column '{}' pattern does not compile: {}",
                    schema.name, column, e
                ))
            })?;
        }
    }
    for relation in schema.relations.values() {
        validate_patterns(&relation.resource)?;
    }
    Ok(())
}
