//! Conditional-request evaluation and content fingerprints.
//!
//! The fingerprint (ETag) is a strong validator: a SHA-256 of the
//! serialized, authorization-filtered output actually being returned,
//! never of raw stored state. Two callers with different column visibility
//! therefore never observe each other's cache behavior.
//!
//! Decision rules follow RFC 2616/7232 semantics:
//! - GET: a failed `If-Match`/`If-Unmodified-Since` is 412; an
//!   `If-None-Match` hit, or a non-modification under `If-Modified-Since`
//!   when `If-None-Match` is absent, is 304.
//! - PUT/DELETE: `If-Match` is required, and `If-Unmodified-Since` too
//!   when the resource tracks a modification time; `If-None-Match` and
//!   `If-Modified-Since` are rejected outright (400, handled by the
//!   runner). A stale date or validator mismatch is 412.
//! - Invalid HTTP-dates are ignored, per the RFC.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One entity tag from an `If-Match`/`If-None-Match` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTag {
    pub opaque: String,
    pub weak: bool,
}

/// The value of an `If-Match`/`If-None-Match` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validators {
    Any,
    Tags(Vec<EntityTag>),
}

impl Validators {
    /// Strong comparison: weak tags never match.
    fn matches_strong(&self, etag: &str) -> bool {
        match self {
            Validators::Any => true,
            Validators::Tags(tags) => tags.iter().any(|t| !t.weak && t.opaque == etag),
        }
    }

    /// Weak comparison: the weakness flag is ignored.
    fn matches_weak(&self, etag: &str) -> bool {
        match self {
            Validators::Any => true,
            Validators::Tags(tags) => tags.iter().any(|t| t.opaque == etag),
        }
    }
}

/// Parsed conditional headers of one request.
#[derive(Debug, Clone, Default)]
pub struct Preconditions {
    pub if_match: Option<Validators>,
    pub if_none_match: Option<Validators>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

/// Outcome of evaluating a GET's conditional headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetCheck {
    Proceed,
    NotModified,
    Failed,
}

/// Outcome of evaluating a PUT/DELETE's conditional headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCheck {
    Proceed,
    /// A required conditional header is absent.
    Missing(&'static str),
    Failed,
}

impl Preconditions {
    /// Parse from lowercased header names. Malformed dates are ignored.
    pub fn from_headers(headers: &BTreeMap<String, String>) -> Self {
        let date = |name: &str| {
            headers.get(name).and_then(|raw| {
                let parsed = parse_http_date(raw);
                if parsed.is_none() {
                    tracing::warn!(header = name, value = raw.as_str(), "ignoring malformed HTTP-date");
                }
                parsed
            })
        };
        Self {
            if_match: headers.get("if-match").map(|raw| parse_validators(raw)),
            if_none_match: headers.get("if-none-match").map(|raw| parse_validators(raw)),
            if_modified_since: date("if-modified-since"),
            if_unmodified_since: date("if-unmodified-since"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_match.is_none()
            && self.if_none_match.is_none()
            && self.if_modified_since.is_none()
            && self.if_unmodified_since.is_none()
    }

    /// Evaluate for a GET against the current validator and modification
    /// time. `If-None-Match` takes precedence over `If-Modified-Since`.
    pub fn evaluate_get(&self, etag: &str, modified: Option<DateTime<Utc>>) -> GetCheck {
        if let Some(if_match) = &self.if_match {
            if !if_match.matches_strong(etag) {
                return GetCheck::Failed;
            }
        }
        if let (Some(limit), Some(modified)) = (self.if_unmodified_since, modified) {
            if modified.timestamp() > limit.timestamp() {
                return GetCheck::Failed;
            }
        }
        if let Some(if_none_match) = &self.if_none_match {
            return if if_none_match.matches_weak(etag) {
                GetCheck::NotModified
            } else {
                GetCheck::Proceed
            };
        }
        if let (Some(since), Some(modified)) = (self.if_modified_since, modified) {
            if modified.timestamp() <= since.timestamp() {
                return GetCheck::NotModified;
            }
        }
        GetCheck::Proceed
    }

    /// Evaluate for a PUT/DELETE. `If-Unmodified-Since` is only required
    /// when the resource tracks a modification time (`modified` is set).
    pub fn evaluate_write(&self, etag: &str, modified: Option<DateTime<Utc>>) -> WriteCheck {
        let Some(if_match) = &self.if_match else {
            return WriteCheck::Missing("If-Match");
        };
        if !if_match.matches_strong(etag) {
            return WriteCheck::Failed;
        }
        if let Some(modified) = modified {
            let Some(limit) = self.if_unmodified_since else {
                return WriteCheck::Missing("If-Unmodified-Since");
            };
            if modified.timestamp() > limit.timestamp() {
                return WriteCheck::Failed;
            }
        }
        WriteCheck::Proceed
    }
}

/// Strong validator of a serialized value: lowercase hex SHA-256.
pub fn etag_for(value: &Value) -> String {
    let serialized = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Quote an opaque tag for the `ETag` header.
pub fn quote_etag(tag: &str) -> String {
    format!("\"{}\"", tag)
}

/// RFC 1123 format, as required for `Last-Modified` and `Expires`.
pub fn format_http_date(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_validators(raw: &str) -> Validators {
    if raw.trim() == "*" {
        return Validators::Any;
    }
    let tags = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (weak, rest) = match part.strip_prefix("W/") {
                Some(rest) => (true, rest),
                None => (false, part),
            };
            EntityTag {
                opaque: rest.trim_matches('"').to_string(),
                weak,
            }
        })
        .collect();
    Validators::Tags(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn modified() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_etag_is_stable_and_visibility_sensitive() {
        let a = json!({"id": 1, "name": "x"});
        assert_eq!(etag_for(&a), etag_for(&a.clone()));
        let b = json!({"id": 1});
        assert_ne!(etag_for(&a), etag_for(&b));
    }

    #[test]
    fn test_if_none_match_hit_is_not_modified() {
        let etag = etag_for(&json!({"id": 1}));
        let pre = Preconditions::from_headers(&headers(&[(
            "if-none-match",
            &quote_etag(&etag),
        )]));
        assert_eq!(pre.evaluate_get(&etag, None), GetCheck::NotModified);
    }

    #[test]
    fn test_if_none_match_miss_proceeds_even_when_ims_satisfied() {
        let pre = Preconditions::from_headers(&headers(&[
            ("if-none-match", "\"other\""),
            ("if-modified-since", "Sun, 01 Mar 2026 12:00:00 GMT"),
        ]));
        assert_eq!(pre.evaluate_get("current", Some(modified())), GetCheck::Proceed);
    }

    #[test]
    fn test_if_modified_since_alone_yields_not_modified() {
        let pre = Preconditions::from_headers(&headers(&[(
            "if-modified-since",
            "Sun, 01 Mar 2026 12:00:00 GMT",
        )]));
        assert_eq!(
            pre.evaluate_get("tag", Some(modified())),
            GetCheck::NotModified
        );
    }

    #[test]
    fn test_failed_if_match_beats_not_modified() {
        let pre = Preconditions::from_headers(&headers(&[
            ("if-match", "\"stale\""),
            ("if-none-match", "\"tag\""),
        ]));
        assert_eq!(pre.evaluate_get("tag", None), GetCheck::Failed);
    }

    #[test]
    fn test_weak_tags_never_match_if_match() {
        let pre = Preconditions::from_headers(&headers(&[("if-match", "W/\"tag\"")]));
        assert_eq!(pre.evaluate_get("tag", None), GetCheck::Failed);
    }

    #[test]
    fn test_write_requires_if_match() {
        let pre = Preconditions::default();
        assert_eq!(
            pre.evaluate_write("tag", None),
            WriteCheck::Missing("If-Match")
        );
    }

    #[test]
    fn test_write_requires_if_unmodified_since_when_tracked() {
        let pre = Preconditions::from_headers(&headers(&[("if-match", "\"tag\"")]));
        assert_eq!(pre.evaluate_write("tag", None), WriteCheck::Proceed);
        assert_eq!(
            pre.evaluate_write("tag", Some(modified())),
            WriteCheck::Missing("If-Unmodified-Since")
        );
    }

    #[test]
    fn test_stale_if_unmodified_since_fails_write() {
        let pre = Preconditions::from_headers(&headers(&[
            ("if-match", "\"tag\""),
            ("if-unmodified-since", "Sun, 01 Mar 2026 11:00:00 GMT"),
        ]));
        assert_eq!(pre.evaluate_write("tag", Some(modified())), WriteCheck::Failed);
    }

    #[test]
    fn test_if_match_star_matches_anything() {
        let pre = Preconditions::from_headers(&headers(&[
            ("if-match", "*"),
            ("if-unmodified-since", "Sun, 01 Mar 2026 12:00:00 GMT"),
        ]));
        assert_eq!(pre.evaluate_write("whatever", Some(modified())), WriteCheck::Proceed);
    }

    #[test]
    fn test_malformed_dates_are_ignored() {
        let pre = Preconditions::from_headers(&headers(&[(
            "if-modified-since",
            "not a date",
        )]));
        assert!(pre.if_modified_since.is_none());
        assert_eq!(pre.evaluate_get("tag", Some(modified())), GetCheck::Proceed);
    }

    #[test]
    fn test_http_date_round_trip() {
        let formatted = format_http_date(modified());
        assert_eq!(formatted, "Sun, 01 Mar 2026 12:00:00 GMT");
        assert_eq!(parse_http_date(&formatted), Some(modified()));
    }
}
