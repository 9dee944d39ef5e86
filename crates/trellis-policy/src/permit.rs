//! Allow/deny permits over column names.
//!
//! A permit is an immutable rule value: either an allow-list (everything
//! outside it is denied) or a deny-list (everything outside it is allowed).
//! The two forms are complementary over the same universe, which gives the
//! algebra below:
//!
//! - `Allow(a) ∩ Allow(b)` = `Allow(a ∩ b)`
//! - `Deny(a) ∩ Deny(b)` = `Deny(a ∪ b)`
//! - `Allow(a) ∩ Deny(d)` = `Allow(a − d)`
//!
//! All operations return new values; a permit is never mutated.

use std::collections::BTreeSet;

use trellis_core::config::PermitConfig;

/// An allow or deny rule over opaque names (column identifiers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permit {
    /// Only the listed names are allowed.
    Allow(BTreeSet<String>),
    /// Everything except the listed names is allowed.
    Deny(BTreeSet<String>),
}

impl Permit {
    /// An allow-list permit.
    pub fn allow<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Permit::Allow(names.into_iter().map(Into::into).collect())
    }

    /// A deny-list permit.
    pub fn deny<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Permit::Deny(names.into_iter().map(Into::into).collect())
    }

    /// Permit that allows every name.
    pub fn allow_all() -> Self {
        Permit::Deny(BTreeSet::new())
    }

    /// Permit that denies every name.
    pub fn deny_all() -> Self {
        Permit::Allow(BTreeSet::new())
    }

    /// Whether `name` is allowed.
    pub fn test(&self, name: &str) -> bool {
        match self {
            Permit::Allow(names) => names.contains(name),
            Permit::Deny(names) => !names.contains(name),
        }
    }

    /// Split candidates into (allowed, denied), deterministically.
    pub fn partition<'a, I>(&self, candidates: I) -> (BTreeSet<String>, BTreeSet<String>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut allowed = BTreeSet::new();
        let mut denied = BTreeSet::new();
        for candidate in candidates {
            if self.test(candidate) {
                allowed.insert(candidate.to_string());
            } else {
                denied.insert(candidate.to_string());
            }
        }
        (allowed, denied)
    }

    /// The permit equivalent to applying both restrictions.
    pub fn intersect(&self, other: &Permit) -> Permit {
        match (self, other) {
            (Permit::Allow(a), Permit::Allow(b)) => {
                Permit::Allow(a.intersection(b).cloned().collect())
            }
            (Permit::Deny(a), Permit::Deny(b)) => Permit::Deny(a.union(b).cloned().collect()),
            (Permit::Allow(a), Permit::Deny(d)) | (Permit::Deny(d), Permit::Allow(a)) => {
                Permit::Allow(a.difference(d).cloned().collect())
            }
        }
    }

    /// The permit allowing what either side allows.
    pub fn union(&self, other: &Permit) -> Permit {
        match (self, other) {
            (Permit::Allow(a), Permit::Allow(b)) => Permit::Allow(a.union(b).cloned().collect()),
            (Permit::Deny(a), Permit::Deny(b)) => {
                Permit::Deny(a.intersection(b).cloned().collect())
            }
            (Permit::Allow(a), Permit::Deny(d)) | (Permit::Deny(d), Permit::Allow(a)) => {
                Permit::Deny(d.difference(a).cloned().collect())
            }
        }
    }

    /// The permit allowing what `self` allows and `other` does not.
    pub fn subtract(&self, other: &Permit) -> Permit {
        self.intersect(&other.complement())
    }

    /// A new permit with the given names additionally allowed.
    pub fn allowing<I, S>(&self, names: I) -> Permit
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.union(&Permit::allow(names))
    }

    /// A new permit with the given names additionally denied.
    pub fn denying<I, S>(&self, names: I) -> Permit
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intersect(&Permit::deny(names))
    }

    fn complement(&self) -> Permit {
        match self {
            Permit::Allow(names) => Permit::Deny(names.clone()),
            Permit::Deny(names) => Permit::Allow(names.clone()),
        }
    }
}

impl From<&PermitConfig> for Permit {
    fn from(config: &PermitConfig) -> Self {
        match config {
            PermitConfig::Allow { allow } => Permit::allow(allow.iter().cloned()),
            PermitConfig::Deny { deny } => Permit::deny(deny.iter().cloned()),
        }
    }
}
