//! ACL resolution: per-row readers combined with the default ACL policy.
//!
//! | Mode | Effective readers |
//! |------|-------------------|
//! | `none` | row readers only |
//! | `fallback` | row readers if any, else the policy's readers |
//! | `append` | row readers followed by policy readers not already present |
//! | `override` | policy readers, row readers ignored |
//!
//! Resolution is a pure function and is re-evaluated on every pass, so an
//! ACL change picked up by an incremental traversal reaches the index in the
//! same cycle.

use serde::Deserialize;

use crate::config::DefaultAclConfig;
use crate::models::{EffectiveAcl, Row};

/// Column holding comma-separated reader principals for a row.
pub const READERS_USERS_COLUMN: &str = "readers_users";

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AclMode {
    #[default]
    None,
    Fallback,
    Append,
    Override,
}

/// The configured default ACL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclPolicy {
    pub mode: AclMode,
    pub public: bool,
    pub readers: Vec<String>,
    pub name: Option<String>,
}

impl From<&DefaultAclConfig> for AclPolicy {
    fn from(cfg: &DefaultAclConfig) -> Self {
        Self {
            mode: cfg.mode,
            public: cfg.public,
            readers: dedup(cfg.readers_users.iter().map(|s| s.trim().to_string())),
            name: cfg.name.clone(),
        }
    }
}

/// Parse the reader principals stored in a row, if the column is present.
pub fn row_readers(row: &Row) -> Vec<String> {
    row.non_null(READERS_USERS_COLUMN)
        .and_then(|v| v.as_text())
        .map(|s| parse_principals(&s))
        .unwrap_or_default()
}

/// Split a comma-separated principal list, trimming and dropping empties
/// and duplicates.
pub fn parse_principals(raw: &str) -> Vec<String> {
    dedup(raw.split(',').map(|p| p.trim().to_string()))
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

pub fn resolve(row_readers: &[String], policy: &AclPolicy) -> EffectiveAcl {
    let inherited = || policy.name.clone();
    match policy.mode {
        AclMode::None => EffectiveAcl {
            readers: row_readers.to_vec(),
            public: false,
            inherited_from: None,
        },
        AclMode::Fallback if row_readers.is_empty() => EffectiveAcl {
            readers: policy.readers.clone(),
            public: policy.public,
            inherited_from: inherited(),
        },
        AclMode::Fallback => EffectiveAcl {
            readers: row_readers.to_vec(),
            public: false,
            inherited_from: None,
        },
        AclMode::Append => EffectiveAcl {
            readers: dedup(row_readers.iter().chain(policy.readers.iter()).cloned()),
            public: policy.public,
            inherited_from: inherited(),
        },
        AclMode::Override => EffectiveAcl {
            readers: policy.readers.clone(),
            public: policy.public,
            inherited_from: inherited(),
        },
    }
}
