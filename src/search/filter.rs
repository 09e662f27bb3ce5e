//! Result filtering for nearest-neighbor queries.

use serde::{Deserialize, Serialize};

use crate::types::EntityKey;

/// Default number of results returned when unset.
pub const DEFAULT_LIMIT: usize = 20;

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

/// Declarative filter applied while scanning candidates.
///
/// Serializes deterministically, which lets the facade use the serialized
/// form as part of a results-cache key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Maximum results to return.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Only keys under this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_starts_with: Option<String>,
    /// Drop keys under any of these prefixes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_key_starts_with: Vec<String>,
    /// Drop these exact keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_keys: Vec<String>,
    /// Only block entities.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocks_only: bool,
    /// Only source entities.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sources_only: bool,
    /// Drop sources the query entity links to (and their blocks).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude_outlinks: bool,
    /// Drop sources that link to the query entity.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude_inlinks: bool,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            key_starts_with: None,
            exclude_key_starts_with: Vec::new(),
            exclude_keys: Vec::new(),
            blocks_only: false,
            sources_only: false,
            exclude_outlinks: false,
            exclude_inlinks: false,
        }
    }
}

impl QueryFilter {
    /// Filter with a custom result limit.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Returns true when the candidate key passes every criterion.
    pub fn matches(&self, key: &str) -> bool {
        let entity_key = EntityKey::new(key);
        if self.blocks_only && !entity_key.is_block() {
            return false;
        }
        if self.sources_only && entity_key.is_block() {
            return false;
        }
        if let Some(prefix) = &self.key_starts_with {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if self.exclude_key_starts_with.iter().any(|p| key.starts_with(p.as_str())) {
            return false;
        }
        if self.exclude_keys.iter().any(|k| k == key) {
            return false;
        }
        true
    }
}
