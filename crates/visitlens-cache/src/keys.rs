//! Cache key layout
//!
//! `{prefix}:{dataset}:{tier}:{discriminator}` where the discriminator is the
//! config hash for result tiers and the fetch mode (`full` or `slim`) for the
//! raw tier. Backend identity is deliberately absent.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use visitlens_query::TerminalStage;

pub const DEFAULT_KEY_PREFIX: &str = "visitlens";

/// Cache tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    RawVisits,
    VisitResults,
    WorkerResults,
}

impl CacheTier {
    pub const ALL: [CacheTier; 3] = [
        CacheTier::RawVisits,
        CacheTier::VisitResults,
        CacheTier::WorkerResults,
    ];

    /// Key segment
    pub fn name(&self) -> &'static str {
        match self {
            CacheTier::RawVisits => "raw",
            CacheTier::VisitResults => "visits",
            CacheTier::WorkerResults => "workers",
        }
    }

    pub fn from_name(name: &str) -> Option<CacheTier> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Result tier holding a terminal stage's output
    pub fn for_stage(stage: TerminalStage) -> CacheTier {
        match stage {
            TerminalStage::VisitLevel => CacheTier::VisitResults,
            TerminalStage::Aggregated => CacheTier::WorkerResults,
        }
    }

    pub fn is_result(&self) -> bool {
        !matches!(self, CacheTier::RawVisits)
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub dataset_id: String,
    pub tier: CacheTier,
    pub discriminator: String,
}

impl CacheKey {
    /// Key for a stored result
    pub fn result(dataset_id: &str, tier: CacheTier, config_hash: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            tier,
            discriminator: config_hash.to_string(),
        }
    }

    /// Key for a raw batch fetched in the given mode
    pub fn raw(dataset_id: &str, slim: bool) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            tier: CacheTier::RawVisits,
            discriminator: if slim { "slim" } else { "full" }.to_string(),
        }
    }

    /// Storage key under `prefix`
    pub fn to_storage_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            prefix, self.dataset_id, self.tier, self.discriminator
        )
    }

    /// Prefix matching every key of a dataset
    pub fn dataset_pattern(prefix: &str, dataset_id: &str) -> String {
        format!("{}:{}:", prefix, dataset_id)
    }

    /// Recover a key from a storage key known to belong to `dataset_id`
    pub fn parse(prefix: &str, dataset_id: &str, storage_key: &str) -> Option<CacheKey> {
        let rest = storage_key.strip_prefix(&Self::dataset_pattern(prefix, dataset_id))?;
        let (tier, discriminator) = rest.split_once(':')?;
        Some(CacheKey {
            dataset_id: dataset_id.to_string(),
            tier: CacheTier::from_name(tier)?,
            discriminator: discriminator.to_string(),
        })
    }
}

/// Reject key components that would make dataset scoping ambiguous
pub(crate) fn check_component(value: &str) -> Result<()> {
    if value.is_empty() || value.contains(':') {
        return Err(CacheError::InvalidKey(value.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_key_layout() {
        let key = CacheKey::result("opp-1", CacheTier::WorkerResults, "abc123");
        assert_eq!(key.to_storage_key("visitlens"), "visitlens:opp-1:workers:abc123");
    }

    #[test]
    fn test_raw_key_layout() {
        assert_eq!(CacheKey::raw("opp-1", true).to_storage_key("p"), "p:opp-1:raw:slim");
        assert_eq!(CacheKey::raw("opp-1", false).to_storage_key("p"), "p:opp-1:raw:full");
    }

    #[test]
    fn test_dataset_pattern_isolates_datasets() {
        let pattern = CacheKey::dataset_pattern("p", "opp-1");
        let own = CacheKey::result("opp-1", CacheTier::VisitResults, "h").to_storage_key("p");
        let other = CacheKey::result("opp-10", CacheTier::VisitResults, "h").to_storage_key("p");
        assert!(own.starts_with(&pattern));
        assert!(!other.starts_with(&pattern));
    }

    #[test]
    fn test_parse_roundtrip() {
        let key = CacheKey::result("opp-1", CacheTier::VisitResults, "h1");
        let parsed = CacheKey::parse("p", "opp-1", &key.to_storage_key("p"));
        assert_eq!(parsed, Some(key));
        assert_eq!(CacheKey::parse("p", "opp-1", "p:opp-1:bogus:h1"), None);
        assert_eq!(CacheKey::parse("p", "opp-2", "p:opp-1:raw:full"), None);
    }

    #[test]
    fn test_tier_for_stage() {
        assert_eq!(CacheTier::for_stage(TerminalStage::VisitLevel), CacheTier::VisitResults);
        assert_eq!(CacheTier::for_stage(TerminalStage::Aggregated), CacheTier::WorkerResults);
        assert!(!CacheTier::RawVisits.is_result());
    }

    #[test]
    fn test_component_check() {
        assert!(check_component("opp-1").is_ok());
        assert!(check_component("").is_err());
        assert!(check_component("a:b").is_err());
    }
}
