use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::Tier;
use crate::error::StorageResult;
use crate::storage::JsonDocument;

pub const STATS_FILE: &str = "stats.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    FreeGenerated,
    PremiumGenerated,
    AccountsAdded,
}

impl Counter {
    pub const ALL: [Counter; 3] = [
        Counter::FreeGenerated,
        Counter::PremiumGenerated,
        Counter::AccountsAdded,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::FreeGenerated => "free_generated",
            Counter::PremiumGenerated => "premium_generated",
            Counter::AccountsAdded => "accounts_added",
        }
    }

    pub fn generated(tier: Tier) -> Self {
        match tier {
            Tier::Free => Counter::FreeGenerated,
            Tier::Premium => Counter::PremiumGenerated,
        }
    }
}

/// Contents of `stats.json`. Unknown counters are preserved on rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageStats(BTreeMap<String, u64>);

impl UsageStats {
    pub fn get(&self, counter: Counter) -> u64 {
        self.0.get(counter.name()).copied().unwrap_or(0)
    }

    fn bump(&mut self, counter: Counter, by: u64) -> u64 {
        let slot = self.0.entry(counter.name().to_string()).or_insert(0);
        *slot = slot.saturating_add(by);
        *slot
    }
}

pub struct UsageCounters {
    doc: JsonDocument<UsageStats>,
}

impl UsageCounters {
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            doc: JsonDocument::new(path, lock_timeout),
        }
    }

    /// Returns the counter's new value.
    pub fn increment(&self, counter: Counter, by: u64) -> StorageResult<u64> {
        let value = self.doc.update(|stats| {
            for c in Counter::ALL {
                stats.0.entry(c.name().to_string()).or_insert(0);
            }
            Some(stats.bump(counter, by))
        })?;
        Ok(value.unwrap_or_default())
    }

    pub fn snapshot(&self) -> StorageResult<UsageStats> {
        self.doc.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DEFAULT_LOCK_TIMEOUT;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let counters = UsageCounters::open(dir.path().join(STATS_FILE), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(counters.snapshot().unwrap().get(Counter::AccountsAdded), 0);

        assert_eq!(counters.increment(Counter::AccountsAdded, 3).unwrap(), 3);
        assert_eq!(counters.increment(Counter::AccountsAdded, 1).unwrap(), 4);
        assert_eq!(counters.increment(Counter::generated(Tier::Premium), 1).unwrap(), 1);

        let snap = counters.snapshot().unwrap();
        assert_eq!(snap.get(Counter::AccountsAdded), 4);
        assert_eq!(snap.get(Counter::PremiumGenerated), 1);
        assert_eq!(snap.get(Counter::FreeGenerated), 0);
    }

    #[test]
    fn keeps_unknown_counters_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATS_FILE);
        std::fs::write(&path, r#"{"free_generated": 10, "legacy_thing": 2}"#).unwrap();
        let counters = UsageCounters::open(&path, DEFAULT_LOCK_TIMEOUT);
        counters.increment(Counter::FreeGenerated, 1).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["free_generated"], 11);
        assert_eq!(raw["legacy_thing"], 2);
        assert_eq!(raw["accounts_added"], 0);

        let snap = counters.snapshot().unwrap();
        let again: UsageStats = serde_json::from_str(&serde_json::to_string(&snap).unwrap()).unwrap();
        assert_eq!(snap, again);
    }
}
