use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::storage::{timestamp, JsonDocument};

pub const ACCOUNTS_FILE: &str = "accounts.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Free, Tier::Premium];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "premium" => Ok(Tier::Premium),
            other => Err(anyhow!("account type must be 'free' or 'premium', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub credentials: String,
    #[serde(default)]
    pub used: bool,
    #[serde(default)]
    pub used_by: Option<u64>,
    #[serde(default, with = "timestamp::option")]
    pub used_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn unused(credentials: String) -> Self {
        Self {
            credentials,
            used: false,
            used_by: None,
            used_at: None,
        }
    }
}

type ServiceMap = BTreeMap<String, Vec<CredentialRecord>>;

/// On-disk shape of `accounts.json`: tier -> service -> records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialDb {
    #[serde(default)]
    pub free: ServiceMap,
    #[serde(default)]
    pub premium: ServiceMap,
}

impl CredentialDb {
    pub fn tier(&self, tier: Tier) -> &ServiceMap {
        match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut ServiceMap {
        match tier {
            Tier::Free => &mut self.free,
            Tier::Premium => &mut self.premium,
        }
    }
}

/// A record that has just been marked used, plus the service it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedCredential {
    pub service: String,
    pub record: CredentialRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ClaimedCredential),
    NotAvailable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub free: usize,
    pub premium: usize,
}

impl TierCounts {
    pub fn get(&self, tier: Tier) -> usize {
        match tier {
            Tier::Free => self.free,
            Tier::Premium => self.premium,
        }
    }

    fn get_mut(&mut self, tier: Tier) -> &mut usize {
        match tier {
            Tier::Free => &mut self.free,
            Tier::Premium => &mut self.premium,
        }
    }
}

/// Unused-record counts, recomputed from the store on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AvailabilityCounts {
    pub totals: TierCounts,
    /// Only services with at least one unused record in some tier.
    pub services: BTreeMap<String, TierCounts>,
}

impl AvailabilityCounts {
    pub fn for_tier(&self, tier: Tier) -> BTreeMap<&str, usize> {
        self.services
            .iter()
            .filter(|(_, c)| c.get(tier) > 0)
            .map(|(s, c)| (s.as_str(), c.get(tier)))
            .collect()
    }
}

pub struct CredentialStore {
    doc: JsonDocument<CredentialDb>,
}

impl CredentialStore {
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            doc: JsonDocument::new(path, lock_timeout),
        }
    }

    #[cfg(test)]
    pub fn load(&self) -> StorageResult<CredentialDb> {
        self.doc.load()
    }

    /// Appends every entry as a new unused record in one write. Duplicates are
    /// kept.
    pub fn add_credentials<I>(&self, tier: Tier, service: &str, credentials: I) -> StorageResult<usize>
    where
        I: IntoIterator<Item = String>,
    {
        let batch: Vec<CredentialRecord> = credentials
            .into_iter()
            .map(CredentialRecord::unused)
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }
        let added = batch.len();
        self.doc.update(move |db| {
            db.tier_mut(tier)
                .entry(service.to_string())
                .or_default()
                .extend(batch);
            Some(())
        })?;
        Ok(added)
    }

    /// Picks one unused record uniformly at random, marks it used by `claimant`
    /// and persists before returning it.
    ///
    /// With `service` the pick is restricted to that service; otherwise it is
    /// drawn from every service of the tier.
    pub fn claim_one(
        &self,
        tier: Tier,
        service: Option<&str>,
        claimant: u64,
        now: DateTime<Utc>,
    ) -> StorageResult<ClaimOutcome> {
        let claimed = self.doc.update(|db| {
            let services = db.tier_mut(tier);

            let mut candidates: Vec<(String, usize)> = Vec::new();
            for (name, records) in services.iter() {
                if service.is_some_and(|s| s != name.as_str()) {
                    continue;
                }
                candidates.extend(
                    records
                        .iter()
                        .enumerate()
                        .filter(|(_, r)| !r.used)
                        .map(|(i, _)| (name.clone(), i)),
                );
            }

            let (name, idx) = candidates.choose(&mut rand::thread_rng())?.clone();
            let record = services.get_mut(&name)?.get_mut(idx)?;
            record.used = true;
            record.used_by = Some(claimant);
            record.used_at = Some(now);

            Some(ClaimedCredential {
                record: record.clone(),
                service: name,
            })
        })?;

        Ok(match claimed {
            Some(c) => ClaimOutcome::Claimed(c),
            None => ClaimOutcome::NotAvailable,
        })
    }

    pub fn services_with_availability(&self, tier: Tier) -> StorageResult<BTreeSet<String>> {
        let db = self.doc.load()?;
        Ok(db
            .tier(tier)
            .iter()
            .filter(|(_, records)| records.iter().any(|r| !r.used))
            .map(|(name, _)| name.clone())
            .collect())
    }

    pub fn availability_counts(&self) -> StorageResult<AvailabilityCounts> {
        let db = self.doc.load()?;
        let mut counts = AvailabilityCounts::default();
        for tier in Tier::ALL {
            for (name, records) in db.tier(tier) {
                let available = records.iter().filter(|r| !r.used).count();
                if available == 0 {
                    continue;
                }
                *counts.services.entry(name.clone()).or_default().get_mut(tier) = available;
                *counts.totals.get_mut(tier) += available;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DEFAULT_LOCK_TIMEOUT;
    use std::collections::HashSet;

    fn store(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::open(dir.path().join(ACCOUNTS_FILE), DEFAULT_LOCK_TIMEOUT)
    }

    fn creds(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn three_claims_then_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let added = store
            .add_credentials(Tier::Free, "X", creds(&["a:1", "b:2", "c:3"]))
            .unwrap();
        assert_eq!(added, 3);

        let now = Utc::now();
        let mut seen = HashSet::new();
        for _ in 0..3 {
            match store.claim_one(Tier::Free, Some("X"), 7, now).unwrap() {
                ClaimOutcome::Claimed(c) => {
                    assert_eq!(c.service, "X");
                    assert!(c.record.used);
                    assert_eq!(c.record.used_by, Some(7));
                    assert!(seen.insert(c.record.credentials));
                }
                ClaimOutcome::NotAvailable => panic!("ran out early"),
            }
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(
            store.claim_one(Tier::Free, Some("X"), 7, now).unwrap(),
            ClaimOutcome::NotAvailable
        );
    }

    #[test]
    fn claim_without_service_spans_all_services_of_tier() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add_credentials(Tier::Premium, "A", creds(&["a1"])).unwrap();
        store.add_credentials(Tier::Premium, "B", creds(&["b1", "b2"])).unwrap();
        store.add_credentials(Tier::Free, "A", creds(&["free-only"])).unwrap();

        let now = Utc::now();
        let mut got = Vec::new();
        while let ClaimOutcome::Claimed(c) = store.claim_one(Tier::Premium, None, 1, now).unwrap() {
            got.push((c.service, c.record.credentials));
        }
        got.sort();
        assert_eq!(
            got,
            vec![
                ("A".to_string(), "a1".to_string()),
                ("B".to_string(), "b1".to_string()),
                ("B".to_string(), "b2".to_string()),
            ]
        );
        assert_eq!(store.availability_counts().unwrap().totals.free, 1);
    }

    #[test]
    fn unknown_service_or_empty_tier_is_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let now = Utc::now();
        assert_eq!(
            store.claim_one(Tier::Free, None, 1, now).unwrap(),
            ClaimOutcome::NotAvailable
        );
        store.add_credentials(Tier::Free, "X", creds(&["x"])).unwrap();
        assert_eq!(
            store.claim_one(Tier::Free, Some("x"), 1, now).unwrap(),
            ClaimOutcome::NotAvailable
        );
        assert_eq!(
            store.claim_one(Tier::Premium, Some("X"), 1, now).unwrap(),
            ClaimOutcome::NotAvailable
        );
    }

    #[test]
    fn added_credentials_stay_listed_until_claimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add_credentials(Tier::Free, "X", creds(&["dup", "dup"])).unwrap();
        store.add_credentials(Tier::Free, "Y", creds(&["y"])).unwrap();

        let services = store.services_with_availability(Tier::Free).unwrap();
        assert_eq!(services, BTreeSet::from(["X".to_string(), "Y".to_string()]));
        assert!(store.services_with_availability(Tier::Premium).unwrap().is_empty());

        store.claim_one(Tier::Free, Some("Y"), 1, Utc::now()).unwrap();
        let services = store.services_with_availability(Tier::Free).unwrap();
        assert_eq!(services, BTreeSet::from(["X".to_string()]));

        let counts = store.availability_counts().unwrap();
        assert_eq!(counts.totals, TierCounts { free: 2, premium: 0 });
        assert_eq!(counts.services.len(), 1);
        assert_eq!(counts.services["X"].free, 2);
        assert_eq!(counts.for_tier(Tier::Free).get("X"), Some(&2));
    }

    #[test]
    fn used_records_are_never_touched_again() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add_credentials(Tier::Free, "X", creds(&["one"])).unwrap();
        let first = Utc::now();
        let ClaimOutcome::Claimed(c) = store.claim_one(Tier::Free, Some("X"), 5, first).unwrap() else {
            panic!("expected a claim");
        };
        store.claim_one(Tier::Free, Some("X"), 6, Utc::now()).unwrap();
        store.add_credentials(Tier::Free, "X", creds(&["two"])).unwrap();

        let db = store.load().unwrap();
        assert_eq!(db.free["X"][0], c.record);
        assert_eq!(db.free["X"][0].used_at, Some(first));
        assert!(!db.free["X"][1].used);
    }

    #[test]
    fn round_trip_preserves_structure() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.add_credentials(Tier::Free, "X", creds(&["a", "b"])).unwrap();
        store.add_credentials(Tier::Premium, "Y", creds(&["c"])).unwrap();
        store.claim_one(Tier::Free, Some("X"), 99, Utc::now()).unwrap();

        let before = store.load().unwrap();
        let text = serde_json::to_string(&before).unwrap();
        let after: CredentialDb = serde_json::from_str(&text).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn reads_legacy_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ACCOUNTS_FILE);
        std::fs::write(
            &path,
            r#"{
                "free": {"Svc": [
                    {"credentials": "u:p", "used": true, "used_by": null, "used_at": "2024-05-01T12:00:00.123456"},
                    {"credentials": "v:q", "used": false, "used_by": null, "used_at": null}
                ]},
                "premium": {}
            }"#,
        )
        .unwrap();
        let store = CredentialStore::open(&path, DEFAULT_LOCK_TIMEOUT);
        let ClaimOutcome::Claimed(c) = store.claim_one(Tier::Free, None, 3, Utc::now()).unwrap() else {
            panic!("expected the single unused record");
        };
        assert_eq!(c.record.credentials, "v:q");
        assert_eq!(
            store.claim_one(Tier::Free, None, 3, Utc::now()).unwrap(),
            ClaimOutcome::NotAvailable
        );
    }

    #[test]
    fn concurrent_claims_never_double_issue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ACCOUNTS_FILE);
        let seed = CredentialStore::open(&path, DEFAULT_LOCK_TIMEOUT);
        let items: Vec<String> = (0..40).map(|i| format!("cred-{i}")).collect();
        seed.add_credentials(Tier::Free, "X", items).unwrap();

        let claimed: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8u64)
                .map(|worker| {
                    let path = path.clone();
                    s.spawn(move || {
                        // separate handles, like separate processes
                        let store = CredentialStore::open(path, Duration::from_secs(30));
                        let mut mine = Vec::new();
                        while let ClaimOutcome::Claimed(c) =
                            store.claim_one(Tier::Free, Some("X"), worker, Utc::now()).unwrap()
                        {
                            mine.push(c.record.credentials);
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(claimed.len(), 40);
        let unique: HashSet<_> = claimed.iter().collect();
        assert_eq!(unique.len(), 40);
    }

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("Premium".parse::<Tier>().unwrap(), Tier::Premium);
        assert_eq!(" free ".parse::<Tier>().unwrap(), Tier::Free);
        assert!("gold".parse::<Tier>().is_err());
    }
}
