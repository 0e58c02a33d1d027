use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::cooldown::{
    CooldownDurations, CooldownGate, Reservation, ReserveOutcome, COOLDOWNS_FILE,
};
use crate::credentials::{
    AvailabilityCounts, ClaimOutcome, ClaimedCredential, CredentialStore, Tier, ACCOUNTS_FILE,
};
use crate::error::StorageResult;
use crate::stats::{Counter, UsageCounters, UsageStats, STATS_FILE};

/// A claimed credential that still has to reach the user. The claimant's
/// cooldown slot is held until [`Dispenser::commit_issue`] or
/// [`Dispenser::abandon_issue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIssue {
    pub credential: ClaimedCredential,
    reservation: Reservation,
}

impl PendingIssue {
    pub fn tier(&self) -> Tier {
        self.reservation.tier
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    Issued(PendingIssue),
    CooldownActive(chrono::Duration),
    NotAvailable,
}

#[derive(Debug, Clone)]
pub struct Overview {
    pub availability: AvailabilityCounts,
    pub stats: UsageStats,
}

/// The stores behind both front-ends. Built once per process and shared by
/// `Arc`; every call is synchronous file I/O.
pub struct Dispenser {
    store: CredentialStore,
    cooldowns: CooldownGate,
    counters: UsageCounters,
}

impl Dispenser {
    pub fn open(data_dir: &Path, lock_timeout: Duration, durations: CooldownDurations) -> Self {
        Self {
            store: CredentialStore::open(data_dir.join(ACCOUNTS_FILE), lock_timeout),
            cooldowns: CooldownGate::open(data_dir.join(COOLDOWNS_FILE), lock_timeout, durations),
            counters: UsageCounters::open(data_dir.join(STATS_FILE), lock_timeout),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::open(&cfg.data_dir(), cfg.lock_timeout(), cfg.cooldowns())
    }

    /// Reserves the user's cooldown slot, then claims one credential.
    ///
    /// The reservation is the locked check-and-record, so concurrent calls for
    /// one user get at most one credential per window. It is handed back when
    /// nothing could be claimed.
    pub fn generate(
        &self,
        user_id: u64,
        tier: Tier,
        service: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<GenerateOutcome> {
        // Lock-free answer for users who are plainly still waiting.
        if let Some(left) = self.cooldowns.check_cooldown(user_id, tier, now)? {
            return Ok(GenerateOutcome::CooldownActive(left));
        }
        let reservation = match self.cooldowns.try_reserve(user_id, tier, now)? {
            ReserveOutcome::Reserved(r) => r,
            ReserveOutcome::Active(left) => return Ok(GenerateOutcome::CooldownActive(left)),
        };

        let claimed = match self.store.claim_one(tier, service, user_id, now) {
            Ok(ClaimOutcome::Claimed(c)) => c,
            Ok(ClaimOutcome::NotAvailable) => {
                self.release(&reservation);
                return Ok(GenerateOutcome::NotAvailable);
            }
            Err(e) => {
                self.release(&reservation);
                return Err(e);
            }
        };
        info!(
            "issued {} credential: service={} user={}",
            tier, claimed.service, user_id
        );
        Ok(GenerateOutcome::Issued(PendingIssue {
            credential: claimed,
            reservation,
        }))
    }

    /// The credential reached the user: the cooldown stands and the generated
    /// counter goes up.
    pub fn commit_issue(&self, issue: &PendingIssue) -> StorageResult<u64> {
        self.counters.increment(Counter::generated(issue.tier()), 1)
    }

    /// Delivery failed. The credential stays used, but the user gets their
    /// cooldown slot back and nothing is counted.
    pub fn abandon_issue(&self, issue: &PendingIssue) -> StorageResult<()> {
        let r = &issue.reservation;
        info!(
            "{} credential for user {} was not delivered; cooldown released",
            r.tier, r.user_id
        );
        self.cooldowns.release(r)
    }

    fn release(&self, r: &Reservation) {
        if let Err(e) = self.cooldowns.release(r) {
            warn!("cooldown release failed for user {}: {}", r.user_id, e);
        }
    }

    /// Adds one credential per non-blank line of `text`.
    pub fn upload_batch(&self, tier: Tier, service: &str, text: &str) -> Result<usize> {
        let service = service.trim();
        if service.is_empty() {
            return Err(anyhow!("service name must not be empty"));
        }
        let lines = parse_batch(text);
        if lines.is_empty() {
            return Err(anyhow!("the file doesn't contain any credentials"));
        }

        let added = self.store.add_credentials(tier, service, lines)?;
        info!("added {} {} credentials for {}", added, tier, service);
        if let Err(e) = self.counters.increment(Counter::AccountsAdded, added as u64) {
            warn!("stats increment failed: {}", e);
        }
        Ok(added)
    }

    pub fn services(&self, tier: Tier) -> StorageResult<Vec<String>> {
        Ok(self
            .store
            .services_with_availability(tier)?
            .into_iter()
            .collect())
    }

    pub fn overview(&self) -> StorageResult<Overview> {
        Ok(Overview {
            availability: self.store.availability_counts()?,
            stats: self.counters.snapshot()?,
        })
    }
}

pub fn parse_batch(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DEFAULT_LOCK_TIMEOUT;
    use chrono::TimeZone;

    fn dispenser(dir: &tempfile::TempDir) -> Dispenser {
        Dispenser::open(dir.path(), DEFAULT_LOCK_TIMEOUT, CooldownDurations::default())
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn batch_parsing_trims_and_drops_blank_lines() {
        assert_eq!(
            parse_batch("  a:1  \r\n\n\t\nb:2\n"),
            vec!["a:1".to_string(), "b:2".to_string()]
        );
        assert!(parse_batch("\n \n").is_empty());
    }

    #[test]
    fn upload_counts_and_rejects_empty_batches() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(&dir);
        assert_eq!(d.upload_batch(Tier::Free, " Netflix ", "a\nb\n\nc").unwrap(), 3);
        assert!(d.upload_batch(Tier::Free, "Netflix", "\n\n").is_err());
        assert!(d.upload_batch(Tier::Free, "  ", "x").is_err());

        let o = d.overview().unwrap();
        assert_eq!(o.availability.totals.free, 3);
        assert_eq!(o.availability.services["Netflix"].free, 3);
        assert_eq!(o.stats.get(Counter::AccountsAdded), 3);
        assert_eq!(d.services(Tier::Free).unwrap(), vec!["Netflix".to_string()]);
    }

    #[test]
    fn generate_applies_cooldown_after_issue() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(&dir);
        d.upload_batch(Tier::Free, "X", "a\nb").unwrap();

        let GenerateOutcome::Issued(first) = d.generate(42, Tier::Free, None, t(0)).unwrap() else {
            panic!("expected an issue");
        };
        d.commit_issue(&first).unwrap();
        assert_eq!(first.credential.service, "X");
        assert_eq!(
            d.generate(42, Tier::Free, None, t(3600)).unwrap(),
            GenerateOutcome::CooldownActive(chrono::Duration::seconds(82_800))
        );

        let outcome = d.generate(42, Tier::Free, Some("X"), t(86_400)).unwrap();
        let GenerateOutcome::Issued(second) = outcome else {
            panic!("cooldown should have expired");
        };
        d.commit_issue(&second).unwrap();
        assert_ne!(
            first.credential.record.credentials,
            second.credential.record.credentials
        );
        assert_eq!(d.overview().unwrap().stats.get(Counter::FreeGenerated), 2);
    }

    #[test]
    fn not_available_does_not_start_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(&dir);
        assert_eq!(
            d.generate(1, Tier::Premium, Some("Y"), t(0)).unwrap(),
            GenerateOutcome::NotAvailable
        );
        d.upload_batch(Tier::Premium, "Y", "p").unwrap();
        let GenerateOutcome::Issued(issue) = d.generate(1, Tier::Premium, Some("Y"), t(1)).unwrap()
        else {
            panic!("expected an issue");
        };
        assert_eq!(issue.tier(), Tier::Premium);
        d.commit_issue(&issue).unwrap();
        assert_eq!(d.overview().unwrap().stats.get(Counter::PremiumGenerated), 1);
    }

    #[test]
    fn concurrent_generates_issue_once_per_window() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(&dir);
        let batch: Vec<String> = (0..8).map(|i| format!("user{i}:pw")).collect();
        d.upload_batch(Tier::Free, "X", &batch.join("\n")).unwrap();

        let barrier = std::sync::Barrier::new(8);
        let issued = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        d.generate(42, Tier::Free, None, t(0)).unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|o| matches!(o, GenerateOutcome::Issued(_)))
                .count()
        });
        assert_eq!(issued, 1);
        assert_eq!(d.overview().unwrap().availability.totals.free, 7);
    }

    #[test]
    fn abandoned_issue_frees_cooldown_without_counting() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(&dir);
        d.upload_batch(Tier::Free, "X", "a\nb").unwrap();

        let GenerateOutcome::Issued(lost) = d.generate(7, Tier::Free, None, t(0)).unwrap() else {
            panic!("expected an issue");
        };
        d.abandon_issue(&lost).unwrap();
        assert_eq!(d.overview().unwrap().stats.get(Counter::FreeGenerated), 0);

        let GenerateOutcome::Issued(retry) = d.generate(7, Tier::Free, None, t(5)).unwrap() else {
            panic!("a failed delivery must not start the cooldown");
        };
        assert_ne!(lost.credential.record.credentials, retry.credential.record.credentials);
        d.commit_issue(&retry).unwrap();
        assert_eq!(d.overview().unwrap().stats.get(Counter::FreeGenerated), 1);
        assert!(matches!(
            d.generate(7, Tier::Free, None, t(10)).unwrap(),
            GenerateOutcome::CooldownActive(_)
        ));
    }

    #[test]
    fn not_available_hands_back_the_slot_after_prior_claim() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispenser(&dir);
        d.upload_batch(Tier::Premium, "Y", "only").unwrap();
        let GenerateOutcome::Issued(i) = d.generate(3, Tier::Premium, None, t(0)).unwrap() else {
            panic!("expected an issue");
        };
        d.commit_issue(&i).unwrap();

        assert_eq!(
            d.generate(3, Tier::Premium, None, t(4000)).unwrap(),
            GenerateOutcome::NotAvailable
        );
        d.upload_batch(Tier::Premium, "Y", "more").unwrap();
        assert!(matches!(
            d.generate(3, Tier::Premium, None, t(4001)).unwrap(),
            GenerateOutcome::Issued(_)
        ));
    }
}
