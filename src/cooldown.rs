use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::Tier;
use crate::error::StorageResult;
use crate::storage::{timestamp, JsonDocument};

pub const COOLDOWNS_FILE: &str = "cooldowns.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownEntry {
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub last_free: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub last_premium: Option<DateTime<Utc>>,
}

impl CooldownEntry {
    pub fn last(&self, tier: Tier) -> Option<DateTime<Utc>> {
        match tier {
            Tier::Free => self.last_free,
            Tier::Premium => self.last_premium,
        }
    }

    fn set_last(&mut self, tier: Tier, at: Option<DateTime<Utc>>) {
        match tier {
            Tier::Free => self.last_free = at,
            Tier::Premium => self.last_premium = at,
        }
    }

    fn is_empty(&self) -> bool {
        self.last_free.is_none() && self.last_premium.is_none()
    }
}

/// A cooldown slot taken by [`CooldownGate::try_reserve`]. Holds what it
/// replaced so the slot can be handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub user_id: u64,
    pub tier: Tier,
    pub at: DateTime<Utc>,
    previous: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    Active(chrono::Duration),
}

/// user id -> last claim per tier. User ids are written as string keys.
pub type CooldownDb = BTreeMap<u64, CooldownEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownDurations {
    pub free: chrono::Duration,
    pub premium: chrono::Duration,
}

impl CooldownDurations {
    pub fn from_secs(free: u64, premium: u64) -> Self {
        Self {
            free: chrono::Duration::seconds(free as i64),
            premium: chrono::Duration::seconds(premium as i64),
        }
    }

    pub fn get(&self, tier: Tier) -> chrono::Duration {
        match tier {
            Tier::Free => self.free,
            Tier::Premium => self.premium,
        }
    }
}

impl Default for CooldownDurations {
    fn default() -> Self {
        Self::from_secs(86_400, 3_600)
    }
}

/// Time left before a claim made at `last` stops blocking, or `None` once it
/// has elapsed.
pub fn remaining(
    last: DateTime<Utc>,
    duration: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<chrono::Duration> {
    let left = last + duration - now;
    (left > chrono::Duration::zero()).then_some(left)
}

pub struct CooldownGate {
    doc: JsonDocument<CooldownDb>,
    durations: CooldownDurations,
}

impl CooldownGate {
    pub fn open(
        path: impl Into<PathBuf>,
        lock_timeout: Duration,
        durations: CooldownDurations,
    ) -> Self {
        Self {
            doc: JsonDocument::new(path, lock_timeout),
            durations,
        }
    }

    pub fn check_cooldown(
        &self,
        user_id: u64,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<chrono::Duration>> {
        let db = self.doc.load()?;
        Ok(db
            .get(&user_id)
            .and_then(|e| e.last(tier))
            .and_then(|last| remaining(last, self.durations.get(tier), now)))
    }

    /// Check and record in one locked update: either the user is still cooling
    /// down, or `now` is written as their last claim for `tier`.
    pub fn try_reserve(
        &self,
        user_id: u64,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> StorageResult<ReserveOutcome> {
        let duration = self.durations.get(tier);
        let mut active = None;
        let reserved = self.doc.update(|db| {
            let entry = db.entry(user_id).or_default();
            let previous = entry.last(tier);
            if let Some(left) = previous.and_then(|last| remaining(last, duration, now)) {
                active = Some(left);
                return None;
            }
            entry.set_last(tier, Some(now));
            Some(Reservation {
                user_id,
                tier,
                at: now,
                previous,
            })
        })?;
        match reserved {
            Some(r) => Ok(ReserveOutcome::Reserved(r)),
            None => Ok(ReserveOutcome::Active(
                active.unwrap_or_else(chrono::Duration::zero),
            )),
        }
    }

    /// Hands a reserved slot back, restoring the previous last-claim time.
    /// A slot that was overwritten since is left alone.
    pub fn release(&self, r: &Reservation) -> StorageResult<()> {
        self.doc.update(|db| {
            let entry = db.get_mut(&r.user_id)?;
            if entry.last(r.tier) != Some(r.at) {
                return None;
            }
            entry.set_last(r.tier, r.previous);
            if entry.is_empty() {
                db.remove(&r.user_id);
            }
            Some(())
        })?;
        Ok(())
    }
}

/// `Hh Mm Ss`, as shown to users waiting out a cooldown.
pub fn format_remaining(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    let (hours, rem) = (secs / 3600, secs % 3600);
    format!("{}h {}m {}s", hours, rem / 60, rem % 60)
}
