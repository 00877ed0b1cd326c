//! Tab lease table (SPEC_FULL §4.1 `lease.*`).

use dashmap::DashMap;
use tabline_core::{Lease, Result, RuntimeError};
use uuid::Uuid;

const MIN_TTL_MS: i64 = 2_000;
const MAX_TTL_MS: i64 = 300_000;

fn clamp_ttl(ttl_ms: i64) -> i64 {
    ttl_ms.clamp(MIN_TTL_MS, MAX_TTL_MS)
}

pub struct LeaseTable {
    leases: DashMap<String, Lease>,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self {
            leases: DashMap::new(),
        }
    }

    /// Acquire fails with `locked_by_other` (carried as `E_BUSY`, since a
    /// live lease held by a different owner is a transient condition the
    /// caller can retry once the holder releases or the lease expires) when
    /// a live lease with a different owner exists.
    pub fn acquire(&self, tab_id: &str, owner: &str, ttl_ms: i64, now: i64) -> Result<Lease> {
        let ttl_ms = clamp_ttl(ttl_ms);
        if let Some(existing) = self.leases.get(tab_id) {
            if existing.is_live_at(now) && existing.owner != owner {
                return Err(RuntimeError::busy("locked_by_other").with_details(
                    serde_json::json!({ "reason": "locked_by_other", "ownedBy": existing.owner }),
                ));
            }
        }
        let lease = Lease {
            tab_id: tab_id.to_string(),
            owner: owner.to_string(),
            lease_id: Uuid::new_v4().to_string(),
            created_at: now,
            heartbeat_at: now,
            expires_at: now + ttl_ms,
        };
        self.leases.insert(tab_id.to_string(), lease.clone());
        Ok(lease)
    }

    pub fn heartbeat(&self, tab_id: &str, owner: &str, ttl_ms: i64, now: i64) -> Result<Lease> {
        let ttl_ms = clamp_ttl(ttl_ms);
        let mut entry = self
            .leases
            .get_mut(tab_id)
            .ok_or_else(|| RuntimeError::args("no lease held for this tab"))?;
        if entry.owner != owner {
            return Err(RuntimeError::busy("locked_by_other"));
        }
        entry.heartbeat_at = now;
        entry.expires_at = now + ttl_ms;
        Ok(entry.clone())
    }

    /// Releasing a lease that doesn't exist (or already expired) is not an
    /// error — it returns `released:false, reason:"not_locked"` per the
    /// lease-idempotence law (SPEC_FULL §8).
    pub fn release(&self, tab_id: &str, owner: &str, now: i64) -> (bool, Option<&'static str>) {
        match self.leases.get(tab_id) {
            Some(entry) if entry.is_live_at(now) && entry.owner == owner => {
                drop(entry);
                self.leases.remove(tab_id);
                (true, None)
            }
            Some(entry) if entry.is_live_at(now) => (false, Some("locked_by_other")),
            _ => (false, Some("not_locked")),
        }
    }

    pub fn status(&self, tab_id: &str, now: i64) -> Option<Lease> {
        self.leases
            .get(tab_id)
            .filter(|l| l.is_live_at(now))
            .map(|l| l.clone())
    }

    /// A live lease held by `owner`, used to gate mutating CDP actions.
    pub fn is_held_by(&self, tab_id: &str, owner: &str, now: i64) -> bool {
        self.leases
            .get(tab_id)
            .map(|l| l.is_live_at(now) && l.owner == owner)
            .unwrap_or(false)
    }

    /// Unconditionally drop any lease on `tab_id`, used when the debugger
    /// detaches or the tab closes (SPEC_FULL §4.1 failure semantics).
    pub fn clear(&self, tab_id: &str) {
        self.leases.remove(tab_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_blocks_other_owner_while_live() {
        let table = LeaseTable::new();
        table.acquire("tab1", "a", 10_000, 0).unwrap();
        let err = table.acquire("tab1", "b", 10_000, 1_000).unwrap_err();
        assert_eq!(err.details.unwrap()["reason"], "locked_by_other");
    }

    #[test]
    fn acquire_succeeds_after_expiry() {
        let table = LeaseTable::new();
        table.acquire("tab1", "a", 2_000, 0).unwrap();
        let lease = table.acquire("tab1", "b", 2_000, 5_000).unwrap();
        assert_eq!(lease.owner, "b");
    }

    #[test]
    fn heartbeat_extends_expiry() {
        let table = LeaseTable::new();
        table.acquire("tab1", "a", 10_000, 0).unwrap();
        let lease = table.heartbeat("tab1", "a", 10_000, 5_000).unwrap();
        assert_eq!(lease.expires_at, 15_000);
    }

    #[test]
    fn ttl_is_clamped() {
        let table = LeaseTable::new();
        let lease = table.acquire("tab1", "a", 1, 0).unwrap();
        assert_eq!(lease.expires_at, MIN_TTL_MS);
        let lease2 = table.acquire("tab2", "a", 10_000_000, 0).unwrap();
        assert_eq!(lease2.expires_at, MAX_TTL_MS);
    }

    #[test]
    fn release_unknown_lease_is_not_locked() {
        let table = LeaseTable::new();
        let (released, reason) = table.release("tabX", "a", 0);
        assert!(!released);
        assert_eq!(reason, Some("not_locked"));
    }
}
