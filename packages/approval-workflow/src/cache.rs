//! TTL cache of built state machines, keyed by instance id.
//!
//! An entry is served only while `now - last_access < ttl`; each hit refreshes
//! `last_access`. Expired entries are dropped lazily on lookup or eagerly via
//! [`MachineCache::purge_expired`]. The persisted status stays authoritative:
//! the engine invalidates an entry after every committed transition.
//!
//! # Generations
//!
//! Each instance has a generation that [`MachineCache::invalidate`] bumps.
//! A loader reads [`MachineCache::generation`] before going to storage and
//! passes it to [`MachineCache::insert`]; if an invalidation happened in
//! between, the machine was built from a read that may predate the commit
//! and is not cached.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::states::ReimbursementMachine;

/// Default time-to-live of a cached machine.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// A cached machine plus the instance's external id.
#[derive(Debug, Clone)]
pub struct CachedMachine {
    pub machine: ReimbursementMachine,
    pub external_instance_id: String,
    last_access: Instant,
}

impl CachedMachine {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_access) < ttl
    }
}

#[derive(Debug)]
pub struct MachineCache {
    entries: DashMap<i64, CachedMachine>,
    generations: DashMap<i64, u64>,
    ttl: Duration,
}

impl MachineCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh entry for `instance_id`, refreshing its access time.
    pub fn get(&self, instance_id: i64) -> Option<CachedMachine> {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(&instance_id)?;
            if entry.is_fresh(now, self.ttl) {
                entry.last_access = now;
                return Some(entry.clone());
            }
        }

        // Shard lock released above; a concurrent insert may have refreshed it.
        self.entries
            .remove_if(&instance_id, |_, entry| !entry.is_fresh(now, self.ttl));
        None
    }

    /// Current generation of `instance_id`. Read it before loading from storage.
    pub fn generation(&self, instance_id: i64) -> u64 {
        self.generations
            .get(&instance_id)
            .map_or(0, |generation| *generation)
    }

    /// Cache `machine` unless `instance_id` was invalidated since `generation`
    /// was read. Returns whether the machine was stored.
    pub fn insert(
        &self,
        instance_id: i64,
        machine: ReimbursementMachine,
        external_instance_id: impl Into<String>,
        generation: u64,
    ) -> bool {
        // The entry's shard lock is held across the check, so an invalidate
        // that bumps after the check removes this entry afterwards.
        let entry = self.entries.entry(instance_id);
        if self.generation(instance_id) != generation {
            return false;
        }
        entry.insert(CachedMachine {
            machine,
            external_instance_id: external_instance_id.into(),
            last_access: Instant::now(),
        });
        true
    }

    /// Drop the entry for `instance_id` and reject in-flight loads that read
    /// before this call. Returns whether an entry existed.
    pub fn invalidate(&self, instance_id: i64) -> bool {
        *self.generations.entry(instance_id).or_insert(0) += 1;
        self.entries.remove(&instance_id).is_some()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now, self.ttl));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MachineCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::{reimbursement_blueprint, State};

    fn machine(state: State) -> ReimbursementMachine {
        reimbursement_blueprint().build(state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_refreshes_access() {
        let cache = MachineCache::new(Duration::from_secs(60));
        cache.insert(1, machine(State::Pending), "ext-1", 0);

        tokio::time::advance(Duration::from_secs(45)).await;
        let hit = cache.get(1).unwrap();
        assert_eq!(hit.machine.state(), State::Pending);
        assert_eq!(hit.external_instance_id, "ext-1");

        // 45s after the refresh: still fresh, 90s after insert
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(cache.get(1).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_dropped_on_lookup() {
        let cache = MachineCache::new(Duration::from_secs(60));
        cache.insert(1, machine(State::Created), "ext-1", 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_fresh_entries() {
        let cache = MachineCache::new(Duration::from_secs(60));
        cache.insert(1, machine(State::Created), "ext-1", 0);
        tokio::time::advance(Duration::from_secs(40)).await;
        cache.insert(2, machine(State::Approved), "ext-2", 0);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn test_invalidate() {
        let cache = MachineCache::default();
        assert_eq!(cache.ttl(), DEFAULT_CACHE_TTL);

        assert!(cache.insert(7, machine(State::InReview), "ext-7", 0));
        assert!(cache.invalidate(7));
        assert!(!cache.invalidate(7));
        assert!(cache.get(7).is_none());
    }

    #[test]
    fn test_insert_after_invalidation_is_rejected() {
        let cache = MachineCache::default();

        // A loader reads the generation, then a commit invalidates.
        let seen = cache.generation(3);
        cache.invalidate(3);
        assert_eq!(cache.generation(3), seen + 1);

        assert!(!cache.insert(3, machine(State::Created), "ext-3", seen));
        assert!(cache.get(3).is_none());

        // A load that starts after the invalidation is cached normally.
        let current = cache.generation(3);
        assert!(cache.insert(3, machine(State::Pending), "ext-3", current));
        assert_eq!(cache.get(3).unwrap().machine.state(), State::Pending);
    }

    #[test]
    fn test_invalidating_one_instance_keeps_others_cacheable() {
        let cache = MachineCache::default();
        let seen = cache.generation(1);
        cache.invalidate(2);
        assert!(cache.insert(1, machine(State::Approved), "ext-1", seen));
    }
}
