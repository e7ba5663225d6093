//! Derived fast-lookup views of record fields, kept in step with the cache and auditable.

pub mod worker;

pub use worker::{AuditAction, MirrorAuditWorker, spawn_mirror_auditor};

use crate::cache::{CacheObserver, EntityCache};
use crate::core::{EntityId, EntityRecord};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{Level, event};

/// Maps a record to the view a mirror keeps for it.
pub trait MirrorProjection: Send + Sync + 'static {
    type View: Clone + PartialEq + Debug + Send + Sync + 'static;

    fn project(&self, record: &EntityRecord) -> Self::View;

    /// Vacant views are not stored; a lookup for them returns `None`.
    fn is_vacant(&self, _view: &Self::View) -> bool {
        false
    }
}

/// Advisory projection of one record field per identity.
///
/// The record stays authoritative: decisions that must be correct should
/// re-check it. Once attached, entries are refreshed by `EntityCache::update`
/// and `EntityCache::mark_dirty`; raw handle writes that skip both drift until
/// the next audit.
pub struct ConsistencyMirror<P: MirrorProjection> {
    projection: P,
    entries: DashMap<EntityId, P::View>,
}

impl<P: MirrorProjection> ConsistencyMirror<P> {
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            entries: DashMap::new(),
        }
    }

    /// Creates a mirror, seeds it from every resident record and registers it
    /// as a cache observer.
    pub fn attached(cache: &EntityCache, projection: P) -> Arc<Self> {
        let mirror = Arc::new(Self::new(projection));
        cache.add_observer(mirror.clone());
        for handle in cache.all_cached() {
            let record = handle.read();
            mirror.sync_record(&handle.id(), &record);
        }
        mirror
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn lookup(&self, id: &EntityId) -> Option<P::View> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Recomputes the entry from `record`.
    pub fn sync_record(&self, id: &EntityId, record: &EntityRecord) {
        let view = self.projection.project(record);
        if self.projection.is_vacant(&view) {
            self.entries.remove(id);
        } else {
            self.entries.insert(*id, view);
        }
    }

    /// Recomputes the entry from the live record, loading it if needed.
    pub async fn sync(&self, cache: &EntityCache, id: EntityId) -> Option<P::View> {
        let handle = cache.get(id).await;
        let record = handle.read();
        self.sync_record(&id, &record);
        drop(record);
        self.lookup(&id)
    }

    pub fn forget(&self, id: &EntityId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identities whose entry disagrees with the resident record, sorted.
    ///
    /// Covers stale values, resident records with a missing entry, and entries
    /// for identities no longer cached. Nothing is repaired.
    pub fn audit(&self, cache: &EntityCache) -> Vec<EntityId> {
        let mut drifted = Vec::new();
        let mut resident = HashSet::new();

        for handle in cache.all_cached() {
            let id = handle.id();
            resident.insert(id);
            let expected = {
                let record = handle.read();
                self.projection.project(&record)
            };
            let consistent = match self.entries.get(&id) {
                Some(entry) => *entry.value() == expected,
                None => self.projection.is_vacant(&expected),
            };
            if !consistent {
                drifted.push(id);
            }
        }

        for entry in self.entries.iter() {
            if !resident.contains(entry.key()) {
                drifted.push(*entry.key());
            }
        }

        drifted.sort();
        drifted.dedup();
        drifted
    }

    /// Audits and repairs every drifted entry. Returns how many were repaired.
    pub fn resync_all(&self, cache: &EntityCache) -> usize {
        let drifted = self.audit(cache);
        for id in &drifted {
            match cache.peek(id) {
                Some(handle) => {
                    let record = handle.read();
                    self.sync_record(id, &record);
                }
                None => {
                    self.entries.remove(id);
                }
            }
        }
        if !drifted.is_empty() {
            event!(Level::INFO, repaired = drifted.len(), "mirror resynced");
        }
        drifted.len()
    }
}

impl<P: MirrorProjection> CacheObserver for ConsistencyMirror<P> {
    fn on_mutated(&self, id: &EntityId, record: &EntityRecord) {
        self.sync_record(id, record);
    }

    fn on_evicted(&self, id: &EntityId) {
        self.forget(id);
    }
}

/// Projects granted capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityProjection;

impl MirrorProjection for CapabilityProjection {
    type View = BTreeSet<String>;

    fn project(&self, record: &EntityRecord) -> Self::View {
        record.capabilities.clone()
    }

    fn is_vacant(&self, view: &Self::View) -> bool {
        view.is_empty()
    }
}

pub type CapabilityMirror = ConsistencyMirror<CapabilityProjection>;

impl ConsistencyMirror<CapabilityProjection> {
    /// Fast advisory check; `false` for identities the mirror does not know.
    pub fn has_capability(&self, id: &EntityId, capability: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.value().contains(capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vacant_view_is_not_stored() {
        let mirror = CapabilityMirror::new(CapabilityProjection);
        let id = EntityId::new_random();
        let mut record = EntityRecord::new();
        record.grant("fly");

        mirror.sync_record(&id, &record);
        assert!(mirror.has_capability(&id, "fly"));

        record.revoke("fly");
        mirror.sync_record(&id, &record);
        assert!(mirror.lookup(&id).is_none());
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_observer_tracks_mutations_and_evictions() {
        let mirror = CapabilityMirror::new(CapabilityProjection);
        let id = EntityId::new_random();
        let mut record = EntityRecord::new();
        record.grant("chat");

        mirror.on_mutated(&id, &record);
        assert!(mirror.has_capability(&id, "chat"));
        assert!(!mirror.has_capability(&id, "ban"));

        mirror.on_evicted(&id);
        assert!(!mirror.has_capability(&id, "chat"));
    }
}
