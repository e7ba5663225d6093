use crate::core::{EntityId, EntityRecord};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{Level, event};

/// Shared handle to a cached entity. Cloning is cheap.
pub type EntityHandle = Arc<EntityEntry>;

/// Identities waiting for the next flush cycle.
///
/// Collecting swaps the whole set out, so a mark that lands while a cycle is
/// writing goes into the fresh set and is picked up by the following cycle.
#[derive(Debug, Default)]
pub(crate) struct DirtyQueue {
    ids: Mutex<HashSet<EntityId>>,
}

impl DirtyQueue {
    pub(crate) fn push(&self, id: EntityId) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub(crate) fn take(&self) -> HashSet<EntityId> {
        std::mem::take(&mut *self.ids.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &EntityId) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

/// The single live instance of one entity's state.
///
/// Dirtiness is tracked with two generations: `mutation_gen` grows on every
/// mark, `persisted_gen` is the highest generation known to be on disk. The
/// entry is dirty while the first exceeds the second.
#[derive(Debug)]
pub struct EntityEntry {
    id: EntityId,
    record: RwLock<EntityRecord>,
    mutation_gen: AtomicU64,
    persisted_gen: AtomicU64,
    last_access_ms: AtomicI64,
    evicted: AtomicBool,
    /// Loaded from defaults because storage could not be read.
    fallback: bool,
    /// Serializes snapshot writes of this entity so an older capture never lands last.
    pub(crate) io_lock: tokio::sync::Mutex<()>,
    queue: Arc<DirtyQueue>,
}

impl EntityEntry {
    pub(crate) fn new(
        id: EntityId,
        record: EntityRecord,
        queue: Arc<DirtyQueue>,
        fallback: bool,
    ) -> Self {
        Self {
            id,
            record: RwLock::new(record),
            mutation_gen: AtomicU64::new(0),
            persisted_gen: AtomicU64::new(0),
            last_access_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            evicted: AtomicBool::new(false),
            fallback,
            io_lock: tokio::sync::Mutex::new(()),
            queue,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Shared access to the record.
    ///
    /// A mutator that panicked leaves the lock poisoned; the state it left
    /// behind is still served rather than failing every later reader.
    pub fn read(&self) -> RwLockReadGuard<'_, EntityRecord> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the record. Call [`mark_dirty`](Self::mark_dirty)
    /// after mutating, or use `EntityCache::update` which does both.
    pub fn write(&self) -> RwLockWriteGuard<'_, EntityRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clone of the current record.
    pub fn snapshot(&self) -> EntityRecord {
        self.read().clone()
    }

    pub fn mark_dirty(&self) {
        if self.is_evicted() {
            event!(
                Level::WARN,
                entity_id = %self.id,
                "mark_dirty on an evicted handle; the change will not be persisted"
            );
            return;
        }
        self.bump_generation();
        self.queue.push(self.id);
    }

    pub fn is_dirty(&self) -> bool {
        self.mutation_gen.load(Ordering::SeqCst) > self.persisted_gen.load(Ordering::SeqCst)
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// `true` if storage failed to read and the record started from defaults.
    ///
    /// Such an entry is never written back until it has been mutated, so the
    /// unit it could not read stays intact.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn mutation_generation(&self) -> u64 {
        self.mutation_gen.load(Ordering::SeqCst)
    }

    pub fn last_access_ms(&self) -> i64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.last_access_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Must be called while the record write lock is held when the mutation
    /// happened under it, so a concurrent capture sees both or neither.
    pub(crate) fn bump_generation(&self) -> u64 {
        self.mutation_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn enqueue(&self) {
        self.queue.push(self.id);
    }

    /// Records that everything up to `generation` is durable.
    pub(crate) fn mark_persisted(&self, generation: u64) {
        self.persisted_gen.fetch_max(generation, Ordering::SeqCst);
    }

    pub(crate) fn set_evicted(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn record_lock(&self) -> &RwLock<EntityRecord> {
        &self.record
    }
}
