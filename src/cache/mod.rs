//! Concurrent identity → record cache with load-on-miss, dirty tracking and eviction.

pub mod entry;
pub mod stats;

pub use entry::{EntityEntry, EntityHandle};
pub use stats::{CacheStats, EvictionReport};

use crate::codec::PersistenceCodec;
use crate::config::CacheConfig;
use crate::core::{EntityId, EntityRecord, Result, StateError};
use crate::storage::{FsSnapshotStore, SnapshotStore};
use chrono::Utc;
use dashmap::DashMap;
use entry::DirtyQueue;
use stats::CacheCounters;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, TryLockError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{Instrument, Level, event, info_span};

/// Storage reads attempted before a miss falls back to defaults.
const READ_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Receives notifications about cached entities.
///
/// Called synchronously on the mutating task, so implementations must be quick
/// and must not call back into the cache for the same identity.
pub trait CacheObserver: Send + Sync {
    /// The record was mutated through [`EntityCache::update`].
    fn on_mutated(&self, id: &EntityId, record: &EntityRecord);

    /// The entity was flushed and removed from memory.
    fn on_evicted(&self, id: &EntityId);
}

/// Load coordination point: concurrent first `get`s for one id share the cell.
struct EntitySlot {
    cell: OnceCell<EntityHandle>,
}

impl EntitySlot {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }
}

pub struct EntityCache {
    slots: DashMap<EntityId, Arc<EntitySlot>>,
    store: Arc<dyn SnapshotStore>,
    codec: PersistenceCodec,
    config: CacheConfig,
    dirty: Arc<DirtyQueue>,
    counters: CacheCounters,
    observers: RwLock<Vec<Arc<dyn CacheObserver>>>,
}

impl EntityCache {
    /// Opens a cache backed by snapshot files under `config.data_dir`.
    pub fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let store = FsSnapshotStore::open(&config.data_dir, config.fsync)?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: CacheConfig, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            slots: DashMap::new(),
            store,
            codec: PersistenceCodec::new(),
            config,
            dirty: Arc::new(DirtyQueue::default()),
            counters: CacheCounters::default(),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn codec(&self) -> &PersistenceCodec {
        &self.codec
    }

    pub fn add_observer(&self, observer: Arc<dyn CacheObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn CacheObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the live record handle, loading it on first use.
    ///
    /// Never fails: a missing snapshot yields a default record, an unreadable
    /// one yields a default record and a warning. Cache hits do no I/O.
    pub async fn get(&self, id: EntityId) -> EntityHandle {
        loop {
            let slot = self
                .slots
                .entry(id)
                .or_insert_with(|| Arc::new(EntitySlot::new()))
                .value()
                .clone();

            let handle = slot.cell.get_or_init(|| self.load_entry(id)).await.clone();

            // An eviction may have retired this slot while we were loading.
            if self.slot_is_current(&id, &slot) && !handle.is_evicted() {
                handle.touch();
                return handle;
            }
        }
    }

    /// Returns the handle only if the entity is already resident. Never does I/O.
    pub fn get_cached(&self, id: &EntityId) -> Option<EntityHandle> {
        let handle = self.peek(id)?;
        handle.touch();
        Some(handle)
    }

    /// Resident handle without counting as an access.
    pub(crate) fn peek(&self, id: &EntityId) -> Option<EntityHandle> {
        self.slots.get(id)?.value().cell.get().cloned()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.value().cell.initialized())
    }

    fn slot_is_current(&self, id: &EntityId, slot: &Arc<EntitySlot>) -> bool {
        self.slots
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    async fn load_entry(&self, id: EntityId) -> EntityHandle {
        let (record, fallback) = self
            .load_record(id)
            .instrument(info_span!("entity.load", entity_id = %id))
            .await;
        Arc::new(EntityEntry::new(id, record, self.dirty.clone(), fallback))
    }

    /// Retries transient read errors; `Err` only once every attempt failed.
    async fn read_snapshot(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        let mut attempt = 1;
        loop {
            match self.store.read(id).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt >= READ_ATTEMPTS => return Err(err),
                Err(err) => {
                    event!(Level::DEBUG, attempt, error = %err, "snapshot read failed; retrying");
                    tokio::time::sleep(READ_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Returns the record and whether it is a fallback for an unreadable unit.
    async fn load_record(&self, id: EntityId) -> (EntityRecord, bool) {
        let bytes = match self.read_snapshot(&id).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                CacheCounters::bump(&self.counters.created_defaults);
                event!(Level::DEBUG, "no snapshot; starting from defaults");
                return (EntityRecord::default(), false);
            }
            Err(err) => {
                CacheCounters::bump(&self.counters.read_failures);
                event!(Level::WARN, error = %err, "snapshot read failed; starting from defaults");
                if let Err(err) = self.store.quarantine(&id).await {
                    event!(Level::WARN, error = %err, "failed to quarantine unreadable snapshot");
                }
                return (EntityRecord::default(), true);
            }
        };

        match self.codec.decode(&bytes) {
            Ok(decoded) => {
                CacheCounters::bump(&self.counters.loads);
                if !decoded.dropped.is_empty() {
                    CacheCounters::add(&self.counters.dropped_entries, decoded.dropped.len() as u64);
                    event!(
                        Level::WARN,
                        dropped = decoded.dropped.len(),
                        version = decoded.version,
                        "snapshot loaded with unreadable entries"
                    );
                }
                event!(Level::DEBUG, version = decoded.version, "snapshot loaded");
                (decoded.record, false)
            }
            Err(err) => {
                CacheCounters::bump(&self.counters.decode_failures);
                event!(Level::WARN, error = %err, "unreadable snapshot; starting from defaults");
                if let Err(err) = self.store.quarantine(&id).await {
                    event!(Level::WARN, error = %err, "failed to quarantine unreadable snapshot");
                }
                (EntityRecord::default(), false)
            }
        }
    }

    /// Flags the entity for the next flush and refreshes observers.
    /// Returns `false` if it is not resident.
    ///
    /// Call after the write guard is released; observers are skipped while it is held.
    pub fn mark_dirty(&self, id: &EntityId) -> bool {
        match self.peek(id) {
            Some(handle) => {
                handle.mark_dirty();
                if !handle.is_evicted() {
                    self.try_notify_mutated(&handle);
                }
                true
            }
            None => {
                event!(Level::DEBUG, entity_id = %id, "mark_dirty for an entity that is not cached");
                false
            }
        }
    }

    pub fn is_dirty(&self, id: &EntityId) -> bool {
        self.peek(id).is_some_and(|handle| handle.is_dirty())
    }

    /// Mutates the record under its write lock and marks it dirty before returning.
    pub async fn update<R>(&self, id: EntityId, mutate: impl FnOnce(&mut EntityRecord) -> R) -> R {
        loop {
            let handle = self.get(id).await;
            let mut guard = handle.write();
            if handle.is_evicted() {
                // Evicted between lookup and lock; reload the flushed state.
                drop(guard);
                continue;
            }
            let result = mutate(&mut guard);
            handle.bump_generation();
            drop(guard);
            handle.enqueue();
            self.notify_mutated(&handle);
            return result;
        }
    }

    /// Like [`update`](Self::update) but only for resident entities; never does I/O.
    pub fn update_cached<R>(
        &self,
        id: &EntityId,
        mutate: impl FnOnce(&mut EntityRecord) -> R,
    ) -> Option<R> {
        let handle = self.get_cached(id)?;
        let mut guard = handle.write();
        if handle.is_evicted() {
            return None;
        }
        let result = mutate(&mut guard);
        handle.bump_generation();
        drop(guard);
        handle.enqueue();
        self.notify_mutated(&handle);
        Some(result)
    }

    fn notify_mutated(&self, handle: &EntityHandle) {
        let observers = self.observers();
        if observers.is_empty() {
            return;
        }
        let record = handle.read();
        for observer in &observers {
            observer.on_mutated(&handle.id(), &record);
        }
    }

    /// Like `notify_mutated`, but gives up if the record is write-locked.
    fn try_notify_mutated(&self, handle: &EntityHandle) {
        let observers = self.observers();
        if observers.is_empty() {
            return;
        }
        let record = match handle.record_lock().try_read() {
            Ok(record) => record,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                event!(
                    Level::DEBUG,
                    entity_id = %handle.id(),
                    "record still locked; observers not refreshed"
                );
                return;
            }
        };
        for observer in &observers {
            observer.on_mutated(&handle.id(), &record);
        }
    }

    /// Point-in-time list of resident entities.
    ///
    /// Entities loaded or evicted afterwards are not reflected; records may keep
    /// changing through the returned handles.
    pub fn all_cached(&self) -> Vec<EntityHandle> {
        self.slots
            .iter()
            .filter_map(|slot| slot.value().cell.get().cloned())
            .collect()
    }

    /// Cloned records of every resident entity, for aggregate reporting.
    pub fn snapshot_all(&self) -> Vec<(EntityId, EntityRecord)> {
        self.all_cached()
            .into_iter()
            .map(|handle| (handle.id(), handle.snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Writes the entity now, dirty or not. Returns `false` if it is not resident.
    pub async fn save_now(&self, id: &EntityId) -> Result<bool> {
        let Some(handle) = self.peek(id) else {
            return Ok(false);
        };
        self.persist_entry(&handle).await?;
        Ok(true)
    }

    /// Flushes the entity and drops it from memory.
    ///
    /// Returns `false` if it was not resident or was mutated again during the
    /// flush, in which case it stays cached and queued.
    pub async fn evict(&self, id: &EntityId) -> Result<bool> {
        let Some(slot) = self.slots.get(id).map(|slot| slot.value().clone()) else {
            return Ok(false);
        };
        let Some(handle) = slot.cell.get().cloned() else {
            return Ok(false);
        };

        self.persist_entry(&handle).await?;

        let removed = {
            // Holding the record lock keeps mutators out between the check and the removal.
            let _guard = handle.record_lock().write().unwrap_or_else(PoisonError::into_inner);
            let removed = self
                .slots
                .remove_if(id, |_, current| {
                    Arc::ptr_eq(current, &slot) && !handle.is_dirty()
                })
                .is_some();
            if removed {
                handle.set_evicted();
            }
            removed
        };

        if !removed {
            event!(Level::DEBUG, entity_id = %id, "entity changed during eviction; kept resident");
            return Ok(false);
        }

        CacheCounters::bump(&self.counters.evictions);
        for observer in self.observers() {
            observer.on_evicted(id);
        }
        event!(Level::DEBUG, entity_id = %id, "entity evicted");
        Ok(true)
    }

    /// Evicts entities idle longer than `idle_after`, then the least recently
    /// used ones while more than `max_cached` remain.
    pub async fn evict_idle(
        &self,
        idle_after: Option<Duration>,
        max_cached: Option<usize>,
    ) -> EvictionReport {
        let now_ms = Utc::now().timestamp_millis();
        let mut candidates = self
            .all_cached()
            .into_iter()
            .map(|handle| (handle.id(), handle.last_access_ms()))
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut selected = Vec::new();
        let mut chosen = HashSet::new();
        if let Some(idle_after) = idle_after {
            let idle_ms = idle_after.as_millis() as i64;
            for (id, last_access) in &candidates {
                if now_ms - last_access >= idle_ms {
                    selected.push(*id);
                    chosen.insert(*id);
                }
            }
        }
        if let Some(max) = max_cached {
            let resident_after_idle = candidates.len().saturating_sub(selected.len());
            let mut extra = resident_after_idle.saturating_sub(max);
            for (id, _) in &candidates {
                if extra == 0 {
                    break;
                }
                if chosen.insert(*id) {
                    selected.push(*id);
                    extra -= 1;
                }
            }
        }

        let mut report = EvictionReport::default();
        for id in selected {
            match self.evict(&id).await {
                Ok(true) => report.evicted += 1,
                Ok(false) => report.kept_dirty += 1,
                Err(_) => report.failed += 1,
            }
        }
        if report.evicted > 0 || report.failed > 0 {
            event!(
                Level::INFO,
                evicted = report.evicted,
                kept_dirty = report.kept_dirty,
                failed = report.failed,
                "eviction pass finished"
            );
        }
        report
    }

    /// Eviction pass using the configured idle timeout and size cap.
    pub async fn run_eviction_pass(&self) -> EvictionReport {
        self.evict_idle(self.config.idle_evict_after(), self.config.max_cached)
            .await
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            cached: self.slots.len(),
            dirty_queued: self.dirty.len(),
            loads: CacheCounters::get(&c.loads),
            created_defaults: CacheCounters::get(&c.created_defaults),
            decode_failures: CacheCounters::get(&c.decode_failures),
            read_failures: CacheCounters::get(&c.read_failures),
            dropped_entries: CacheCounters::get(&c.dropped_entries),
            writes: CacheCounters::get(&c.writes),
            write_failures: CacheCounters::get(&c.write_failures),
            evictions: CacheCounters::get(&c.evictions),
            flush_cycles: CacheCounters::get(&c.flush_cycles),
        }
    }

    /// Swaps out the dirty queue for a fresh one.
    pub(crate) fn take_dirty(&self) -> HashSet<EntityId> {
        self.dirty.take()
    }

    pub(crate) fn record_flush_cycle(&self) {
        CacheCounters::bump(&self.counters.flush_cycles);
    }

    /// Encodes the entity under its read lock, then writes without holding it.
    ///
    /// On success everything captured is marked durable; on failure the entity
    /// is queued again for the next cycle. Returns `false` when nothing was
    /// written because the entry is an unmutated fallback.
    pub(crate) async fn persist_entry(&self, handle: &EntityHandle) -> Result<bool> {
        let id = handle.id();
        let _io = handle.io_lock.lock().await;
        if handle.is_fallback() && handle.mutation_generation() == 0 {
            event!(Level::DEBUG, entity_id = %id, "unmutated fallback record; not written");
            return Ok(false);
        }
        let (bytes, generation) = {
            let record = handle.read();
            (self.codec.encode(&record), handle.mutation_generation())
        };

        let write = self
            .store
            .write(&id, bytes)
            .instrument(info_span!("entity.persist", entity_id = %id, generation))
            .await;

        match write {
            Ok(()) => {
                handle.mark_persisted(generation);
                CacheCounters::bump(&self.counters.writes);
                event!(Level::DEBUG, entity_id = %id, generation, "snapshot written");
                Ok(true)
            }
            Err(err) => {
                CacheCounters::bump(&self.counters.write_failures);
                if handle.is_dirty() {
                    handle.enqueue();
                }
                event!(Level::WARN, entity_id = %id, error = %err, "snapshot write failed; will retry");
                Err(match err {
                    StateError::WriteError(..) => err,
                    other => StateError::WriteError(id.to_string(), other.to_string()),
                })
            }
        }
    }
}
