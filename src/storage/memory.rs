use super::SnapshotStore;
use crate::core::{EntityId, Result, StateError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::watch;

/// Snapshot store kept entirely in process memory.
///
/// Used by embedders that persist elsewhere and by tests, which can inject
/// write failures and hold writes in flight.
pub struct MemorySnapshotStore {
    units: DashMap<EntityId, Vec<u8>>,
    failing_ids: Mutex<HashSet<EntityId>>,
    fail_all: AtomicBool,
    writes: AtomicU64,
    reads: AtomicU64,
    /// `true` while writes may proceed.
    gate: watch::Sender<bool>,
    held_writes: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            units: DashMap::new(),
            failing_ids: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            gate,
            held_writes: AtomicUsize::new(0),
        }
    }

    pub fn insert_raw(&self, id: EntityId, bytes: Vec<u8>) {
        self.units.insert(id, bytes);
    }

    pub fn get_raw(&self, id: &EntityId) -> Option<Vec<u8>> {
        self.units.get(id).map(|unit| unit.value().clone())
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.units.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn fail_writes_for(&self, id: EntityId) {
        self.failing_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id);
    }

    pub fn fail_all_writes(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn clear_failures(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
        self.failing_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Parks every subsequent write until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(true);
    }

    /// Number of writes currently parked by [`hold_writes`](Self::hold_writes).
    pub fn held_write_count(&self) -> usize {
        self.held_writes.load(Ordering::SeqCst)
    }

    fn should_fail(&self, id: &EntityId) -> bool {
        self.fail_all.load(Ordering::SeqCst)
            || self
                .failing_ids
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(id)
    }
}

/// Counts a parked write for as long as it lives, including when the write is cancelled.
struct HeldWrite<'a>(&'a AtomicUsize);

impl<'a> HeldWrite<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for HeldWrite<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn read(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get_raw(id))
    }

    async fn write(&self, id: &EntityId, bytes: Vec<u8>) -> Result<()> {
        let mut gate = self.gate.subscribe();
        if !*gate.borrow() {
            let _held = HeldWrite::new(&self.held_writes);
            let _ = gate.wait_for(|open| *open).await;
        }

        if self.should_fail(id) {
            return Err(StateError::WriteError(
                id.to_string(),
                "injected write failure".to_string(),
            ));
        }
        self.units.insert(*id, bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, id: &EntityId) -> Result<bool> {
        Ok(self.units.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<EntityId>> {
        let mut ids = self.units.iter().map(|unit| *unit.key()).collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_injected_failure_keeps_previous_unit() {
        let store = MemorySnapshotStore::new();
        let id = EntityId::new_random();
        store.write(&id, vec![1]).await.unwrap();

        store.fail_writes_for(id);
        assert!(store.write(&id, vec![2]).await.is_err());
        assert_eq!(store.get_raw(&id), Some(vec![1]));

        store.clear_failures();
        store.write(&id, vec![3]).await.unwrap();
        assert_eq!(store.get_raw(&id), Some(vec![3]));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_held_writes_wait_for_release() {
        let store = Arc::new(MemorySnapshotStore::new());
        let id = EntityId::new_random();
        store.hold_writes();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.write(&id, vec![7]).await })
        };

        while store.held_write_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!store.contains(&id));

        store.release_writes();
        writer.await.unwrap().unwrap();
        assert_eq!(store.get_raw(&id), Some(vec![7]));
    }
}
