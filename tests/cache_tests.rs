use async_trait::async_trait;
use statecache::{
    CacheConfig, EntityCache, EntityId, EntityRecord, FlushScheduler, FsSnapshotStore,
    MemorySnapshotStore, PersistenceCodec, Result, SnapshotStore, StateError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;

fn memory_cache() -> (Arc<EntityCache>, Arc<MemorySnapshotStore>) {
    let store = Arc::new(MemorySnapshotStore::new());
    let cache = EntityCache::with_store(CacheConfig::default(), store.clone()).unwrap();
    (Arc::new(cache), store)
}

fn stored_record(store: &MemorySnapshotStore, id: &EntityId) -> EntityRecord {
    let bytes = store.get_raw(id).expect("snapshot should exist");
    PersistenceCodec::new().decode(&bytes).unwrap().record
}

#[tokio::test]
async fn get_unknown_identity_returns_default_without_writing() {
    let (cache, store) = memory_cache();
    let id = EntityId::from_name("newcomer");

    let handle = cache.get(id).await;

    assert_eq!(handle.snapshot(), EntityRecord::default());
    assert!(!handle.is_dirty());
    assert!(cache.contains(&id));
    assert!(store.is_empty());
    assert_eq!(cache.stats().created_defaults, 1);
}

#[tokio::test]
async fn get_loads_existing_snapshot() {
    let (cache, store) = memory_cache();
    let id = EntityId::new_random();
    let mut record = EntityRecord::new();
    record.balance = 100;
    record.grant("chat");
    store.insert_raw(id, PersistenceCodec::new().encode(&record));

    let handle = cache.get(id).await;

    assert_eq!(handle.snapshot(), record);
    assert_eq!(cache.stats().loads, 1);
}

#[tokio::test]
async fn concurrent_gets_share_one_instance() {
    let (cache, store) = memory_cache();
    let id = EntityId::new_random();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move { cache.get(id).await }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }

    let first = &handles[0];
    assert!(handles.iter().all(|handle| Arc::ptr_eq(handle, first)));
    assert_eq!(store.read_count(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn update_marks_dirty_before_returning() {
    let (cache, _store) = memory_cache();
    let id = EntityId::new_random();

    let balance = cache.update(id, |record| record.add_balance(25)).await;

    assert_eq!(balance, 25);
    assert!(cache.is_dirty(&id));
    assert_eq!(cache.stats().dirty_queued, 1);
    assert_eq!(cache.get(id).await.read().balance, 25);
}

#[tokio::test]
async fn mark_dirty_after_raw_handle_write() {
    let (cache, _store) = memory_cache();
    let id = EntityId::new_random();

    let handle = cache.get(id).await;
    handle.write().add_experience(10);
    assert!(!cache.is_dirty(&id));

    assert!(cache.mark_dirty(&id));
    assert!(cache.mark_dirty(&id));
    assert!(cache.is_dirty(&id));
    assert_eq!(cache.stats().dirty_queued, 1);

    assert!(!cache.mark_dirty(&EntityId::new_random()));
}

#[tokio::test]
async fn evict_then_reload_reflects_mutation() {
    let dir = tempdir().unwrap();
    let cache = EntityCache::open(CacheConfig::new(dir.path()).fsync(false)).unwrap();
    let id = EntityId::new_random();

    cache.update(id, |record| record.balance = 150).await;
    let old = cache.get(id).await;

    assert!(cache.evict(&id).await.unwrap());
    assert!(!cache.contains(&id));
    assert!(old.is_evicted());

    let reloaded = cache.get(id).await;
    assert!(!Arc::ptr_eq(&old, &reloaded));
    assert_eq!(reloaded.read().balance, 150);
    assert!(!reloaded.is_dirty());
    assert_eq!(cache.stats().evictions, 1);
}

#[tokio::test]
async fn evict_keeps_entity_when_write_fails() {
    let (cache, store) = memory_cache();
    let id = EntityId::new_random();
    cache.update(id, |record| record.balance = 5).await;

    store.fail_all_writes(true);
    assert!(cache.evict(&id).await.is_err());
    assert!(cache.contains(&id));
    assert!(cache.is_dirty(&id));

    store.clear_failures();
    assert!(cache.evict(&id).await.unwrap());
    assert_eq!(stored_record(&store, &id).balance, 5);
}

#[tokio::test]
async fn mark_on_evicted_handle_is_not_persisted_but_update_reloads() {
    let (cache, store) = memory_cache();
    let id = EntityId::new_random();
    cache.update(id, |record| record.balance = 1).await;
    let stale = cache.get(id).await;
    assert!(cache.evict(&id).await.unwrap());

    stale.write().balance = 999;
    stale.mark_dirty();
    assert!(!stale.is_dirty());

    cache.update(id, |record| record.balance += 1).await;
    assert_eq!(cache.get(id).await.read().balance, 2);
    assert_eq!(stored_record(&store, &id).balance, 1);
}

#[tokio::test]
async fn save_now_writes_clean_entities_too() {
    let (cache, store) = memory_cache();
    let id = EntityId::new_random();
    cache.get(id).await;

    assert!(cache.save_now(&id).await.unwrap());
    assert_eq!(stored_record(&store, &id), EntityRecord::default());

    assert!(!cache.save_now(&EntityId::new_random()).await.unwrap());
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn unreadable_snapshot_falls_back_to_default_and_is_quarantined() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FsSnapshotStore::open(dir.path(), false).unwrap());
    let id = EntityId::new_random();
    std::fs::write(store.snapshot_path(&id), b"garbage").unwrap();

    let cache = EntityCache::with_store(CacheConfig::new(dir.path()), store.clone()).unwrap();
    let handle = cache.get(id).await;

    assert_eq!(handle.snapshot(), EntityRecord::default());
    assert_eq!(cache.stats().decode_failures, 1);
    assert!(!store.snapshot_path(&id).exists());
    let quarantined = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
        .count();
    assert_eq!(quarantined, 1);
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn dropped_entries_are_counted() {
    let (cache, store) = memory_cache();
    let id = EntityId::new_random();
    let mut record = EntityRecord::new();
    record.feature_flags.insert("a".to_string(), true);
    let mut bytes = PersistenceCodec::new().encode(&record);
    // The flag byte precedes the trailing `last_seen` presence byte.
    let flag_pos = bytes.len() - 2;
    bytes[flag_pos] = 7;
    store.insert_raw(id, bytes);

    let handle = cache.get(id).await;

    assert!(handle.read().feature_flags.is_empty());
    assert_eq!(cache.stats().dropped_entries, 1);
}

#[tokio::test]
async fn all_cached_is_a_point_in_time_view() {
    let (cache, _store) = memory_cache();
    for n in 0..5 {
        cache
            .update(EntityId::from_name(&format!("player-{}", n)), |record| {
                record.balance = n
            })
            .await;
    }

    let listed = cache.all_cached();
    cache.get(EntityId::new_random()).await;

    assert_eq!(listed.len(), 5);
    assert_eq!(cache.len(), 6);
    let mut balances = cache
        .snapshot_all()
        .into_iter()
        .map(|(_, record)| record.balance)
        .collect::<Vec<_>>();
    balances.sort();
    assert_eq!(balances, vec![0, 0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn evict_idle_respects_size_cap() {
    let (cache, store) = memory_cache();
    let ids = (0..5).map(|_| EntityId::new_random()).collect::<Vec<_>>();
    for id in &ids {
        cache.update(*id, |record| record.balance = 3).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let report = cache.evict_idle(None, Some(2)).await;

    assert_eq!(report.evicted, 3);
    assert_eq!(cache.len(), 2);
    assert!(cache.contains(&ids[3]));
    assert!(cache.contains(&ids[4]));
    for id in &ids[..3] {
        assert_eq!(stored_record(&store, id).balance, 3);
    }
}

#[tokio::test]
async fn evict_idle_flushes_everything_idle() {
    let (cache, store) = memory_cache();
    for _ in 0..3 {
        cache.update(EntityId::new_random(), |record| record.experience = 1).await;
    }

    let report = cache.evict_idle(Some(Duration::ZERO), None).await;

    assert_eq!(report.evicted, 3);
    assert!(cache.is_empty());
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let store = Arc::new(MemorySnapshotStore::new());
    let config = CacheConfig::default().flush_concurrency(0);
    assert!(EntityCache::with_store(config, store).is_err());
}

/// Fails the first `failures` reads, then reads from the wrapped store.
struct FlakyReadStore {
    inner: MemorySnapshotStore,
    failures: AtomicUsize,
}

impl FlakyReadStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemorySnapshotStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl SnapshotStore for FlakyReadStore {
    async fn read(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StateError::IoError("device busy".to_string()));
        }
        self.inner.read(id).await
    }

    async fn write(&self, id: &EntityId, bytes: Vec<u8>) -> Result<()> {
        self.inner.write(id, bytes).await
    }

    async fn remove(&self, id: &EntityId) -> Result<bool> {
        self.inner.remove(id).await
    }

    async fn list(&self) -> Result<Vec<EntityId>> {
        self.inner.list().await
    }
}

fn flaky_cache(
    failures: usize,
    id: EntityId,
    balance: i64,
) -> (Arc<EntityCache>, Arc<FlakyReadStore>) {
    let store = Arc::new(FlakyReadStore::new(failures));
    let record = EntityRecord {
        balance,
        ..EntityRecord::default()
    };
    store.inner.insert_raw(id, PersistenceCodec::new().encode(&record));
    let cache = EntityCache::with_store(CacheConfig::default(), store.clone()).unwrap();
    (Arc::new(cache), store)
}

#[tokio::test]
async fn transient_read_error_is_retried() {
    let id = EntityId::new_random();
    let (cache, _store) = flaky_cache(1, id, 1_000_000);

    let handle = cache.get(id).await;

    assert_eq!(handle.read().balance, 1_000_000);
    assert!(!handle.is_fallback());
    assert_eq!(cache.stats().read_failures, 0);
    assert_eq!(cache.stats().loads, 1);
}

#[tokio::test]
async fn unreadable_unit_survives_shutdown_flush() {
    let id = EntityId::new_random();
    let (cache, store) = flaky_cache(usize::MAX, id, 1_000_000);
    let mut scheduler = FlushScheduler::new(cache.clone());

    let handle = cache.get(id).await;
    assert_eq!(handle.read().balance, 0);
    assert!(handle.is_fallback());
    assert_eq!(cache.stats().read_failures, 1);

    let report = scheduler.shutdown_flush_all().await;

    assert_eq!(report.written, 0);
    assert_eq!(report.skipped_clean, 1);
    assert!(cache.save_now(&id).await.unwrap());
    assert_eq!(store.inner.write_count(), 0);
    let bytes = store.inner.get_raw(&id).expect("snapshot kept");
    assert_eq!(
        PersistenceCodec::new().decode(&bytes).unwrap().record.balance,
        1_000_000
    );
}

#[tokio::test]
async fn internal_lookups_do_not_count_as_access() {
    let (cache, _store) = memory_cache();
    let mut scheduler = FlushScheduler::new(cache.clone());
    let id = EntityId::new_random();
    cache.update(id, |record| record.balance = 3).await;
    let handle = cache.get(id).await;
    let accessed = handle.last_access_ms();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(cache.is_dirty(&id));
    assert!(cache.mark_dirty(&id));
    scheduler.flush_dirty().await;
    cache.save_now(&id).await.unwrap();
    scheduler.shutdown_flush_all().await;

    assert_eq!(handle.last_access_ms(), accessed);
    cache.get(id).await;
    assert!(handle.last_access_ms() > accessed);
}
