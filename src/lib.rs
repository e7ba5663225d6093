// ============================================================================
// statecache library
// ============================================================================

pub mod cache;
pub mod codec;
pub mod config;
pub mod core;
pub mod flush;
pub mod mirror;
pub mod storage;

// Re-export main types for convenience
pub use cache::{CacheObserver, CacheStats, EntityCache, EntityEntry, EntityHandle, EvictionReport};
pub use codec::{CURRENT_SCHEMA_VERSION, Decoded, MIN_SCHEMA_VERSION, PersistenceCodec};
pub use config::CacheConfig;
pub use core::{
    EntityId, EntityRecord, FieldDecodeError, Result, SanctionEntry, SanctionKind, StateError,
};
pub use flush::{FlushPhase, FlushReport, FlushScheduler, FlushWorker};
pub use mirror::{
    AuditAction, CapabilityMirror, CapabilityProjection, ConsistencyMirror, MirrorAuditWorker,
    MirrorProjection, spawn_mirror_auditor,
};
pub use storage::{
    FsSnapshotStore, MemorySnapshotStore, SnapshotStore, UpgradeReport, upgrade_snapshots,
};
