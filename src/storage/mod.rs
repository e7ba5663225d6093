pub mod memory;
pub mod persistence;
pub mod upgrade;

pub use memory::MemorySnapshotStore;
pub use persistence::{FsSnapshotStore, SNAPSHOT_EXTENSION};
pub use upgrade::{UpgradeReport, upgrade_snapshots};

use crate::core::{EntityId, Result};
use async_trait::async_trait;

/// Durable storage holding one snapshot unit per entity.
///
/// Implementations only move bytes; encoding is the codec's job.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns `None` when no unit exists for `id`.
    async fn read(&self, id: &EntityId) -> Result<Option<Vec<u8>>>;

    /// Replaces the unit for `id`. A failed write must leave the previous unit intact.
    async fn write(&self, id: &EntityId, bytes: Vec<u8>) -> Result<()>;

    /// Returns `true` if a unit was removed.
    async fn remove(&self, id: &EntityId) -> Result<bool>;

    async fn list(&self) -> Result<Vec<EntityId>>;

    /// Moves an unreadable unit out of the way so it can be examined later.
    async fn quarantine(&self, _id: &EntityId) -> Result<()> {
        Ok(())
    }
}
