use super::SnapshotStore;
use crate::codec::{CURRENT_SCHEMA_VERSION, PersistenceCodec};
use crate::core::{EntityId, Result};
use tracing::{Level, event};

/// Outcome of rewriting a store at the current schema version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub upgraded: usize,
    pub current: usize,
    pub unreadable: Vec<EntityId>,
    /// Units with dropped entries left untouched.
    pub damaged_skipped: Vec<EntityId>,
    /// Units with dropped entries rewritten after their original was quarantined.
    pub damaged_rewritten: Vec<EntityId>,
}

/// Rewrites every readable unit of `store` at [`CURRENT_SCHEMA_VERSION`].
///
/// Units that decode with dropped entries are skipped unless `accept_damage`
/// is set; then the original is quarantined before the rewrite.
pub async fn upgrade_snapshots(
    store: &dyn SnapshotStore,
    codec: &PersistenceCodec,
    accept_damage: bool,
) -> Result<UpgradeReport> {
    let mut report = UpgradeReport::default();
    for id in store.list().await? {
        let Some(bytes) = store.read(&id).await? else {
            continue;
        };
        let decoded = match codec.decode(&bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                event!(Level::WARN, entity_id = %id, error = %err, "unreadable snapshot skipped");
                report.unreadable.push(id);
                continue;
            }
        };

        if !decoded.is_clean() {
            if !accept_damage {
                event!(
                    Level::WARN,
                    entity_id = %id,
                    dropped = decoded.dropped.len(),
                    "damaged snapshot left as is"
                );
                report.damaged_skipped.push(id);
                continue;
            }
            store.quarantine(&id).await?;
            report.damaged_rewritten.push(id);
        } else if decoded.version == CURRENT_SCHEMA_VERSION {
            report.current += 1;
            continue;
        }

        store.write(&id, codec.encode(&decoded.record)).await?;
        report.upgraded += 1;
    }
    Ok(report)
}
