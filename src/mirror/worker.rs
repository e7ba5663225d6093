use super::{ConsistencyMirror, MirrorProjection};
use crate::cache::EntityCache;
use crate::core::{Result, StateError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

/// What the periodic audit does with drift it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditAction {
    /// Log drifted identities only.
    #[default]
    Report,
    /// Log and repair.
    Resync,
}

pub struct MirrorAuditWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
    audits: Arc<AtomicU64>,
}

impl MirrorAuditWorker {
    /// Completed audit passes so far.
    pub fn audits_run(&self) -> u64 {
        self.audits.load(Ordering::Relaxed)
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StateError::ExecutionError(format!("mirror auditor join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for MirrorAuditWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns a task auditing `mirror` against `cache` every `interval`.
pub fn spawn_mirror_auditor<P: MirrorProjection>(
    cache: Arc<EntityCache>,
    mirror: Arc<ConsistencyMirror<P>>,
    interval: Duration,
    action: AuditAction,
) -> MirrorAuditWorker {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let audits = Arc::new(AtomicU64::new(0));
    let audits_task = audits.clone();

    let join_handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(interval) => {
                        let drifted = mirror.audit(&cache);
                        if !drifted.is_empty() {
                            event!(
                                Level::WARN,
                                drifted = drifted.len(),
                                first = %drifted[0],
                                "mirror drift detected"
                            );
                            if action == AuditAction::Resync {
                                mirror.resync_all(&cache);
                            }
                        }
                        audits_task.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        .instrument(info_span!("mirror.audit")),
    );

    MirrorAuditWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
        audits,
    }
}
