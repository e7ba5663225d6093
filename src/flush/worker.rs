use super::FlushCore;
use crate::core::{Result, StateError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

/// Background task running the periodic flush.
pub struct FlushWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    /// Signals the worker to stop and waits for the cycle in progress to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StateError::ExecutionError(format!("flush worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

pub(crate) fn spawn_flush_worker(core: Arc<FlushCore>, interval: Duration) -> FlushWorker {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let evicts = {
        let config = core.cache().config();
        config.idle_evict_after_ms.is_some() || config.max_cached.is_some()
    };

    let join_handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(interval) => {
                        let report = core.flush_dirty().await;
                        if report.failed > 0 {
                            event!(Level::WARN, failed = report.failed, "periodic flush left entities dirty");
                        }
                        if evicts {
                            core.cache().run_eviction_pass().await;
                        }
                    }
                }
            }
            event!(Level::DEBUG, "flush worker stopped");
        }
        .instrument(info_span!("flush.worker")),
    );

    FlushWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
