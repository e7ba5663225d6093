//! Write-back of cached entities: periodic dirty flushes and the final shutdown flush.

pub mod worker;

pub use worker::FlushWorker;

use crate::cache::{EntityCache, EntityHandle};
use crate::core::{EntityId, Result, StateError};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

/// Phase of the current flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPhase {
    Idle,
    /// Swapping out the dirty set.
    Collecting,
    /// Encoding and writing the collected entities.
    Writing,
}

impl FlushPhase {
    fn as_u8(self) -> u8 {
        match self {
            FlushPhase::Idle => 0,
            FlushPhase::Collecting => 1,
            FlushPhase::Writing => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => FlushPhase::Collecting,
            2 => FlushPhase::Writing,
            _ => FlushPhase::Idle,
        }
    }
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entities a write was attempted for.
    pub attempted: usize,
    pub written: usize,
    /// Failed writes; those entities are queued for the next cycle.
    pub failed: usize,
    /// Queued entities that were already clean or no longer resident.
    pub skipped_clean: usize,
    pub failed_ids: Vec<EntityId>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Ids a cycle took off the dirty queue.
///
/// On drop, normal or because the cycle future was cancelled, every id that
/// is still resident and dirty goes back on the queue and the phase returns
/// to idle.
struct CycleGuard<'a> {
    core: &'a FlushCore,
    ids: Vec<EntityId>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut requeued = 0usize;
        for id in self.ids.drain(..) {
            if let Some(handle) = self.core.cache.peek(&id) {
                if handle.is_dirty() {
                    handle.enqueue();
                    requeued += 1;
                }
            }
        }
        if requeued > 0 {
            event!(Level::DEBUG, requeued, "dirty entities returned to the queue");
        }
        self.core.set_phase(FlushPhase::Idle);
    }
}

/// State shared between the scheduler and its background worker.
pub(crate) struct FlushCore {
    cache: Arc<EntityCache>,
    /// Only one cycle at a time.
    cycle_lock: tokio::sync::Mutex<()>,
    phase: AtomicU8,
}

impl FlushCore {
    fn set_phase(&self, phase: FlushPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Collecting → Writing → Idle over the dirty set.
    pub(crate) async fn flush_dirty(&self) -> FlushReport {
        let _cycle = self.cycle_lock.lock().await;

        self.set_phase(FlushPhase::Collecting);
        let guard = CycleGuard {
            core: self,
            ids: self.cache.take_dirty().into_iter().collect(),
        };
        let mut report = FlushReport::default();
        let mut handles = Vec::with_capacity(guard.ids.len());
        for id in &guard.ids {
            match self.cache.peek(id) {
                Some(handle) if handle.is_dirty() => handles.push(handle),
                _ => report.skipped_clean += 1,
            }
        }

        self.set_phase(FlushPhase::Writing);
        self.write_all(handles, &mut report).await;
        drop(guard);
        self.cache.record_flush_cycle();

        if report.attempted > 0 {
            event!(
                Level::DEBUG,
                written = report.written,
                failed = report.failed,
                skipped_clean = report.skipped_clean,
                "flush cycle finished"
            );
        }
        report
    }

    /// Writes every resident entity regardless of dirty state.
    pub(crate) async fn flush_all(&self) -> FlushReport {
        let _cycle = self.cycle_lock.lock().await;

        self.set_phase(FlushPhase::Collecting);
        // Everything resident is written below, which covers the queue too.
        let guard = CycleGuard {
            core: self,
            ids: self.cache.take_dirty().into_iter().collect(),
        };
        let handles = self.cache.all_cached();
        let mut report = FlushReport {
            skipped_clean: guard
                .ids
                .iter()
                .filter(|id| self.cache.peek(id).is_none())
                .count(),
            ..FlushReport::default()
        };

        self.set_phase(FlushPhase::Writing);
        self.write_all(handles, &mut report).await;
        drop(guard);
        self.cache.record_flush_cycle();
        report
    }

    async fn write_all(&self, handles: Vec<EntityHandle>, report: &mut FlushReport) {
        let concurrency = self.cache.config().flush_concurrency.max(1);
        let cache = &self.cache;
        let results = stream::iter(handles)
            .map(|handle| async move {
                let result = cache.persist_entry(&handle).await;
                (handle.id(), result)
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<(EntityId, Result<bool>)>>()
            .await;

        for (id, result) in results {
            match result {
                Ok(true) => {
                    report.attempted += 1;
                    report.written += 1;
                }
                Ok(false) => report.skipped_clean += 1,
                Err(_) => {
                    report.attempted += 1;
                    report.failed += 1;
                    report.failed_ids.push(id);
                }
            }
        }
        report.failed_ids.sort();
    }
}

/// Drives write-back for one [`EntityCache`].
///
/// Lifecycle: construct, optionally [`start_periodic_flush`](Self::start_periodic_flush),
/// and call [`shutdown_flush_all`](Self::shutdown_flush_all) exactly once before exit.
pub struct FlushScheduler {
    core: Arc<FlushCore>,
    worker: Option<FlushWorker>,
}

impl FlushScheduler {
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self {
            core: Arc::new(FlushCore {
                cache,
                cycle_lock: tokio::sync::Mutex::new(()),
                phase: AtomicU8::new(FlushPhase::Idle.as_u8()),
            }),
            worker: None,
        }
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.core.cache
    }

    pub fn phase(&self) -> FlushPhase {
        FlushPhase::from_u8(self.core.phase.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Runs one dirty flush cycle now. Write failures are logged and retried
    /// on the next cycle, never returned as errors.
    pub async fn flush_dirty(&self) -> FlushReport {
        self.core
            .flush_dirty()
            .instrument(info_span!("flush.cycle"))
            .await
    }

    /// Starts the background flush with the given period.
    ///
    /// The worker also runs the eviction pass when the cache config sets an
    /// idle timeout or a size cap.
    pub fn start_periodic_flush(&mut self, interval: Duration) -> Result<()> {
        if self.worker.is_some() {
            return Err(StateError::ExecutionError(
                "periodic flush is already running".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(StateError::ConfigError(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        self.worker = Some(worker::spawn_flush_worker(self.core.clone(), interval));
        event!(Level::INFO, interval_ms = interval.as_millis() as u64, "periodic flush started");
        Ok(())
    }

    /// Starts the background flush with `flush_interval_ms` from the cache config.
    pub fn start_configured(&mut self) -> Result<()> {
        let interval = self.core.cache.config().flush_interval();
        self.start_periodic_flush(interval)
    }

    pub async fn stop_periodic_flush(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) => worker.stop().await,
            None => Ok(()),
        }
    }

    /// Stops the background flush, then writes every resident entity.
    ///
    /// Runs to completion: individual failures are logged and reported, not raised.
    pub async fn shutdown_flush_all(&mut self) -> FlushReport {
        if let Err(err) = self.stop_periodic_flush().await {
            event!(Level::WARN, error = %err, "flush worker did not stop cleanly");
        }

        let report = self
            .core
            .flush_all()
            .instrument(info_span!("flush.shutdown"))
            .await;

        if report.is_complete() {
            event!(Level::INFO, written = report.written, "shutdown flush complete");
        } else {
            event!(
                Level::ERROR,
                written = report.written,
                failed = report.failed,
                "shutdown flush finished with unwritten entities"
            );
        }
        report
    }
}
