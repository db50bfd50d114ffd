//! Action log pipeline: ordered, batched, retried persistence.
//!
//! Producers (the session registry, the heartbeat monitor and the command
//! dispatcher) hand entries to [`ActionLogPipeline::record`], which never
//! waits on the store. A single consumer drains the FIFO in batches, either
//! when `batch_size` entries are waiting or every `flush_interval`, and is
//! the only code that touches the stores.
//!
//! Sink failures are retried with exponential backoff. When retries run out,
//! non-critical entries of the batch are dropped and counted; `connect`,
//! `disconnect` and `error` entries go back to the head of the queue and the
//! pipeline escalates, refusing new non-critical entries until a write
//! succeeds or the held backlog reaches `critical_ceiling`.
//!
//! Connection snapshot writes ride the same consumer, coalesced per device.

mod buffer;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ecu_core::{EcuId, RetryConfig};
use ecu_settings::PipelineSettings;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use self::buffer::{Buffer, PushOutcome};
use crate::store::{AdminLogStore, ConnectionStore, SnapshotOp};
use crate::types::{ActionLogEntry, ConnectionRecord, ConnectionStatus};

/// Pipeline tuning.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Entries per sink write.
    pub batch_size: usize,
    /// Periodic flush interval.
    pub flush_interval: Duration,
    /// Backoff policy for failed writes.
    pub retry: RetryConfig,
    /// Held entries at which escalation sheds the oldest.
    pub critical_ceiling: usize,
}

impl PipelineConfig {
    /// Build from the `pipeline` settings section.
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            flush_interval: Duration::from_millis(settings.flush_interval_ms.max(1)),
            retry: settings.retry.clone(),
            critical_ceiling: settings.critical_ceiling.max(1),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}

/// Whether an entry was taken into the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Queued for persistence.
    Accepted,
    /// Refused: the pipeline is escalated and the entry is not audit-critical.
    Rejected,
}

/// Outcome of one flush.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Entries durably written.
    pub persisted: usize,
    /// Non-critical entries dropped after retries ran out.
    pub dropped: usize,
    /// Critical entries put back at the head of the queue.
    pub retained: usize,
    /// Successful batch writes.
    pub batches: usize,
    /// Snapshot writes applied.
    pub snapshots_applied: usize,
    /// Snapshot writes re-buffered after failing.
    pub snapshots_pending: usize,
}

impl FlushReport {
    /// Everything that was buffered is now in the store.
    pub fn is_complete(&self) -> bool {
        self.retained == 0 && self.dropped == 0 && self.snapshots_pending == 0
    }
}

/// Point-in-time pipeline counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Entries admitted.
    pub accepted: u64,
    /// Entries refused during escalation.
    pub rejected: u64,
    /// Entries durably written.
    pub persisted: u64,
    /// Non-critical entries dropped (retries exhausted or ceiling).
    pub dropped: u64,
    /// Critical entries shed at the ceiling.
    pub critical_dropped: u64,
    /// Successful batch writes.
    pub batches_written: u64,
    /// Batches that exhausted their retries.
    pub batch_failures: u64,
    /// Individual retry attempts.
    pub retries: u64,
    /// Entries waiting in the queue.
    pub queue_depth: usize,
    /// Devices with an unwritten snapshot change.
    pub pending_snapshots: usize,
    /// Escalation active.
    pub escalated: bool,
    /// Completion time of the last flush.
    pub last_flush: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    critical_dropped: AtomicU64,
    batches_written: AtomicU64,
    batch_failures: AtomicU64,
    retries: AtomicU64,
}

fn bump(counter: &AtomicU64, by: usize) {
    let _ = counter.fetch_add(by as u64, Ordering::Relaxed);
}

/// State shared between producers and the consumer task.
struct Inner {
    config: PipelineConfig,
    buffer: Mutex<Buffer>,
    wake: Notify,
    /// Held for the duration of a flush; there is exactly one consumer.
    consumer: tokio::sync::Mutex<()>,
    logs: Arc<dyn AdminLogStore>,
    connections: Arc<dyn ConnectionStore>,
    counters: Counters,
    last_flush: Mutex<Option<DateTime<Utc>>>,
}

/// Handle to a running pipeline.
pub struct ActionLogPipeline {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<FlushReport>>>,
}

impl ActionLogPipeline {
    /// Start the consumer task. Must be called inside a tokio runtime.
    pub fn spawn(
        config: PipelineConfig,
        logs: Arc<dyn AdminLogStore>,
        connections: Arc<dyn ConnectionStore>,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            buffer: Mutex::new(Buffer::default()),
            wake: Notify::new(),
            consumer: tokio::sync::Mutex::new(()),
            logs,
            connections,
            counters: Counters::default(),
            last_flush: Mutex::new(None),
        });
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(worker::run(inner.clone(), cancel.clone()));
        Self {
            inner,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue an entry. Never waits on the store.
    pub fn record(&self, entry: ActionLogEntry) -> Admission {
        let ecu_id = entry.ecu_id.clone();
        let action_type = entry.action_type();
        let (outcome, depth) = {
            let mut buffer = self.inner.buffer.lock();
            let outcome = buffer.push(entry, self.inner.config.critical_ceiling);
            (outcome, buffer.len())
        };

        match outcome {
            PushOutcome::Rejected => {
                bump(&self.inner.counters.rejected, 1);
                counter!("ecu_log_entries_rejected_total").increment(1);
                warn!(ecu_id = %ecu_id, %action_type, "log entry refused while sink is escalated");
                Admission::Rejected
            }
            PushOutcome::Accepted { shed } => {
                bump(&self.inner.counters.accepted, 1);
                if !shed.is_empty() {
                    self.inner.note_shed(shed);
                }
                gauge!("ecu_log_queue_depth").set(depth as f64);
                if depth >= self.inner.config.batch_size {
                    self.inner.wake.notify_one();
                }
                Admission::Accepted
            }
        }
    }

    /// Queue a full snapshot write for a device.
    pub fn upsert_connection(&self, record: ConnectionRecord) {
        self.inner
            .buffer
            .lock()
            .push_snapshot(SnapshotOp::Upsert(record));
    }

    /// Queue a status-only snapshot write for a device.
    pub fn mark_status(&self, ecu_id: &EcuId, status: ConnectionStatus) {
        self.inner.buffer.lock().push_snapshot(SnapshotOp::Status {
            ecu_id: ecu_id.clone(),
            status,
        });
    }

    /// Flush everything buffered so far and wait for the outcome.
    pub async fn flush_and_wait(&self) -> FlushReport {
        self.inner.flush(worker::FlushMode::All).await
    }

    /// Current counters.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.inner.counters;
        let (queue_depth, pending_snapshots, escalated) = {
            let buffer = self.inner.buffer.lock();
            (
                buffer.len(),
                buffer.pending_snapshots(),
                buffer.is_escalated(),
            )
        };
        PipelineStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            persisted: c.persisted.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            critical_dropped: c.critical_dropped.load(Ordering::Relaxed),
            batches_written: c.batches_written.load(Ordering::Relaxed),
            batch_failures: c.batch_failures.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            queue_depth,
            pending_snapshots,
            escalated,
            last_flush: *self.inner.last_flush.lock(),
        }
    }

    /// Stop the consumer and return the outcome of its final flush.
    pub async fn shutdown(&self) -> FlushReport {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        let report = match handle {
            Some(handle) => match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "action log worker ended abnormally");
                    self.inner.flush(worker::FlushMode::All).await
                }
            },
            None => self.inner.flush(worker::FlushMode::All).await,
        };
        debug!(?report, "action log pipeline stopped");
        report
    }
}

impl Drop for ActionLogPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
