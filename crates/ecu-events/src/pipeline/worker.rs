//! Consumer side of the action log pipeline.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffer::Shed;
use super::{FlushReport, Inner, bump};
use crate::errors::{Result, StoreError};
use crate::store::SnapshotOp;
use crate::types::ActionLogEntry;

/// How much of the queue a flush drains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum FlushMode {
    /// Everything queued when the flush started.
    All,
    /// Only complete batches.
    Full,
}

/// Consumer loop. Exits after a final flush once `cancel` fires.
pub(super) async fn run(inner: Arc<Inner>, cancel: CancellationToken) -> FlushReport {
    let period = inner.config.flush_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = inner.wake.notified() => {
                let _ = inner.flush(FlushMode::Full).await;
            }
            _ = ticker.tick() => {
                let _ = inner.flush(FlushMode::All).await;
            }
        }
    }

    let report = inner.flush(FlushMode::All).await;
    if !report.is_complete() {
        warn!(
            retained = report.retained,
            dropped = report.dropped,
            snapshots_pending = report.snapshots_pending,
            "action log pipeline stopped with unwritten data"
        );
    }
    report
}

impl Inner {
    /// Drain the queue through the log sink, then apply pending snapshots.
    pub(super) async fn flush(&self, mode: FlushMode) -> FlushReport {
        let _consumer = self.consumer.lock().await;
        let batch_size = self.config.batch_size;
        let mut report = FlushReport::default();

        // Entries arriving during the flush wait for the next one.
        let budget = self.buffer.lock().len();
        let mut taken = 0;

        loop {
            let batch = {
                let mut buffer = self.buffer.lock();
                let available = buffer.len();
                if taken >= budget || available == 0 {
                    None
                } else if mode == FlushMode::Full && available < batch_size {
                    None
                } else {
                    Some(buffer.take_batch(batch_size.min(budget - taken)))
                }
            };
            let Some(batch) = batch else { break };
            taken += batch.len();
            let len = batch.len();

            match self.append_with_retry(batch).await {
                Ok(()) => {
                    report.persisted += len;
                    report.batches += 1;
                    bump(&self.counters.persisted, len);
                    bump(&self.counters.batches_written, 1);
                    counter!("ecu_log_entries_persisted_total").increment(len as u64);
                    if self.buffer.lock().recover() {
                        gauge!("ecu_log_escalated").set(0.0);
                        info!("action log sink recovered, admission reopened");
                    }
                }
                Err((batch, e)) => {
                    self.give_up(batch, &e, &mut report);
                    break;
                }
            }
        }

        self.flush_snapshots(&mut report).await;

        let depth = self.buffer.lock().len();
        gauge!("ecu_log_queue_depth").set(depth as f64);
        *self.last_flush.lock() = Some(Utc::now());
        if report.persisted > 0 || report.snapshots_applied > 0 {
            debug!(?report, "action log flush");
        }
        report
    }

    /// Write one batch, backing off between attempts. Hands the batch back
    /// when every attempt failed.
    async fn append_with_retry(
        &self,
        batch: Vec<ActionLogEntry>,
    ) -> std::result::Result<(), (Vec<ActionLogEntry>, StoreError)> {
        let batch = Arc::new(batch);
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.append_once(&batch).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt, rand::random());
                    attempt += 1;
                    bump(&self.counters.retries, 1);
                    counter!("ecu_log_sink_retries_total").increment(1);
                    warn!(
                        error = %e,
                        attempt,
                        max_retries = retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        entries = batch.len(),
                        "action log write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let batch = Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone());
                    return Err((batch, e));
                }
            }
        }
    }

    async fn append_once(&self, batch: &Arc<Vec<ActionLogEntry>>) -> Result<()> {
        let logs = Arc::clone(&self.logs);
        let batch = Arc::clone(batch);
        tokio::task::spawn_blocking(move || logs.append_batch(&batch))
            .await
            .map_err(|e| StoreError::Unavailable(format!("log write task failed: {e}")))?
    }

    /// Retries ran out: keep the audit-critical entries, drop the rest.
    fn give_up(&self, batch: Vec<ActionLogEntry>, e: &StoreError, report: &mut FlushReport) {
        bump(&self.counters.batch_failures, 1);
        let (critical, other): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(ActionLogEntry::is_audit_critical);

        if !other.is_empty() {
            report.dropped += other.len();
            bump(&self.counters.dropped, other.len());
            counter!("ecu_log_entries_dropped_total").increment(other.len() as u64);
            error!(
                error = %e,
                dropped = other.len(),
                "action log write exhausted retries, dropping non-critical entries"
            );
        }

        if critical.is_empty() {
            return;
        }
        report.retained += critical.len();
        let retained = critical.len();
        let shed = {
            let mut buffer = self.buffer.lock();
            buffer.requeue_front(critical);
            buffer.escalate(self.config.critical_ceiling)
        };
        gauge!("ecu_log_escalated").set(1.0);
        error!(
            error = %e,
            retained,
            "action log sink down, holding critical entries and refusing others"
        );
        if !shed.is_empty() {
            self.note_shed(shed);
        }
    }

    /// Record entries lost to the ceiling.
    pub(super) fn note_shed(&self, shed: Shed) {
        bump(&self.counters.dropped, shed.other);
        bump(&self.counters.critical_dropped, shed.critical);
        counter!("ecu_log_entries_dropped_total").increment(shed.other as u64);
        counter!("ecu_log_critical_dropped_total").increment(shed.critical as u64);
        gauge!("ecu_log_escalated").set(0.0);
        error!(
            critical = shed.critical,
            other = shed.other,
            ceiling = self.config.critical_ceiling,
            "held log backlog reached its ceiling, oldest entries shed"
        );
    }

    /// Apply coalesced snapshot writes. After the first write that exhausts
    /// its retries the remaining ones are re-buffered untried.
    async fn flush_snapshots(&self, report: &mut FlushReport) {
        let ops = self.buffer.lock().take_snapshots();
        let mut sink_down = false;
        for op in ops {
            if !sink_down {
                match self.apply_with_retry(&op).await {
                    Ok(()) => {
                        report.snapshots_applied += 1;
                        continue;
                    }
                    Err(e) => {
                        sink_down = true;
                        error!(
                            ecu_id = %op.ecu_id(),
                            error = %e,
                            "connection snapshot write exhausted retries"
                        );
                    }
                }
            }
            report.snapshots_pending += 1;
            self.buffer.lock().restore_snapshot(op);
        }
    }

    async fn apply_with_retry(&self, op: &SnapshotOp) -> Result<()> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            let connections = Arc::clone(&self.connections);
            let task_op = op.clone();
            let outcome = tokio::task::spawn_blocking(move || task_op.apply(connections.as_ref()))
                .await
                .map_err(|e| StoreError::Unavailable(format!("snapshot write task failed: {e}")))
                .and_then(|r| r);
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt, rand::random());
                    attempt += 1;
                    bump(&self.counters.retries, 1);
                    counter!("ecu_log_sink_retries_total").increment(1);
                    debug!(ecu_id = %op.ecu_id(), error = %e, attempt, "snapshot write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
