// src/recording/queue_manager.rs
//! Buffered, batched persistence of built records
//!
//! # Architecture
//!
//! ```text
//! producers ──enqueue()──► RecordQueue (lock-free, bounded)
//!                              │ len >= flush_batch_size ──► Notify
//!                              ▼
//!              flush worker (single tokio task)
//!              select! { interval tick | notify | control }
//!                              │
//!                              ▼
//!              write_batch ──► failed subset ──► backoff, retry <= max_retries
//!                                                   └──► worldlog::data_loss
//! ```
//!
//! Only the worker talks to storage, so flushes never overlap. `flush()` and
//! `shutdown()` are requests over a control channel answered with a
//! [`FlushReport`].

use crate::record::Record;
use crate::recording::event_queue::{QueueStats, RecordQueue};
use crate::storage::StorageAdapter;
use crate::utils::config::RecordingConfig;
use crate::utils::errors::{EngineError, Result};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type SharedAdapter = Arc<RwLock<Arc<dyn StorageAdapter>>>;

enum Control {
    Flush(oneshot::Sender<FlushReport>),
    Shutdown(oneshot::Sender<FlushReport>),
}

/// What one drain of the buffer achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: usize,
    pub persisted: usize,
    pub retries: usize,
    /// Records given up on after retries
    pub dropped: usize,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.batches += other.batches;
        self.persisted += other.persisted;
        self.retries += other.retries;
        self.dropped += other.dropped;
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    persisted: AtomicU64,
    dropped_after_retries: AtomicU64,
    batches: AtomicU64,
    retries: AtomicU64,
}

/// Recording statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingStats {
    pub enqueued: u64,

    /// Rejected because the buffer was full
    pub rejected: u64,

    pub persisted: u64,
    pub dropped_after_retries: u64,
    pub batches: u64,
    pub retries: u64,
    pub queue: QueueStats,
}

struct FlushWorker {
    queue: Arc<RecordQueue>,
    adapter: SharedAdapter,
    config: RecordingConfig,
    counters: Arc<Counters>,
}

impl FlushWorker {
    async fn run(self, notify: Arc<Notify>, mut control: mpsc::UnboundedReceiver<Control>) {
        let period = self.config.flush_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain().await;
                }

                _ = notify.notified() => {
                    self.drain().await;
                }

                message = control.recv() => match message {
                    Some(Control::Flush(reply)) => {
                        let report = self.drain().await;
                        let _ = reply.send(report);
                    }
                    Some(Control::Shutdown(reply)) => {
                        let report = self.drain().await;
                        let _ = reply.send(report);
                        break;
                    }
                    None => {
                        self.drain().await;
                        break;
                    }
                },
            }
        }

        debug!("Flush worker stopped");
    }

    /// Flush what is buffered right now, batch by batch
    async fn drain(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let batch_size = self.config.flush_batch_size.max(1);

        // Bounded by the current length so steady producers cannot pin the worker
        let mut remaining = self.queue.len();
        while remaining > 0 {
            let batch = self.queue.pop_batch(remaining.min(batch_size));
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();
            report.merge(self.flush_batch(batch).await);
        }

        report
    }

    async fn flush_batch(&self, batch: Vec<Record>) -> FlushReport {
        let mut report = FlushReport {
            batches: 1,
            ..Default::default()
        };
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        debug!("Flushing batch of {} records", batch.len());

        let mut pending = batch;
        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        loop {
            let adapter = Arc::clone(&*self.adapter.read());

            match adapter.write_batch(pending.clone()).await {
                Ok(outcome) => {
                    let persisted = outcome.persisted.len();
                    report.persisted += persisted;
                    self.counters
                        .persisted
                        .fetch_add(persisted as u64, Ordering::Relaxed);
                    counter!("worldlog_records_persisted_total").increment(persisted as u64);

                    if let Some(failed) = outcome.failed.first() {
                        last_error = failed.reason.clone();
                    }
                    pending = outcome.failed.into_iter().map(|failed| failed.record).collect();
                }
                Err(e) if e.is_retryable() => {
                    warn!("Batch write failed: {}", e);
                    last_error = e.to_string();
                }
                Err(e) => {
                    report.dropped += self.drop_records(pending, &e.to_string());
                    return report;
                }
            }

            if pending.is_empty() {
                return report;
            }
            if attempt >= self.config.max_retries {
                report.dropped += self.drop_records(pending, &last_error);
                return report;
            }

            let delay = self.backoff(attempt);
            attempt += 1;
            report.retries += 1;
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            counter!("worldlog_flush_retries_total").increment(1);

            debug!(
                "Retrying {} records in {:?} (attempt {})",
                pending.len(),
                delay,
                attempt
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// `retry_backoff_ms * 2^attempt` plus up to half the base as jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff_ms;
        let exponential = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = if base < 2 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base / 2)
        };
        Duration::from_millis(exponential.saturating_add(jitter))
    }

    fn drop_records(&self, records: Vec<Record>, reason: &str) -> usize {
        let count = records.len();
        for record in records {
            let json = serde_json::to_string(&record).unwrap_or_else(|_| format!("{:?}", record));
            error!(
                target: "worldlog::data_loss",
                reason = %reason,
                record = %json,
                "Record dropped after retries"
            );
        }

        self.counters
            .dropped_after_retries
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!("worldlog_records_dropped_total", "reason" => "retries_exhausted")
            .increment(count as u64);
        count
    }
}

/// Accepts records from producers and persists them in the background
pub struct RecordingQueueManager {
    config: RecordingConfig,
    queue: Arc<RecordQueue>,
    adapter: SharedAdapter,
    flush_notify: Arc<Notify>,
    control: mpsc::UnboundedSender<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl RecordingQueueManager {
    /// Create the manager and spawn its flush worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: RecordingConfig, adapter: Arc<dyn StorageAdapter>) -> Self {
        info!(
            "Starting recording queue (batch {}, interval {:?}, buffer {})",
            config.flush_batch_size,
            config.flush_interval(),
            config.max_buffer_size
        );

        let queue = Arc::new(RecordQueue::new(config.max_buffer_size));
        let adapter = Arc::new(RwLock::new(adapter));
        let flush_notify = Arc::new(Notify::new());
        let counters = Arc::new(Counters::default());
        let (control, control_rx) = mpsc::unbounded_channel();

        let worker = FlushWorker {
            queue: Arc::clone(&queue),
            adapter: Arc::clone(&adapter),
            config: config.clone(),
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(worker.run(Arc::clone(&flush_notify), control_rx));

        Self {
            config,
            queue,
            adapter,
            flush_notify,
            control,
            worker: Mutex::new(Some(handle)),
            counters,
            closed: AtomicBool::new(false),
        }
    }

    /// Buffer a record for persistence. Never blocks.
    ///
    /// Fails only when the buffer is full or the manager was shut down; the
    /// record is dropped in both cases.
    pub fn enqueue(&self, record: Record) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::RecordingFailed(
                "recording queue is shut down".to_string(),
            ));
        }

        match self.queue.push(record) {
            Ok(len) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                counter!("worldlog_records_enqueued_total").increment(1);
                if len >= self.config.flush_batch_size {
                    self.flush_notify.notify_one();
                }
                Ok(())
            }
            Err(record) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                counter!("worldlog_records_dropped_total", "reason" => "buffer_full").increment(1);
                warn!(
                    event = %record.event(),
                    capacity = self.queue.capacity(),
                    "Recording buffer full, record dropped"
                );
                Err(EngineError::RecordingFailed(
                    "recording buffer is full".to_string(),
                ))
            }
        }
    }

    /// Flush everything buffered now and wait for the result
    pub async fn flush(&self) -> Result<FlushReport> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(Control::Flush(reply))
            .map_err(|_| EngineError::RecordingFailed("flush worker is not running".to_string()))?;
        response
            .await
            .map_err(|_| EngineError::RecordingFailed("flush worker stopped".to_string()))
    }

    /// Replace the active backend; the next flush cycle writes to it
    pub fn swap_adapter(&self, adapter: Arc<dyn StorageAdapter>) -> Arc<dyn StorageAdapter> {
        info!("Switching recording backend to {}", adapter.engine());
        std::mem::replace(&mut *self.adapter.write(), adapter)
    }

    /// The backend currently written to
    pub fn adapter(&self) -> Arc<dyn StorageAdapter> {
        Arc::clone(&*self.adapter.read())
    }

    /// Stop accepting records, flush once more and stop the worker
    pub async fn shutdown(&self) -> Result<FlushReport> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(FlushReport::default());
        }
        info!("Shutting down recording queue");

        let (reply, response) = oneshot::channel();
        let report = match self.control.send(Control::Shutdown(reply)) {
            Ok(()) => response.await.unwrap_or_default(),
            Err(_) => FlushReport::default(),
        };

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| EngineError::RecordingFailed(format!("Flush worker failed: {}", e)))?;
        }

        if report.dropped > 0 {
            warn!("{} records lost during final flush", report.dropped);
        }
        Ok(report)
    }

    pub fn stats(&self) -> RecordingStats {
        RecordingStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            dropped_after_retries: self.counters.dropped_after_retries.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            queue: self.queue.stats(),
        }
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }
}
