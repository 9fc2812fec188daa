//! Write Pipeline
//!
//! Hands encoded frames from `write` callers to background workers that
//! store them in the remote cache.
//!
//! # Architecture
//!
//! ```text
//!   write() ──┐
//!   write() ──┼──► bounded queue ──► worker 0 ── conn 0 ──► memcached
//!   write() ──┘         │        ──► worker 1 ── conn 1 ──►
//!                       │        ──► worker N ── conn N ──►
//!                       ▼
//!              producers wait when full
//! ```
//!
//! Workers batch queued frames, send them as quiet stores and flush once per
//! batch. Retryable rejections are re-sent with linear backoff; anything
//! else, or a job that runs out of attempts, becomes a dead letter. A
//! transport error stops the whole pipeline.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::Range;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::allocator::{KeyAllocator, KeyRenderer};
use super::metrics::ValueLogMetrics;
use super::pool::ConnectionPool;
use crate::domain::ports::{CacheTransport, QuietFailure};
use crate::error::{Error, Result};

type JobQueue = Arc<AsyncMutex<mpsc::Receiver<WriteJob>>>;

// =============================================================================
// Jobs and Dead Letters
// =============================================================================

/// One encoded frame waiting to be stored under its identifier
#[derive(Debug, Clone)]
pub(crate) struct WriteJob {
    pub id: u32,
    pub frame: Bytes,
    pub attempts: u32,
}

impl WriteJob {
    pub fn new(id: u32, frame: Bytes) -> Self {
        Self {
            id,
            frame,
            attempts: 0,
        }
    }
}

/// A write that was given up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Identifier whose value never reached the cache
    pub id: u32,
    /// Frame length in bytes
    pub len: usize,
    /// Why the write was dropped
    pub reason: String,
}

/// Bounded record of recent dead letters plus a running total
#[derive(Debug)]
pub(crate) struct DeadLetterLog {
    recent: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    total: AtomicU64,
}

impl DeadLetterLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, letter: DeadLetter) {
        self.total.fetch_add(1, Ordering::AcqRel);
        if self.capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(letter);
    }

    pub fn recent(&self) -> Vec<DeadLetter> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }
}

// =============================================================================
// In-Flight Tracking
// =============================================================================

/// Identifiers that were allocated but have not yet been stored or dropped.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    ids: Mutex<BTreeSet<u32>>,
    settled: Notify,
}

impl InFlight {
    /// Allocate `count` identifiers and mark them in flight in one step, so
    /// a concurrent [`barrier`](Self::barrier) never sees one without the
    /// other.
    pub fn register(&self, allocator: &KeyAllocator, count: u32) -> Result<Range<u32>> {
        let mut ids = self.ids.lock();
        let block = allocator.allocate_block(count)?;
        ids.extend(block.clone());
        Ok(block)
    }

    /// Identifier bound covering every allocation made so far
    pub fn barrier(&self, allocator: &KeyAllocator) -> u32 {
        let _ids = self.ids.lock();
        allocator.high_water()
    }

    pub fn settle(&self, id: u32) {
        let removed = self.ids.lock().remove(&id);
        if removed {
            self.settled.notify_waiters();
        }
    }

    pub fn lowest(&self) -> Option<u32> {
        self.ids.lock().first().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Wait until no identifier below `bound` is in flight
    pub async fn wait_below(&self, bound: u32) {
        loop {
            let mut notified = pin!(self.settled.notified());
            notified.as_mut().enable();
            match self.lowest() {
                Some(lowest) if lowest < bound => notified.await,
                _ => return,
            }
        }
    }
}

// =============================================================================
// Shared Worker State
// =============================================================================

/// Retry and batching knobs
#[derive(Debug, Clone)]
pub(crate) struct PipelineSettings {
    pub queue_capacity: usize,
    pub flush_batch_size: usize,
    pub max_write_retries: u32,
    pub retry_backoff: Duration,
}

pub(crate) struct PipelineContext {
    pub pool: ConnectionPool,
    pub renderer: KeyRenderer,
    pub in_flight: Arc<InFlight>,
    pub dead_letters: Arc<DeadLetterLog>,
    pub metrics: ValueLogMetrics,
    pub settings: PipelineSettings,
    fatal: Mutex<Option<String>>,
}

impl PipelineContext {
    pub fn new(
        pool: ConnectionPool,
        renderer: KeyRenderer,
        in_flight: Arc<InFlight>,
        dead_letters: Arc<DeadLetterLog>,
        metrics: ValueLogMetrics,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            pool,
            renderer,
            in_flight,
            dead_letters,
            metrics,
            settings,
            fatal: Mutex::new(None),
        }
    }

    /// Reason the pipeline stopped, if a transport failed
    pub fn fatal(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    fn complete(&self, job: &WriteJob) {
        self.in_flight.settle(job.id);
        self.metrics.in_flight.dec();
        self.metrics.frames_transmitted.inc();
    }

    fn dead_letter(&self, job: WriteJob, reason: impl Into<String>) {
        let reason = reason.into();
        error!(
            id = job.id,
            len = job.frame.len(),
            attempts = job.attempts,
            %reason,
            "Dropping externalized write"
        );
        self.metrics.in_flight.dec();
        self.metrics.dead_letters.inc();
        self.dead_letters.record(DeadLetter {
            id: job.id,
            len: job.frame.len(),
            reason,
        });
        // Recorded before settling so a woken sync sees the drop
        self.in_flight.settle(job.id);
    }

    /// Store `batch` on `conn`, retrying rejected jobs until each one is
    /// either acknowledged or dead-lettered.
    async fn transmit(
        &self,
        conn: &Arc<dyn CacheTransport>,
        batch: &mut Vec<WriteJob>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while !batch.is_empty() {
            let mut tags = Vec::with_capacity(batch.len());
            let mut slots = HashMap::with_capacity(batch.len());
            for (index, job) in batch.iter().enumerate() {
                let key = self.renderer.render(job.id);
                let tag = conn.store_quiet(&key, &job.frame).await?;
                tags.push(tag);
                slots.insert(tag, index);
            }

            let mut outcomes: Vec<Option<QuietFailure>> = vec![None; batch.len()];
            for failure in conn.flush(&tags).await? {
                if let Some(&index) = slots.get(&failure.tag) {
                    outcomes[index] = Some(failure);
                }
            }

            let mut retry = Vec::new();
            for (job, outcome) in batch.drain(..).zip(outcomes) {
                match outcome {
                    None => self.complete(&job),
                    Some(failure)
                        if failure.retryable && job.attempts < self.settings.max_write_retries =>
                    {
                        debug!(
                            id = job.id,
                            status = failure.status,
                            attempt = job.attempts + 1,
                            "Retrying rejected store"
                        );
                        retry.push(WriteJob {
                            attempts: job.attempts + 1,
                            ..job
                        });
                    }
                    Some(failure) => self.dead_letter(
                        job,
                        format!("status {:#06x}: {}", failure.status, failure.reason),
                    ),
                }
            }

            if retry.is_empty() {
                break;
            }
            self.metrics.write_retries.inc_by(retry.len() as u64);
            let attempt = retry.iter().map(|job| job.attempts).max().unwrap_or(1);
            let delay = self.settings.retry_backoff.saturating_mul(attempt);
            warn!(
                count = retry.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Remote cache rejected stores, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    for job in retry {
                        self.dead_letter(job, "shut down before retry");
                    }
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            *batch = retry;
        }
        Ok(())
    }

    /// Record a backend-fatal transport error
    fn fail(&self, slot: usize, err: &Error) {
        error!(slot, error = %err, "Write worker lost its connection");
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(format!("connection {slot}: {err}"));
        }
    }

    /// Close the queue and dead-letter whatever is still in it
    async fn drain(&self, queue: &JobQueue, reason: &str) {
        let mut rx = queue.lock().await;
        rx.close();
        let mut drained = 0usize;
        while let Ok(job) = rx.try_recv() {
            self.metrics.queue_depth.dec();
            self.dead_letter(job, reason);
            drained += 1;
        }
        if drained > 0 {
            warn!(drained, reason, "Dead-lettered queued writes");
        }
    }
}

async fn run_worker(
    slot: usize,
    conn: Arc<dyn CacheTransport>,
    queue: JobQueue,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
) {
    debug!(slot, peer = conn.peer(), "Write worker started");
    let mut batch = Vec::with_capacity(ctx.settings.flush_batch_size);

    loop {
        {
            let mut rx = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                rx = queue.lock() => rx,
            };
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = rx.recv() => job,
            };
            let Some(first) = first else { break };
            batch.push(first);
            while batch.len() < ctx.settings.flush_batch_size {
                match rx.try_recv() {
                    Ok(job) => batch.push(job),
                    Err(_) => break,
                }
            }
        }
        ctx.metrics.queue_depth.sub(batch.len() as i64);

        if let Err(err) = ctx.transmit(&conn, &mut batch, &cancel).await {
            ctx.fail(slot, &err);
            for job in batch.drain(..) {
                ctx.dead_letter(job, format!("transport failed: {err}"));
            }
            cancel.cancel();
            ctx.drain(&queue, "backend failed").await;
            break;
        }
    }
    debug!(slot, "Write worker stopped");
}

// =============================================================================
// Write Pipeline
// =============================================================================

/// Bounded hand-off queue plus one worker per pooled connection
pub(crate) struct WritePipeline {
    sender: Mutex<Option<mpsc::Sender<WriteJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queue: JobQueue,
    cancel: CancellationToken,
    ctx: Arc<PipelineContext>,
}

impl WritePipeline {
    /// Start one worker per connection in the context's pool
    pub fn spawn(ctx: Arc<PipelineContext>) -> Self {
        let (sender, receiver) = mpsc::channel(ctx.settings.queue_capacity);
        let queue: JobQueue = Arc::new(AsyncMutex::new(receiver));
        let cancel = CancellationToken::new();

        let workers = ctx
            .pool
            .iter()
            .enumerate()
            .map(|(slot, conn)| {
                tokio::spawn(run_worker(
                    slot,
                    conn.clone(),
                    queue.clone(),
                    ctx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            queue,
            cancel,
            ctx,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Error to report when the pipeline no longer accepts jobs
    fn rejection(&self) -> Error {
        match self.ctx.fatal() {
            Some(reason) => Error::BackendFailed(reason),
            None => Error::Closed,
        }
    }

    /// Queue a job, waiting while the queue is full.
    ///
    /// On error the job was not queued and its identifier is still in
    /// flight; the caller settles it.
    pub async fn submit(&self, job: WriteJob) -> Result<()> {
        if let Some(reason) = self.ctx.fatal() {
            return Err(Error::BackendFailed(reason));
        }
        let sender = self.sender.lock().clone().ok_or(Error::Closed)?;
        self.ctx.metrics.queue_depth.inc();
        if sender.send(job).await.is_err() {
            self.ctx.metrics.queue_depth.dec();
            return Err(self.rejection());
        }
        Ok(())
    }

    /// Stop accepting jobs and let workers drain the queue for up to
    /// `grace`. Jobs still queued afterwards become dead letters.
    pub async fn shutdown(&self, grace: Duration) {
        drop(self.sender.lock().take());
        let handles = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }

        let mut joined = pin!(join_all(handles));
        if tokio::time::timeout(grace, joined.as_mut()).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Write queue did not drain in time, cancelling workers"
            );
            self.cancel.cancel();
            joined.await;
        }
        self.ctx.drain(&self.queue, "closed before transmission").await;
        info!(
            dead_letters = self.ctx.dead_letters.total(),
            "Write pipeline stopped"
        );
    }
}
