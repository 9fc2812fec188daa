//! Memcache Value Log
//!
//! [`ValueLog`] backend that keeps large values in a remote memcached node
//! instead of local log files.
//!
//! # Data Flow
//!
//! ```text
//! write ──► threshold? ──no──► inline pointer
//!               │yes
//!               ▼
//!          encode frame ──► allocate id ──► queue ──► workers ──► SETQ
//!               │
//!               └──► ValuePointer { id, len }
//!
//! read(ptr, hint) ──► GET on connection `hint` ──► length check ──► decode
//! ```
//!
//! Writes return as soon as their frames are queued. [`sync`](ValueLog::sync)
//! is the barrier that makes them readable, unless the backend runs with
//! [`SyncMode::NoOp`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::allocator::{KeyAllocator, KeyRenderer};
use super::codec::FrameCodec;
use super::compression::PayloadCompressor;
use super::config::{SyncMode, ValueLogConfig};
use super::entry::{EntryRef, ValuePointer, WriteRequest};
use super::gc::{GarbageCollector, GcReport, GcState};
use super::metrics::ValueLogMetrics;
use super::pipeline::{
    DeadLetter, DeadLetterLog, InFlight, PipelineContext, PipelineSettings, WriteJob,
    WritePipeline,
};
use super::pool::ConnectionPool;
use crate::domain::ports::{LiveIndex, ReplayVisitor, ValueLog};
use crate::error::{Error, Result};

/// Slot used for replay and garbage collection
const MAINTENANCE_SLOT: usize = 0;

/// Value log backed by a memcached node
pub struct MemcacheValueLog {
    config: ValueLogConfig,
    pool: ConnectionPool,
    codec: FrameCodec,
    allocator: KeyAllocator,
    renderer: KeyRenderer,
    in_flight: Arc<InFlight>,
    dead_letters: Arc<DeadLetterLog>,
    reported_dead: AtomicU64,
    pipeline: WritePipeline,
    gc: GarbageCollector,
    metrics: ValueLogMetrics,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl MemcacheValueLog {
    /// Build the backend over an already-established pool.
    ///
    /// Must be called within a Tokio runtime; one write worker is spawned
    /// per pooled connection.
    pub fn open_with_pool(
        index: Arc<dyn LiveIndex>,
        config: ValueLogConfig,
        pool: ConnectionPool,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = ValueLogMetrics::new()?;
        let renderer = KeyRenderer::new(config.key_format, config.key_prefix.as_bytes());
        let allocator = KeyAllocator::new(config.initial_key);
        let in_flight = Arc::new(InFlight::default());
        let dead_letters = Arc::new(DeadLetterLog::new(config.dead_letter_capacity));

        let context = PipelineContext::new(
            pool.clone(),
            renderer.clone(),
            in_flight.clone(),
            dead_letters.clone(),
            metrics.clone(),
            PipelineSettings {
                queue_capacity: config.queue_capacity,
                flush_batch_size: config.flush_batch_size,
                max_write_retries: config.max_write_retries,
                retry_backoff: config.retry_backoff,
            },
        );
        let pipeline = WritePipeline::spawn(Arc::new(context));
        let gc = GarbageCollector::new(
            index,
            renderer.clone(),
            metrics.clone(),
            config.gc_threshold,
            config.gc_batch_size,
            config.gc_max_windows,
            allocator.first(),
        );

        Ok(Self {
            codec: FrameCodec::new(PayloadCompressor::new(config.compression.clone())),
            config,
            pool,
            allocator,
            renderer,
            in_flight,
            dead_letters,
            reported_dead: AtomicU64::new(0),
            pipeline,
            gc,
            metrics,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ValueLogConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ValueLogMetrics {
        &self.metrics
    }

    /// Most recent writes that were given up on
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.recent()
    }

    pub fn gc_state(&self) -> GcState {
        self.gc.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of pooled connections (valid hints are `0..connections()`)
    pub fn connections(&self) -> usize {
        self.pool.len()
    }

    /// Identifier the next externalized value will receive
    pub fn next_id(&self) -> u32 {
        self.allocator.high_water()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Run a single garbage collection cycle now
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        self.ensure_open()?;
        let conn = self.pool.get(MAINTENANCE_SLOT)?;
        let high_water = self.in_flight.barrier(&self.allocator);
        let bound = self
            .in_flight
            .lowest()
            .map_or(high_water, |lowest| lowest.min(high_water));
        self.gc.collect(conn, bound).await
    }

    /// Queue frames under a freshly reserved block of identifiers.
    ///
    /// A failed hand-off settles every identifier not yet queued. Frames
    /// queued before the failure stay queued.
    async fn externalize(&self, frames: Vec<Bytes>) -> Result<Vec<u32>> {
        let count = u32::try_from(frames.len()).map_err(|_| Error::KeySpaceExhausted)?;
        let block = self.in_flight.register(&self.allocator, count)?;
        self.metrics.in_flight.add(i64::from(count));

        let ids: Vec<u32> = block.collect();
        for (pos, (id, frame)) in ids.iter().zip(frames).enumerate() {
            if let Err(err) = self.pipeline.submit(WriteJob::new(*id, frame)).await {
                for unsent in &ids[pos..] {
                    self.in_flight.settle(*unsent);
                    self.metrics.in_flight.dec();
                }
                return Err(err);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl ValueLog for MemcacheValueLog {
    type Config = ValueLogConfig;

    #[instrument(skip(index, config), fields(server = %config.server))]
    async fn open(index: Arc<dyn LiveIndex>, config: ValueLogConfig) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::connect(&config).await?;
        let vlog = Self::open_with_pool(index, config, pool)?;
        info!(
            connections = vlog.pool.len(),
            value_threshold = vlog.config.value_threshold,
            sync_mode = ?vlog.config.sync_mode,
            "Value log opened"
        );
        Ok(vlog)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing value log");
        self.shutdown.cancel();
        self.pipeline.shutdown(self.config.close_timeout).await;
        self.gc.terminate();

        let snapshot = self.metrics.snapshot();
        info!(
            externalized = snapshot.writes_externalized,
            transmitted = snapshot.frames_transmitted,
            dead_letters = snapshot.dead_letters,
            unsettled = self.in_flight.len(),
            "Value log closed"
        );
        Ok(())
    }

    async fn read<'a>(
        &self,
        ptr: ValuePointer,
        scratch: &'a mut Vec<u8>,
        hint: usize,
    ) -> Result<EntryRef<'a>> {
        self.ensure_open()?;
        if ptr.is_inline() {
            return Err(Error::InlinePointer);
        }
        let conn = self.pool.get(hint)?;
        self.metrics.reads.inc();

        if let Err(err) = conn.fetch_into(&self.renderer.render(ptr.id), scratch).await {
            self.metrics.read_failures.inc();
            debug!(%ptr, hint, error = %err, "Remote read failed");
            return Err(err);
        }
        if scratch.len() != ptr.len as usize {
            self.metrics.read_failures.inc();
            self.metrics.corrupt_frames.inc();
            return Err(Error::Corrupt(format!(
                "value {} is {} bytes, pointer expects {}",
                self.renderer.display(ptr.id),
                scratch.len(),
                ptr.len
            )));
        }

        let metrics = &self.metrics;
        self.codec.decode(scratch).map_err(|err| {
            metrics.read_failures.inc();
            metrics.corrupt_frames.inc();
            err
        })
    }

    async fn write(&self, reqs: &mut [WriteRequest]) -> Result<()> {
        self.ensure_open()?;

        // Check and encode the whole batch before any identifier is issued
        let mut frames = Vec::new();
        let mut lens = Vec::new();
        for req in reqs.iter_mut() {
            req.ptrs.clear();
            for entry in &req.entries {
                FrameCodec::check(entry)?;
                if !self.config.externalizes(entry.value.len()) {
                    continue;
                }
                let mut frame = BytesMut::new();
                let len = self.codec.encode(entry, &mut frame)?;
                lens.push(u32::try_from(len).map_err(|_| Error::FrameTooLarge { len })?);
                frames.push(frame.freeze());
            }
        }

        let ids = self.externalize(frames).await?;
        let mut placed = ids.into_iter().zip(lens);
        for req in reqs.iter_mut() {
            req.ptrs.reserve(req.entries.len());
            for entry in &req.entries {
                if !self.config.externalizes(entry.value.len()) {
                    self.metrics.writes_inline.inc();
                    req.ptrs.push(ValuePointer::INLINE);
                    continue;
                }
                let Some((id, len)) = placed.next() else {
                    return Err(Error::KeySpaceExhausted);
                };
                self.metrics.writes_externalized.inc();
                self.metrics.bytes_externalized.inc_by(u64::from(len));
                req.ptrs.push(ValuePointer::new(id, len));
            }
        }
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        if self.config.sync_mode == SyncMode::NoOp {
            return Ok(());
        }
        let bound = self.in_flight.barrier(&self.allocator);
        self.in_flight.wait_below(bound).await;

        if let Some(reason) = self.pipeline.context().fatal() {
            return Err(Error::BackendFailed(reason));
        }
        let total = self.dead_letters.total();
        let reported = self.reported_dead.swap(total, Ordering::AcqRel);
        if total > reported {
            return Err(Error::WritesDropped {
                count: total - reported,
            });
        }
        Ok(())
    }

    async fn replay(&self, ptr: ValuePointer, visitor: &mut ReplayVisitor<'_>) -> Result<()> {
        self.ensure_open()?;
        let conn = self.pool.get(MAINTENANCE_SLOT)?;
        let start = if ptr.is_inline() {
            self.allocator.first()
        } else {
            ptr.id
        };
        let end = self.allocator.high_water();
        debug!(start, end, "Replaying value log");

        let mut scratch = Vec::new();
        for id in start..end {
            match conn.fetch_into(&self.renderer.render(id), &mut scratch).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
            let len = u32::try_from(scratch.len()).map_err(|_| Error::FrameTooLarge {
                len: scratch.len(),
            })?;
            let entry = self.codec.decode(&mut scratch)?;
            if !visitor(entry, ValuePointer::new(id, len))? {
                break;
            }
        }
        Ok(())
    }

    async fn run_gc_in_loop(&self, shutdown: CancellationToken) {
        if !self.gc.is_enabled() {
            self.gc.terminate();
            info!("Garbage collection disabled");
            return;
        }

        let period = self.config.gc_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.collect_garbage().await {
                        warn!(error = %err, "Garbage collection cycle failed");
                    }
                }
            }
        }
        self.gc.terminate();
        info!("Garbage collection stopped");
    }
}

impl std::fmt::Debug for MemcacheValueLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcacheValueLog")
            .field("server", &self.config.server)
            .field("connections", &self.pool.len())
            .field("next_id", &self.next_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
