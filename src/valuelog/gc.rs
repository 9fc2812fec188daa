//! Garbage Collection
//!
//! Reclaims remote values the engine no longer references. Identifiers are
//! scanned in fixed windows. A window whose dead fraction reaches the
//! threshold has its dead identifiers deleted and is done for good. A window
//! below the threshold is deferred and revisited by later cycles, when more
//! of it has been overwritten, while the scan keeps moving past it.
//!
//! ```text
//!   cursor                        frontier          bound
//!     │                              │                │
//!     ▼                              ▼                ▼
//!     [deferred]  done  [deferred]  done │ unscanned  │ in flight / unissued
//! ```
//!
//! Each cycle examines at most `max_windows` windows: one fresh window
//! first, then every deferred window once, then more fresh windows. The
//! scan never reaches identifiers that are still in flight, so a value is
//! never deleted before it was stored.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::allocator::KeyRenderer;
use super::metrics::ValueLogMetrics;
use crate::adapters::Status;
use crate::domain::ports::{CacheTransport, LiveIndex};
use crate::error::Result;

/// Lifecycle of the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    /// Waiting for the next cycle
    Idle,
    /// A scan is running
    Scanning,
    /// Collection stopped for good
    Terminated,
}

/// Outcome of one collection cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcReport {
    /// Lowest identifier still awaiting collection when the cycle ended
    pub start: u32,
    /// One past the highest identifier ever scanned
    pub end: u32,
    /// Windows examined
    pub windows: u32,
    /// Identifiers examined
    pub scanned: u32,
    /// Identifiers the index no longer references
    pub dead: u32,
    /// Remote values actually deleted
    pub deleted: u32,
    /// True when nothing was deleted because every window was below the
    /// threshold, nothing was scannable, or another scan was running
    pub skipped: bool,
}

impl GcReport {
    pub fn dead_ratio(&self) -> f64 {
        if self.scanned == 0 {
            0.0
        } else {
            f64::from(self.dead) / f64::from(self.scanned)
        }
    }
}

/// Scan progress shared between cycles
#[derive(Debug)]
struct Progress {
    /// Next identifier never scanned
    frontier: u32,
    /// Windows below the threshold, in revisit order
    deferred: VecDeque<Range<u32>>,
}

impl Progress {
    fn cursor(&self) -> u32 {
        self.deferred
            .iter()
            .map(|window| window.start)
            .min()
            .unwrap_or(self.frontier)
            .min(self.frontier)
    }
}

/// Windowed mark-and-delete over the identifier space
pub struct GarbageCollector {
    index: Arc<dyn LiveIndex>,
    renderer: KeyRenderer,
    metrics: ValueLogMetrics,
    threshold: f64,
    batch_size: u32,
    max_windows: u32,
    state: Mutex<GcState>,
    progress: Mutex<Progress>,
}

impl GarbageCollector {
    pub fn new(
        index: Arc<dyn LiveIndex>,
        renderer: KeyRenderer,
        metrics: ValueLogMetrics,
        threshold: f64,
        batch_size: u32,
        max_windows: u32,
        first_id: u32,
    ) -> Self {
        Self {
            index,
            renderer,
            metrics,
            threshold,
            batch_size,
            max_windows,
            state: Mutex::new(GcState::Idle),
            progress: Mutex::new(Progress {
                frontier: first_id,
                deferred: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> GcState {
        *self.state.lock()
    }

    /// Lowest identifier not yet collected
    pub fn cursor(&self) -> u32 {
        self.progress.lock().cursor()
    }

    /// Windows waiting for more of their identifiers to die
    pub fn deferred(&self) -> usize {
        self.progress.lock().deferred.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0.0
    }

    /// Stop collection permanently
    pub fn terminate(&self) {
        *self.state.lock() = GcState::Terminated;
    }

    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if *state != GcState::Idle {
            return false;
        }
        *state = GcState::Scanning;
        true
    }

    fn end(&self) {
        let mut state = self.state.lock();
        if *state == GcState::Scanning {
            *state = GcState::Idle;
        }
    }

    /// Run one cycle over identifiers below `bound` using `transport`.
    ///
    /// `bound` must not exceed the lowest identifier still in flight.
    pub async fn collect(
        &self,
        transport: &Arc<dyn CacheTransport>,
        bound: u32,
    ) -> Result<GcReport> {
        if !self.is_enabled() || !self.begin() {
            return Ok(GcReport {
                skipped: true,
                ..Default::default()
            });
        }
        let result = self.scan(transport, bound).await;
        self.end();
        result
    }

    /// Claim the next unscanned window below `bound`
    fn fresh_window(&self, bound: u32) -> Option<Range<u32>> {
        let mut progress = self.progress.lock();
        let start = progress.frontier;
        let end = bound.min(start.saturating_add(self.batch_size));
        if start >= end {
            return None;
        }
        progress.frontier = end;
        Some(start..end)
    }

    async fn scan(&self, transport: &Arc<dyn CacheTransport>, bound: u32) -> Result<GcReport> {
        let mut report = GcReport::default();
        let mut collected = false;
        let mut budget = self.max_windows;
        let revisits = self.progress.lock().deferred.len();

        if budget > 0 {
            if let Some(window) = self.fresh_window(bound) {
                collected |= self.examine(transport, window, &mut report).await?;
                budget -= 1;
            }
        }
        for _ in 0..revisits.min(budget as usize) {
            let Some(window) = self.progress.lock().deferred.pop_front() else {
                break;
            };
            collected |= self.examine(transport, window, &mut report).await?;
            budget -= 1;
        }
        while budget > 0 {
            let Some(window) = self.fresh_window(bound) else {
                break;
            };
            collected |= self.examine(transport, window, &mut report).await?;
            budget -= 1;
        }

        {
            let progress = self.progress.lock();
            report.start = progress.cursor();
            report.end = progress.frontier;
        }
        report.skipped = !collected;
        if report.windows > 0 {
            self.metrics.gc_cycles.inc();
        }
        if collected {
            info!(
                cursor = report.start,
                frontier = report.end,
                windows = report.windows,
                scanned = report.scanned,
                deleted = report.deleted,
                "Garbage collection cycle complete"
            );
        } else {
            debug!(
                windows = report.windows,
                dead = report.dead,
                ratio = report.dead_ratio(),
                "No window reached the gc threshold"
            );
        }
        Ok(report)
    }

    /// Delete the dead identifiers of `window` when enough of it is dead,
    /// otherwise defer it. Returns whether the window was collected.
    async fn examine(
        &self,
        transport: &Arc<dyn CacheTransport>,
        window: Range<u32>,
        report: &mut GcReport,
    ) -> Result<bool> {
        let scanned = window.end - window.start;
        let dead: Vec<u32> = window.clone().filter(|id| !self.index.is_live(*id)).collect();
        let dead_count = dead.len() as u32;
        report.windows += 1;
        report.scanned += scanned;
        report.dead += dead_count;

        if dead.is_empty() || f64::from(dead_count) / f64::from(scanned) < self.threshold {
            debug!(
                start = window.start,
                end = window.end,
                dead = dead_count,
                "Window below gc threshold, deferred"
            );
            self.progress.lock().deferred.push_back(window);
            return Ok(false);
        }

        let kept = match self.delete(transport, &dead).await {
            Ok(kept) => kept,
            Err(err) => {
                self.progress.lock().deferred.push_front(window);
                return Err(err);
            }
        };
        let deleted = dead_count - kept;
        report.deleted += deleted;
        self.metrics.gc_deleted.inc_by(u64::from(deleted));
        Ok(true)
    }

    /// Quietly delete `ids`, returning how many the remote cache refused.
    /// Keys already gone count as deleted.
    async fn delete(&self, transport: &Arc<dyn CacheTransport>, ids: &[u32]) -> Result<u32> {
        let mut tags = Vec::with_capacity(ids.len());
        for id in ids {
            tags.push(transport.delete_quiet(&self.renderer.render(*id)).await?);
        }
        let mut kept = 0u32;
        for failure in transport.flush(&tags).await? {
            if failure.status != Status::KeyNotFound.code() {
                warn!(
                    status = failure.status,
                    reason = %failure.reason,
                    "Remote cache refused a gc delete"
                );
                kept += 1;
            }
        }
        Ok(kept)
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("threshold", &self.threshold)
            .field("batch_size", &self.batch_size)
            .field("state", &self.state())
            .field("cursor", &self.cursor())
            .finish()
    }
}
