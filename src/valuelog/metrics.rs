//! Value Log Metrics
//!
//! Prometheus counters and gauges for one value log instance. Each backend
//! owns its own [`Registry`] so several instances can coexist in a process;
//! the engine decides whether and where to expose it.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::error::Result;

const NAMESPACE: &str = "cachelog";

/// Metrics collector for the memcache value log
#[derive(Clone)]
pub struct ValueLogMetrics {
    registry: Registry,

    // Write path
    pub(crate) writes_externalized: IntCounter,
    pub(crate) writes_inline: IntCounter,
    pub(crate) bytes_externalized: IntCounter,
    pub(crate) frames_transmitted: IntCounter,
    pub(crate) write_retries: IntCounter,
    pub(crate) dead_letters: IntCounter,
    pub(crate) queue_depth: IntGauge,
    pub(crate) in_flight: IntGauge,

    // Read path
    pub(crate) reads: IntCounter,
    pub(crate) read_failures: IntCounter,
    pub(crate) corrupt_frames: IntCounter,

    // Garbage collection
    pub(crate) gc_cycles: IntCounter,
    pub(crate) gc_deleted: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl ValueLogMetrics {
    /// Create and register all collectors in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            writes_externalized: counter(
                &registry,
                "writes_externalized_total",
                "Entries assigned a remote identifier",
            )?,
            writes_inline: counter(
                &registry,
                "writes_inline_total",
                "Entries left inline in the primary index",
            )?,
            bytes_externalized: counter(
                &registry,
                "bytes_externalized_total",
                "Encoded frame bytes handed to write workers",
            )?,
            frames_transmitted: counter(
                &registry,
                "frames_transmitted_total",
                "Frames acknowledged by the remote cache",
            )?,
            write_retries: counter(
                &registry,
                "write_retries_total",
                "Stores re-sent after a retryable failure",
            )?,
            dead_letters: counter(
                &registry,
                "dead_letters_total",
                "Writes dropped after exhausting retries",
            )?,
            queue_depth: gauge(
                &registry,
                "queue_depth",
                "Write jobs waiting for a worker",
            )?,
            in_flight: gauge(
                &registry,
                "in_flight",
                "Identifiers allocated but not yet settled",
            )?,
            reads: counter(&registry, "reads_total", "Pointer reads served")?,
            read_failures: counter(
                &registry,
                "read_failures_total",
                "Pointer reads that returned an error",
            )?,
            corrupt_frames: counter(
                &registry,
                "corrupt_frames_total",
                "Fetched frames that failed validation",
            )?,
            gc_cycles: counter(
                &registry,
                "gc_cycles_total",
                "Garbage collection scans performed",
            )?,
            gc_deleted: counter(
                &registry,
                "gc_deleted_total",
                "Remote values deleted by garbage collection",
            )?,
            registry,
        })
    }

    /// Registry holding every collector of this instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Point-in-time copy of all values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes_externalized: self.writes_externalized.get(),
            writes_inline: self.writes_inline.get(),
            bytes_externalized: self.bytes_externalized.get(),
            frames_transmitted: self.frames_transmitted.get(),
            write_retries: self.write_retries.get(),
            dead_letters: self.dead_letters.get(),
            queue_depth: self.queue_depth.get(),
            in_flight: self.in_flight.get(),
            reads: self.reads.get(),
            read_failures: self.read_failures.get(),
            corrupt_frames: self.corrupt_frames.get(),
            gc_cycles: self.gc_cycles.get(),
            gc_deleted: self.gc_deleted.get(),
        }
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for ValueLogMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ValueLogMetrics")
            .field(&self.snapshot())
            .finish()
    }
}

/// Metrics snapshot for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub writes_externalized: u64,
    pub writes_inline: u64,
    pub bytes_externalized: u64,
    pub frames_transmitted: u64,
    pub write_retries: u64,
    pub dead_letters: u64,
    pub queue_depth: i64,
    pub in_flight: i64,
    pub reads: u64,
    pub read_failures: u64,
    pub corrupt_frames: u64,
    pub gc_cycles: u64,
    pub gc_deleted: u64,
}

impl MetricsSnapshot {
    /// Fraction of written entries that went to the remote cache
    pub fn externalized_ratio(&self) -> f64 {
        let total = self.writes_externalized + self.writes_inline;
        if total == 0 {
            0.0
        } else {
            self.writes_externalized as f64 / total as f64
        }
    }
}
