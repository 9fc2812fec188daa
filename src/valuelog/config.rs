//! Value Log Configuration
//!
//! Consumed from the engine's configuration object. Loading is the engine's
//! job; these types only carry defaults and validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::allocator::KeyFormat;
use super::compression::CompressionConfig;
use crate::error::{Error, Result};

/// Default memcached endpoint
pub const DEFAULT_SERVER: &str = "127.0.0.1:11211";

/// Default number of pooled connections (and write workers)
pub const DEFAULT_CONNECTIONS: usize = 10;

/// Default hand-off queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Maximum retry attempts for a failed quiet store
pub const DEFAULT_MAX_WRITE_RETRIES: u32 = 3;

/// Upper bound for the base retry delay
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// What `sync` guarantees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Wait until every write accepted before the call has settled
    #[default]
    Barrier,
    /// Return immediately; writes are fire-and-forget
    NoOp,
}

/// Configuration for the memcache-backed value log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueLogConfig {
    /// Remote cache endpoint (`host:port`)
    pub server: String,

    /// Number of pooled connections; one write worker runs per connection
    pub connections: usize,

    /// Values shorter than this stay inline in the primary index
    pub value_threshold: usize,

    /// Externalize every value regardless of size
    pub sync_writes: bool,

    /// Fraction of dead identifiers in a scan window that triggers deletion
    /// (0 disables garbage collection)
    pub gc_threshold: f64,

    /// Interval between garbage collection cycles
    pub gc_interval: Duration,

    /// Identifiers per garbage collection window
    pub gc_batch_size: u32,

    /// Windows a single garbage collection cycle may examine
    pub gc_max_windows: u32,

    /// Capacity of the write hand-off queue; producers wait when it is full
    pub queue_capacity: usize,

    /// Maximum quiet stores a worker sends before flushing
    pub flush_batch_size: usize,

    /// Retry attempts for a store the remote cache rejected
    pub max_write_retries: u32,

    /// Base delay between retries (multiplied by the attempt number)
    pub retry_backoff: Duration,

    /// Behaviour of `sync`
    pub sync_mode: SyncMode,

    /// Payload compression
    pub compression: CompressionConfig,

    /// Rendering of identifiers into cache keys
    pub key_format: KeyFormat,

    /// Namespace prepended to every cache key
    pub key_prefix: String,

    /// First identifier to issue (must be non-zero)
    pub initial_key: u32,

    /// Memcached expiration for stored values (0 = never)
    pub expiration: u32,

    /// Timeout for establishing each connection
    pub connect_timeout: Duration,

    /// Timeout for a single request/response exchange
    pub io_timeout: Duration,

    /// Time `close` waits for the write queue to drain
    pub close_timeout: Duration,

    /// Number of dead-lettered writes remembered for inspection
    pub dead_letter_capacity: usize,
}

impl Default for ValueLogConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            connections: DEFAULT_CONNECTIONS,
            value_threshold: 20,
            sync_writes: false,
            gc_threshold: 0.5,
            gc_interval: Duration::from_secs(600),
            gc_batch_size: 10_000,
            gc_max_windows: 16,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flush_batch_size: 64,
            max_write_retries: DEFAULT_MAX_WRITE_RETRIES,
            retry_backoff: Duration::from_millis(100),
            sync_mode: SyncMode::Barrier,
            compression: CompressionConfig::default(),
            key_format: KeyFormat::Decimal,
            key_prefix: String::new(),
            initial_key: 1,
            expiration: 0,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(30),
            dead_letter_capacity: 1024,
        }
    }
}

impl ValueLogConfig {
    /// Default configuration pointed at `server`
    pub fn with_server(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(Error::Config("server must not be empty".into()));
        }
        if self.connections == 0 {
            return Err(Error::Config("connections must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be > 0".into()));
        }
        if self.flush_batch_size == 0 {
            return Err(Error::Config("flush_batch_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.gc_threshold) {
            return Err(Error::Config(format!(
                "gc_threshold must be within [0, 1], got {}",
                self.gc_threshold
            )));
        }
        if self.gc_threshold > 0.0
            && (self.gc_batch_size == 0 || self.gc_max_windows == 0 || self.gc_interval.is_zero())
        {
            return Err(Error::Config(
                "gc_batch_size, gc_max_windows and gc_interval must be > 0 when gc is enabled"
                    .into(),
            ));
        }
        if self.retry_backoff > MAX_RETRY_BACKOFF {
            return Err(Error::Config(format!(
                "retry_backoff must be at most {}s, got {:?}",
                MAX_RETRY_BACKOFF.as_secs(),
                self.retry_backoff
            )));
        }
        if self.initial_key == 0 {
            return Err(Error::Config(
                "initial_key must be > 0 (0 marks inline values)".into(),
            ));
        }
        if self.key_prefix.len() > 200 {
            return Err(Error::Config("key_prefix must be at most 200 bytes".into()));
        }
        self.compression.validate()
    }

    /// Whether a value of `len` bytes goes to the remote cache
    #[inline]
    pub fn externalizes(&self, len: usize) -> bool {
        self.sync_writes || len >= self.value_threshold
    }
}
