//! Error types for the remote-cache value log

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the value log
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Could not open a connection to the remote cache
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection attempt exceeded the configured timeout
    #[error("Timed out connecting to {addr}")]
    ConnectTimeout { addr: String },

    /// A request exceeded the configured I/O timeout
    #[error("Request to {addr} timed out")]
    Timeout { addr: String },

    /// Key not present in the remote cache
    #[error("Key not found in remote cache: {key}")]
    NotFound { key: String },

    /// Remote cache answered with an error status
    #[error("Remote cache returned status {status:#06x}: {message}")]
    Remote { status: u16, message: String },

    /// Malformed response from the remote cache
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection is unusable after an earlier failure
    #[error("Connection to {addr} is broken")]
    ConnectionBroken { addr: String },

    /// Read hint does not name a pooled connection
    #[error("Invalid connection hint {hint} (pool has {connections} connections)")]
    InvalidHint { hint: usize, connections: usize },

    // =========================================================================
    // Frame Errors
    // =========================================================================
    /// Frame failed validation on decode
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Inline pointers have no remote value to read
    #[error("Cannot read through an inline value pointer")]
    InlinePointer,

    /// Caller handed in an entry with the compressed bit already set
    #[error("Cannot set the compressed bit outside the value log")]
    CompressedBitPreset,

    /// Encoded frame does not fit in a value pointer
    #[error("Frame of {len} bytes exceeds the pointer length limit")]
    FrameTooLarge { len: usize },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// All 32-bit identifiers have been issued
    #[error("Value log key space exhausted")]
    KeySpaceExhausted,

    /// Operation attempted after close
    #[error("Value log is closed")]
    Closed,

    /// A background worker hit a fatal transport error
    #[error("Value log failed: {0}")]
    BackendFailed(String),

    /// Writes were abandoned after exhausting their retry budget
    #[error("{count} externalized writes were dropped after retries")]
    WritesDropped { count: u64 },

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// True when the remote cache has no value for the requested key
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True when a frame failed validation
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupt(_))
    }
}
