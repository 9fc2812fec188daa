//! Remote-Cache Value Log
//!
//! Value separation for an LSM engine: small values stay inline in the
//! primary index, large ones are framed, optionally LZ4-compressed and
//! stored in memcached under a process-unique numeric key. The index keeps
//! only an 8-byte [`ValuePointer`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       MemcacheValueLog                            │
//! │                                                                    │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────┐   ┌────────┐  │
//! │  │ FrameCodec │   │ Allocator  │   │ WritePipeline│   │   GC   │  │
//! │  │  + LZ4     │   │  + Keys    │   │  N workers   │   │ window │  │
//! │  └────────────┘   └────────────┘   └──────┬───────┘   └───┬────┘  │
//! │                                           │               │       │
//! │  ┌────────────────────────────────────────▼───────────────▼────┐  │
//! │  │                  ConnectionPool (N transports)               │  │
//! │  └──────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Frame Layout
//!
//! ```text
//! ┌──────────┬────────────┬──────┬─────────────┬───────────────────┬─────────┐
//! │ key_len  │ value_len  │ meta │ cas_counter │ cas_counter_check │ payload │
//! │ u32 BE   │ u32 BE     │ u8   │ u64 BE      │ u64 BE            │         │
//! └──────────┴────────────┴──────┴─────────────┴───────────────────┴─────────┘
//! ```
//!
//! The payload is `key ‖ value`, or an LZ4 block of it when the
//! [`BIT_COMPRESSED`] meta bit is set (then `value_len` is the block length).

pub mod allocator;
pub mod codec;
pub mod compression;
pub mod config;
pub mod entry;
pub mod gc;
pub mod memcache_log;
pub mod metrics;
mod pipeline;
pub mod pool;

mod proptest;

pub use allocator::{KeyAllocator, KeyFormat, KeyRenderer};
pub use codec::{FrameCodec, Header, HEADER_SIZE};
pub use compression::{CompressionAlgorithm, CompressionConfig, PayloadCompressor};
pub use config::{SyncMode, ValueLogConfig};
pub use entry::{
    Entry, EntryRef, ValuePointer, WriteRequest, BIT_COMPRESSED, BIT_DELETE, BIT_VALUE_POINTER,
};
pub use gc::{GcReport, GcState};
pub use memcache_log::MemcacheValueLog;
pub use metrics::{MetricsSnapshot, ValueLogMetrics};
pub use pipeline::DeadLetter;
pub use pool::ConnectionPool;
