//! cachelog - Remote-Cache Value Log
//!
//! A value-log backend for LSM key-value engines that keeps large values in
//! a memcached node instead of local append-only files. The engine stores a
//! compact [`ValuePointer`] in its index; this crate frames, compresses,
//! ships, fetches and reclaims the values behind those pointers.
//!
//! # Architecture
//!
//! ```text
//! Engine ──► ValueLog port ──► MemcacheValueLog ──► CacheTransport ──► memcached
//!    ▲                               │
//!    └──────── LiveIndex port ◄──────┘ (garbage collection)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Memcached binary protocol and in-memory transports
//! - [`domain`] - Ports the backend offers and depends on
//! - [`error`] - Error types
//! - [`valuelog`] - Framing, compression, write pipeline and the backend
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cachelog::{MemcacheValueLog, ValueLog, ValueLogConfig, WriteRequest, Entry};
//! use cachelog::domain::RetainAll;
//!
//! let vlog = MemcacheValueLog::open(Arc::new(RetainAll), ValueLogConfig::default()).await?;
//! let mut reqs = vec![WriteRequest::new(vec![Entry::new("user:1", big_value)])];
//! vlog.write(&mut reqs).await?;
//! vlog.sync().await?;
//!
//! let mut scratch = Vec::new();
//! let entry = vlog.read(reqs[0].ptrs[0], &mut scratch, 0).await?;
//! ```

pub mod adapters;
pub mod domain;
pub mod error;
pub mod valuelog;

// Re-export commonly used types
pub use domain::{LiveIndex, ValueLog};
pub use error::{Error, Result};
pub use valuelog::{
    Entry, EntryRef, MemcacheValueLog, SyncMode, ValueLogConfig, ValuePointer, WriteRequest,
};
