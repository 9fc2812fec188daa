//! Infrastructure Adapters
//!
//! Implementations of the [`CacheTransport`](crate::domain::CacheTransport)
//! port, following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │               CacheTransport │ LiveIndex                    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │      MemcacheConnection      │     InMemoryTransport        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cachelog::adapters::MemcacheConnection;
//! use cachelog::domain::CacheTransport;
//!
//! let conn = MemcacheConnection::connect("127.0.0.1:11211", timeout, timeout, 0).await?;
//! let tag = conn.store_quiet(b"42", &frame).await?;
//! let failures = conn.flush(&[tag]).await?;
//! ```

mod in_memory;
pub mod memcache;

pub use in_memory::{InMemoryCacheStore, InMemoryTransport};
pub use memcache::{MemcacheConnection, Status};
