//! Domain Ports (Port/Adapter Pattern)
//!
//! The abstractions the value log is built on and the one it offers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Storage Engine                           │
//! │        owns a ValueLog, implements LiveIndex                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Ports (Traits)                          │
//! │      ValueLog   │   CacheTransport   │   LiveIndex          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Adapters (Impls)                           │
//! │   MemcacheValueLog │ MemcacheConnection │ InMemoryTransport │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::valuelog::{EntryRef, ValuePointer, WriteRequest};

// =============================================================================
// Value Log Port
// =============================================================================

/// Visitor invoked by [`ValueLog::replay`]. Returning `Ok(false)` stops the
/// iteration.
pub type ReplayVisitor<'v> =
    dyn FnMut(EntryRef<'_>, ValuePointer) -> Result<bool> + Send + 'v;

/// Contract every value-storage backend satisfies so the engine can treat
/// them interchangeably.
///
/// All methods except `open` take `&self` and are safe to call concurrently.
#[async_trait]
pub trait ValueLog: Send + Sync {
    /// Backend-specific configuration
    type Config: Send + 'static;

    /// Establish all resources. Failure yields no backend.
    async fn open(index: Arc<dyn LiveIndex>, config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    /// Stop background activity and release resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Fetch and decode the entry behind `ptr` using connection `hint`.
    ///
    /// The returned view borrows `scratch`. The inline sentinel must never be
    /// passed here.
    async fn read<'a>(
        &self,
        ptr: ValuePointer,
        scratch: &'a mut Vec<u8>,
        hint: usize,
    ) -> Result<EntryRef<'a>>;

    /// Externalize the entries of each request that need it, filling
    /// `ptrs` in entry order.
    ///
    /// Entries are validated and encoded before anything is stored, so a
    /// rejected entry leaves the whole batch unwritten. A failure while
    /// queueing (backend closed or failed) may leave earlier frames queued.
    async fn write(&self, reqs: &mut [WriteRequest]) -> Result<()>;

    /// Make every write accepted before this call visible to reads.
    async fn sync(&self) -> Result<()>;

    /// Visit entries from `ptr` forward.
    async fn replay(&self, ptr: ValuePointer, visitor: &mut ReplayVisitor<'_>) -> Result<()>;

    /// Background reclamation loop; returns once `shutdown` fires or the
    /// backend closes.
    async fn run_gc_in_loop(&self, shutdown: CancellationToken);
}

// =============================================================================
// Live Index Port
// =============================================================================

/// The engine's view of which externalized values are still referenced.
pub trait LiveIndex: Send + Sync {
    /// Whether the primary index still points at identifier `id`
    fn is_live(&self, id: u32) -> bool;
}

/// Index that keeps every value alive; garbage collection never deletes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetainAll;

impl LiveIndex for RetainAll {
    fn is_live(&self, _id: u32) -> bool {
        true
    }
}

// =============================================================================
// Cache Transport Port
// =============================================================================

/// A quiet operation the remote cache rejected, reported at the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuietFailure {
    /// Tag returned when the operation was issued
    pub tag: u32,
    /// Remote status code
    pub status: u16,
    /// Human-readable reason
    pub reason: String,
    /// Whether issuing the same operation again may succeed
    pub retryable: bool,
}

/// One session with a remote cache node.
///
/// Implementations must tolerate a fetch interleaving with quiet operations
/// issued by another task: failures observed out of turn are kept until a
/// `flush` claims their tag.
#[async_trait]
pub trait CacheTransport: Send + Sync {
    /// Store `value` under `key` without waiting for an acknowledgement.
    /// Returns a tag identifying the operation in later flush results.
    async fn store_quiet(&self, key: &[u8], value: &[u8]) -> Result<u32>;

    /// Delete `key` without waiting for an acknowledgement.
    async fn delete_quiet(&self, key: &[u8]) -> Result<u32>;

    /// Wait until every quiet operation issued so far has been processed and
    /// return the failures among `tags`. Failures of other tags stay pending
    /// for the task that issued them.
    async fn flush(&self, tags: &[u32]) -> Result<Vec<QuietFailure>>;

    /// Fetch the value stored under `key` into `out`, replacing its contents.
    async fn fetch_into(&self, key: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Endpoint description for logs
    fn peer(&self) -> &str;
}
