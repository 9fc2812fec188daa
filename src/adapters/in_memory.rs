//! In-Memory Cache Transport
//!
//! A [`CacheTransport`] backed by a process-local map. Several transports can
//! share one [`InMemoryCacheStore`], which models a pool of connections to a
//! single cache node. Used by tests and by embedders that want the value log
//! semantics without a running memcached.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::memcache::Status;
use crate::domain::ports::{CacheTransport, QuietFailure};
use crate::error::{Error, Result};

/// Shared key/value storage standing in for a cache node
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<Vec<u8>, Bytes>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.get(key).map(|value| value.clone())
    }

    /// Place a value directly, bypassing any transport
    pub fn insert(&self, key: impl Into<Vec<u8>>, value: impl Into<Bytes>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.remove(key).map(|(_, value)| value)
    }
}

/// One simulated connection to an [`InMemoryCacheStore`]
pub struct InMemoryTransport {
    name: String,
    store: Arc<InMemoryCacheStore>,
    next_tag: AtomicU32,
    pending: Mutex<Vec<QuietFailure>>,

    // Fault injection
    reject_stores: AtomicU32,
    reject_permanently: AtomicBool,
    broken: AtomicBool,

    // Statistics
    fetches: AtomicU64,
    stores: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
}

impl InMemoryTransport {
    pub fn new(name: impl Into<String>, store: Arc<InMemoryCacheStore>) -> Self {
        Self {
            name: name.into(),
            store,
            next_tag: AtomicU32::new(1),
            pending: Mutex::new(Vec::new()),
            reject_stores: AtomicU32::new(0),
            reject_permanently: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// `count` transports sharing `store`, named `mem-0`, `mem-1`, ...
    pub fn pool(store: &Arc<InMemoryCacheStore>, count: usize) -> Vec<Arc<Self>> {
        (0..count)
            .map(|i| Arc::new(Self::new(format!("mem-{i}"), store.clone())))
            .collect()
    }

    /// Reject the next `count` stores with a temporary failure
    pub fn fail_next_stores(&self, count: u32) {
        self.reject_stores.store(count, Ordering::Release);
    }

    /// Reject every store as too large until switched off
    pub fn reject_all_stores(&self, reject: bool) {
        self.reject_permanently.store(reject, Ordering::Release);
    }

    /// Make every subsequent operation fail as if the socket died
    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Stores received, including rejected ones
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.broken.load(Ordering::Acquire) {
            return Err(Error::ConnectionBroken {
                addr: self.name.clone(),
            });
        }
        Ok(())
    }

    fn tag(&self) -> u32 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn reject(&self, tag: u32, status: Status) {
        self.pending.lock().push(QuietFailure {
            tag,
            status: status.code(),
            reason: status.to_string(),
            retryable: status.is_retryable(),
        });
    }
}

#[async_trait]
impl CacheTransport for InMemoryTransport {
    async fn store_quiet(&self, key: &[u8], value: &[u8]) -> Result<u32> {
        self.check()?;
        self.stores.fetch_add(1, Ordering::Relaxed);
        let tag = self.tag();

        let transient = self
            .reject_stores
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            self.reject(tag, Status::TemporaryFailure);
        } else if self.reject_permanently.load(Ordering::Acquire) {
            self.reject(tag, Status::ValueTooLarge);
        } else {
            self.store
                .insert(key.to_vec(), Bytes::copy_from_slice(value));
        }
        Ok(tag)
    }

    async fn delete_quiet(&self, key: &[u8]) -> Result<u32> {
        self.check()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let tag = self.tag();
        if self.store.remove(key).is_none() {
            self.reject(tag, Status::KeyNotFound);
        }
        Ok(tag)
    }

    async fn flush(&self, tags: &[u32]) -> Result<Vec<QuietFailure>> {
        self.check()?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        let (claimed, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
            .into_iter()
            .partition(|failure| tags.contains(&failure.tag));
        *pending = rest;
        Ok(claimed)
    }

    async fn fetch_into(&self, key: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.check()?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        match self.store.get(key) {
            Some(value) => {
                out.clear();
                out.extend_from_slice(&value);
                Ok(())
            }
            None => Err(Error::NotFound {
                key: String::from_utf8_lossy(key).into_owned(),
            }),
        }
    }

    fn peer(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("name", &self.name)
            .field("fetches", &self.fetch_count())
            .field("stores", &self.store_count())
            .finish()
    }
}
