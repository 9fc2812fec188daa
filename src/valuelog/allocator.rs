//! Key Allocator
//!
//! Process-unique identifiers for externalized values, and their rendering
//! into remote cache keys.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Monotonic identifier source shared by all writers.
///
/// Identifier 0 is reserved for the inline pointer sentinel and is never
/// issued. Running out of the 32-bit space is an error, never a wrap.
#[derive(Debug)]
pub struct KeyAllocator {
    first: u32,
    next: AtomicU32,
}

impl KeyAllocator {
    /// Create an allocator whose first identifier is `first` (0 is bumped to 1)
    pub fn new(first: u32) -> Self {
        let first = first.max(1);
        Self {
            first,
            next: AtomicU32::new(first),
        }
    }

    /// Issue the next identifier
    #[inline]
    pub fn allocate(&self) -> Result<u32> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(1))
            .map_err(|_| Error::KeySpaceExhausted)
    }

    /// Issue `count` consecutive identifiers at once, or none of them
    pub fn allocate_block(&self, count: u32) -> Result<Range<u32>> {
        let start = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(count))
            .map_err(|_| Error::KeySpaceExhausted)?;
        Ok(start..start + count)
    }

    /// First identifier this allocator handed out (or will hand out)
    pub fn first(&self) -> u32 {
        self.first
    }

    /// Identifier the next call to [`allocate`](Self::allocate) returns.
    /// Every issued identifier is strictly below it.
    pub fn high_water(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    /// Number of identifiers issued so far
    pub fn issued(&self) -> u64 {
        u64::from(self.high_water() - self.first)
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// How identifiers are rendered into remote cache keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// ASCII decimal, e.g. `"1234"`
    #[default]
    Decimal,
    /// Four big-endian bytes
    Binary,
}

/// Renders identifiers into remote cache keys
#[derive(Debug, Clone, Default)]
pub struct KeyRenderer {
    format: KeyFormat,
    prefix: Vec<u8>,
}

impl KeyRenderer {
    pub fn new(format: KeyFormat, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            format,
            prefix: prefix.into(),
        }
    }

    /// Render `id` as a cache key
    pub fn render(&self, id: u32) -> BytesMut {
        let mut key = BytesMut::with_capacity(self.prefix.len() + 10);
        key.put_slice(&self.prefix);
        match self.format {
            KeyFormat::Decimal => key.put_slice(id.to_string().as_bytes()),
            KeyFormat::Binary => key.put_u32(id),
        }
        key
    }

    /// Printable form of a key for logs and errors
    pub fn display(&self, id: u32) -> String {
        format!("{}{}", String::from_utf8_lossy(&self.prefix), id)
    }
}
