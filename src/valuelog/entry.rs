//! Entry and Pointer Types
//!
//! Value objects shared between the engine and the value log.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Entry is a tombstone.
pub const BIT_DELETE: u8 = 1 << 0;
/// Index slot holds a value pointer rather than an inline value.
pub const BIT_VALUE_POINTER: u8 = 1 << 1;
/// Frame payload is LZ4 compressed. Only ever set by the value log itself.
pub const BIT_COMPRESSED: u8 = 1 << 2;

/// A record the engine wants stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
    /// Metadata flags (see the `BIT_*` constants)
    pub meta: u8,
    /// Primary concurrency-control counter
    pub cas_counter: u64,
    /// Counter the engine checks for optimistic updates
    pub cas_counter_check: u64,
}

impl Entry {
    /// Create an entry with zeroed metadata and counters
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_meta(mut self, meta: u8) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_counters(mut self, cas_counter: u64, cas_counter_check: u64) -> Self {
        self.cas_counter = cas_counter;
        self.cas_counter_check = cas_counter_check;
        self
    }
}

/// An entry decoded in place.
///
/// Key and value borrow the scratch buffer handed to the read call, so the
/// view cannot outlive the next reuse of that buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub meta: u8,
    pub cas_counter: u64,
    pub cas_counter_check: u64,
}

impl EntryRef<'_> {
    /// Copy the view into an owned entry
    pub fn to_entry(&self) -> Entry {
        Entry {
            key: Bytes::copy_from_slice(self.key),
            value: Bytes::copy_from_slice(self.value),
            meta: self.meta,
            cas_counter: self.cas_counter,
            cas_counter_check: self.cas_counter_check,
        }
    }
}

/// Location of an externalized value.
///
/// The zero pointer is the inline sentinel: the value lives in the primary
/// index. Identifier 0 is never allocated and every frame carries a header,
/// so a zero length alone identifies the sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ValuePointer {
    /// Identifier the remote cache is addressed by
    pub id: u32,
    /// Encoded frame length in bytes
    pub len: u32,
}

impl ValuePointer {
    /// Encoded size of a pointer
    pub const ENCODED_SIZE: usize = 8;

    /// The "stored inline" sentinel
    pub const INLINE: ValuePointer = ValuePointer { id: 0, len: 0 };

    pub fn new(id: u32, len: u32) -> Self {
        Self { id, len }
    }

    /// Whether this is the inline sentinel
    #[inline]
    pub fn is_inline(&self) -> bool {
        self.len == 0
    }

    /// Big-endian `id ‖ len`, as persisted in the engine's index
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[..4].copy_from_slice(&self.id.to_be_bytes());
        out[4..].copy_from_slice(&self.len.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(Error::Corrupt(format!(
                "value pointer needs {} bytes, got {}",
                Self::ENCODED_SIZE,
                buf.len()
            )));
        }
        let id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self { id, len })
    }
}

impl std::fmt::Display for ValuePointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_inline() {
            write!(f, "inline")
        } else {
            write!(f, "{}+{}", self.id, self.len)
        }
    }
}

/// One batch handed to `write`.
///
/// `ptrs` is filled by the value log, one pointer per entry, in entry order.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub entries: Vec<Entry>,
    pub ptrs: Vec<ValuePointer>,
}

impl WriteRequest {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            ptrs: Vec::with_capacity(entries.len()),
            entries,
        }
    }
}
