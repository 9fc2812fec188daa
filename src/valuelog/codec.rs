//! Frame Codec
//!
//! Binary framing of entries for storage in the remote cache.
//!
//! # Layout
//!
//! ```text
//! ┌────────────┬──────────────┬──────────┬──────────────────┬────────────────────────┬─────────────┐
//! │ key_len u32│ value_len u32│ meta u8  │ cas_counter u64  │ cas_counter_check u64  │ payload     │
//! └────────────┴──────────────┴──────────┴──────────────────┴────────────────────────┴─────────────┘
//! ```
//!
//! All integers are big-endian. Uncompressed payloads are `key ‖ value`.
//! When `BIT_COMPRESSED` is set the payload is an LZ4 block of `key ‖ value`
//! and `value_len` is the length of that block on the wire; the real value
//! length is recovered as `decompressed_len - key_len`.

use bytes::{Buf, BufMut, BytesMut};
use tracing::error;

use super::compression::{decompressed_size, PayloadCompressor};
use super::entry::{Entry, EntryRef, BIT_COMPRESSED};
use crate::error::{Error, Result};

/// Encoded header size in bytes
pub const HEADER_SIZE: usize = 4 + 4 + 1 + 8 + 8;

/// Fixed-width frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub key_len: u32,
    pub value_len: u32,
    pub meta: u8,
    pub cas_counter: u64,
    pub cas_counter_check: u64,
}

impl Header {
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.key_len);
        out.put_u32(self.value_len);
        out.put_u8(self.meta);
        out.put_u64(self.cas_counter);
        out.put_u64(self.cas_counter_check);
    }

    /// Parse the header at the start of `frame`
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        let mut buf = &frame[..HEADER_SIZE];
        Ok(Self {
            key_len: buf.get_u32(),
            value_len: buf.get_u32(),
            meta: buf.get_u8(),
            cas_counter: buf.get_u64(),
            cas_counter_check: buf.get_u64(),
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.meta & BIT_COMPRESSED != 0
    }
}

/// Encodes entries into frames and decodes frames back into entry views.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    compressor: PayloadCompressor,
}

impl FrameCodec {
    pub fn new(compressor: PayloadCompressor) -> Self {
        Self { compressor }
    }

    /// Reject entries whose caller already set the compressed bit.
    ///
    /// Applies to every entry handed to the value log, inline or not.
    pub fn check(entry: &Entry) -> Result<()> {
        if entry.meta & BIT_COMPRESSED != 0 {
            error!(
                key_len = entry.key.len(),
                meta = entry.meta,
                "Entry arrived with the compressed bit already set"
            );
            return Err(Error::CompressedBitPreset);
        }
        Ok(())
    }

    /// Append the frame for `entry` to `out`, returning the frame length.
    ///
    /// Fails with [`Error::CompressedBitPreset`] when the caller already set
    /// the compressed bit.
    pub fn encode(&self, entry: &Entry, out: &mut BytesMut) -> Result<usize> {
        Self::check(entry)?;
        let key_len = u32::try_from(entry.key.len()).map_err(|_| Error::FrameTooLarge {
            len: entry.key.len(),
        })?;

        let start = out.len();
        if self.compressor.wants(entry.value.len()) {
            let mut plain = Vec::with_capacity(entry.key.len() + entry.value.len());
            plain.extend_from_slice(&entry.key);
            plain.extend_from_slice(&entry.value);

            if let Some(block) = self.compressor.compress(&plain)? {
                let payload_len = u32::try_from(block.len())
                    .map_err(|_| Error::FrameTooLarge { len: block.len() })?;
                out.reserve(HEADER_SIZE + block.len());
                Header {
                    key_len,
                    value_len: payload_len,
                    meta: entry.meta | BIT_COMPRESSED,
                    cas_counter: entry.cas_counter,
                    cas_counter_check: entry.cas_counter_check,
                }
                .encode(out);
                out.put_slice(block.as_ref());
                return Ok(out.len() - start);
            }
        }

        let value_len = u32::try_from(entry.value.len()).map_err(|_| Error::FrameTooLarge {
            len: entry.value.len(),
        })?;
        out.reserve(HEADER_SIZE + entry.key.len() + entry.value.len());
        Header {
            key_len,
            value_len,
            meta: entry.meta,
            cas_counter: entry.cas_counter,
            cas_counter_check: entry.cas_counter_check,
        }
        .encode(out);
        out.put_slice(&entry.key);
        out.put_slice(&entry.value);
        Ok(out.len() - start)
    }

    /// Decode the frame held in `scratch`.
    ///
    /// `scratch` must contain exactly one frame. Compressed payloads are
    /// inflated into the tail of the same buffer, which is grown as needed,
    /// and the returned view borrows from it.
    pub fn decode<'a>(&self, scratch: &'a mut Vec<u8>) -> Result<EntryRef<'a>> {
        let header = Header::decode(&scratch[..])?;
        let frame_len = scratch.len();
        let key_len = header.key_len as usize;
        let value_len = header.value_len as usize;

        if !header.is_compressed() {
            let expected = HEADER_SIZE as u64 + key_len as u64 + value_len as u64;
            if expected != frame_len as u64 {
                return Err(Error::Corrupt(format!(
                    "header declares {expected} bytes, frame has {frame_len}"
                )));
            }
            let buf: &'a [u8] = scratch.as_slice();
            let key_end = HEADER_SIZE + key_len;
            return Ok(EntryRef {
                key: &buf[HEADER_SIZE..key_end],
                value: &buf[key_end..key_end + value_len],
                meta: header.meta,
                cas_counter: header.cas_counter,
                cas_counter_check: header.cas_counter_check,
            });
        }

        if HEADER_SIZE + value_len != frame_len {
            return Err(Error::Corrupt(format!(
                "compressed payload declares {value_len} bytes, frame carries {}",
                frame_len - HEADER_SIZE
            )));
        }
        let inflated_len = decompressed_size(&scratch[HEADER_SIZE..])?;
        if inflated_len <= key_len {
            return Err(Error::Corrupt(format!(
                "decompressed length {inflated_len} does not exceed key length {key_len}"
            )));
        }

        scratch.resize(frame_len + inflated_len, 0);
        let (frame, inflated) = scratch.split_at_mut(frame_len);
        self.compressor
            .decompress_into(&frame[HEADER_SIZE..], inflated)?;

        let buf: &'a [u8] = scratch.as_slice();
        let body = &buf[frame_len..];
        Ok(EntryRef {
            key: &body[..key_len],
            value: &body[key_len..],
            meta: header.meta,
            cas_counter: header.cas_counter,
            cas_counter_check: header.cas_counter_check,
        })
    }

    pub fn compressor(&self) -> &PayloadCompressor {
        &self.compressor
    }
}
