//! Memcached Binary Protocol Adapter
//!
//! A [`CacheTransport`] over one TCP connection speaking the memcached
//! binary protocol. Only the commands the value log needs are implemented:
//! `GET`, `SETQ`, `DELETEQ` and `NOOP`.
//!
//! Requests and responses are correlated through the `opaque` header field.
//! Quiet commands only answer on failure, so a fetch may read failure
//! responses that belong to earlier quiet commands; those are parked until
//! a [`flush`](CacheTransport::flush) claims their tag. A flush sends a
//! `NOOP` and reads until its answer arrives.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, warn};

use crate::domain::ports::{CacheTransport, QuietFailure};
use crate::error::{Error, Result};

// =============================================================================
// Wire Constants
// =============================================================================

/// Magic byte of a request header
pub const REQUEST_MAGIC: u8 = 0x80;
/// Magic byte of a response header
pub const RESPONSE_MAGIC: u8 = 0x81;
/// Size of request and response headers
pub const HEADER_LEN: usize = 24;
/// Longest key memcached accepts
pub const MAX_KEY_LEN: usize = 250;
/// Unclaimed quiet failures kept per connection
const MAX_PARKED: usize = 4096;

/// Commands used by the value log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Noop = 0x0a,
    SetQ = 0x11,
    DeleteQ = 0x14,
}

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    UnknownCommand,
    OutOfMemory,
    Busy,
    TemporaryFailure,
    Other(u16),
}

impl Status {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => Status::NoError,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            other => Status::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Status::NoError => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::Busy => 0x0085,
            Status::TemporaryFailure => 0x0086,
            Status::Other(code) => *code,
        }
    }

    /// Whether repeating the request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Status::OutOfMemory | Status::Busy | Status::TemporaryFailure | Status::ItemNotStored
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::NoError => write!(f, "no error"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key exists"),
            Status::ValueTooLarge => write!(f, "value too large"),
            Status::InvalidArguments => write!(f, "invalid arguments"),
            Status::ItemNotStored => write!(f, "item not stored"),
            Status::UnknownCommand => write!(f, "unknown command"),
            Status::OutOfMemory => write!(f, "out of memory"),
            Status::Busy => write!(f, "busy"),
            Status::TemporaryFailure => write!(f, "temporary failure"),
            Status::Other(code) => write!(f, "status {code:#06x}"),
        }
    }
}

// =============================================================================
// Header Codec
// =============================================================================

/// Append a request header plus extras and key. The value, if any, is
/// written separately by the caller; `value_len` only sizes the body.
pub fn encode_request_head(
    buf: &mut BytesMut,
    opcode: Opcode,
    key: &[u8],
    extras: &[u8],
    value_len: usize,
    opaque: u32,
) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::Protocol(format!(
            "key of {} bytes exceeds the {MAX_KEY_LEN} byte limit",
            key.len()
        )));
    }
    let body_len = extras.len() + key.len() + value_len;
    let body_len = u32::try_from(body_len)
        .map_err(|_| Error::Protocol(format!("request body of {body_len} bytes")))?;

    buf.reserve(HEADER_LEN + extras.len() + key.len());
    buf.put_u8(REQUEST_MAGIC);
    buf.put_u8(opcode as u8);
    buf.put_u16(key.len() as u16);
    buf.put_u8(extras.len() as u8);
    buf.put_u8(0); // data type
    buf.put_u16(0); // vbucket
    buf.put_u32(body_len);
    buf.put_u32(opaque);
    buf.put_u64(0); // cas
    buf.put_slice(extras);
    buf.put_slice(key);
    Ok(())
}

/// Parsed response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut buf = &raw[..];
        let magic = buf.get_u8();
        if magic != RESPONSE_MAGIC {
            return Err(Error::Protocol(format!(
                "bad response magic {magic:#04x}"
            )));
        }
        let opcode = buf.get_u8();
        let key_len = buf.get_u16();
        let extras_len = buf.get_u8();
        let _data_type = buf.get_u8();
        let status = buf.get_u16();
        let body_len = buf.get_u32();
        let opaque = buf.get_u32();
        let cas = buf.get_u64();

        if u32::from(key_len) + u32::from(extras_len) > body_len {
            return Err(Error::Protocol(format!(
                "response body of {body_len} bytes cannot hold {extras_len} extras and {key_len} key bytes"
            )));
        }
        Ok(Self {
            opcode,
            key_len,
            extras_len,
            status,
            body_len,
            opaque,
            cas,
        })
    }

    /// Bytes preceding the value in the body
    pub fn prefix_len(&self) -> usize {
        self.extras_len as usize + self.key_len as usize
    }

    /// Length of the value carried in the body
    pub fn value_len(&self) -> usize {
        self.body_len as usize - self.prefix_len()
    }
}

// =============================================================================
// Session
// =============================================================================

/// Connection state guarded by the transport's lock
struct Session {
    stream: BufStream<TcpStream>,
    head: BytesMut,
    parked: Vec<QuietFailure>,
    broken: bool,
}

impl Session {
    async fn write_request(&mut self, value: &[u8]) -> Result<()> {
        self.stream.write_all(&self.head).await?;
        if !value.is_empty() {
            self.stream.write_all(value).await?;
        }
        Ok(())
    }

    async fn read_header(&mut self) -> Result<ResponseHeader> {
        let mut raw = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut raw).await?;
        ResponseHeader::parse(&raw)
    }

    async fn skip(&mut self, len: usize) -> Result<()> {
        let mut limited = (&mut self.stream).take(len as u64);
        let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if copied != len as u64 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }

    async fn read_message(&mut self, header: &ResponseHeader) -> Result<String> {
        self.skip(header.prefix_len()).await?;
        let mut message = vec![0u8; header.value_len()];
        self.stream.read_exact(&mut message).await?;
        Ok(String::from_utf8_lossy(&message).into_owned())
    }

    /// Handle a response that answers some other request
    async fn park(&mut self, header: ResponseHeader) -> Result<()> {
        let status = Status::from_u16(header.status);
        if status == Status::NoError {
            debug!(opaque = header.opaque, "Discarding unexpected success response");
            return self.skip(header.body_len as usize).await;
        }
        let message = self.read_message(&header).await?;
        self.parked.push(QuietFailure {
            tag: header.opaque,
            status: header.status,
            reason: if message.is_empty() {
                status.to_string()
            } else {
                message
            },
            retryable: status.is_retryable(),
        });
        Ok(())
    }

    /// Remove and return the parked failures belonging to `tags`
    fn claim(&mut self, tags: &[u32]) -> Vec<QuietFailure> {
        let owned: HashSet<u32> = tags.iter().copied().collect();
        let (claimed, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|failure| owned.contains(&failure.tag));
        self.parked = rest;
        if self.parked.len() > MAX_PARKED {
            let excess = self.parked.len() - MAX_PARKED;
            warn!(excess, "Dropping unclaimed quiet failures");
            self.parked.drain(..excess);
        }
        claimed
    }

    async fn fetch(&mut self, opaque: u32, key: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.head.clear();
        encode_request_head(&mut self.head, Opcode::Get, key, &[], 0, opaque)?;
        self.write_request(&[]).await?;
        self.stream.flush().await?;

        loop {
            let header = self.read_header().await?;
            if header.opaque != opaque {
                self.park(header).await?;
                continue;
            }
            return match Status::from_u16(header.status) {
                Status::NoError => {
                    self.skip(header.prefix_len()).await?;
                    out.clear();
                    out.resize(header.value_len(), 0);
                    self.stream.read_exact(out).await?;
                    Ok(())
                }
                Status::KeyNotFound => {
                    self.skip(header.body_len as usize).await?;
                    Err(Error::NotFound {
                        key: String::from_utf8_lossy(key).into_owned(),
                    })
                }
                _ => {
                    let message = self.read_message(&header).await?;
                    Err(Error::Remote {
                        status: header.status,
                        message,
                    })
                }
            };
        }
    }

    async fn flush(&mut self, opaque: u32, tags: &[u32]) -> Result<Vec<QuietFailure>> {
        self.head.clear();
        encode_request_head(&mut self.head, Opcode::Noop, &[], &[], 0, opaque)?;
        self.write_request(&[]).await?;
        self.stream.flush().await?;

        loop {
            let header = self.read_header().await?;
            if header.opaque == opaque && header.opcode == Opcode::Noop as u8 {
                self.skip(header.body_len as usize).await?;
                return Ok(self.claim(tags));
            }
            self.park(header).await?;
        }
    }
}

/// Errors after which the byte stream can no longer be trusted
fn poisons_stream(err: &Error) -> bool {
    matches!(err, Error::Io(_) | Error::Protocol(_))
}

// =============================================================================
// Memcache Connection
// =============================================================================

/// One memcached binary-protocol connection.
pub struct MemcacheConnection {
    addr: String,
    io_timeout: Duration,
    expiration: u32,
    next_opaque: AtomicU32,
    session: Mutex<Session>,
}

impl MemcacheConnection {
    /// Connect to `addr` within `connect_timeout`.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
        expiration: u32,
    ) -> Result<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    addr: addr.to_string(),
                })
            }
            Ok(Err(source)) => {
                return Err(Error::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;

        Ok(Self {
            addr: addr.to_string(),
            io_timeout,
            expiration,
            next_opaque: AtomicU32::new(1),
            session: Mutex::new(Session {
                stream: BufStream::new(stream),
                head: BytesMut::with_capacity(HEADER_LEN + MAX_KEY_LEN + 8),
                parked: Vec::new(),
                broken: false,
            }),
        })
    }

    fn opaque(&self) -> u32 {
        self.next_opaque.fetch_add(1, Ordering::Relaxed)
    }

    /// Translate a timed exchange, marking the session broken when the
    /// stream position is no longer known.
    fn finish<T>(
        &self,
        session: &mut Session,
        outcome: std::result::Result<Result<T>, Elapsed>,
    ) -> Result<T> {
        match outcome {
            Err(_) => {
                session.broken = true;
                warn!(addr = %self.addr, "Memcached request timed out, dropping connection");
                Err(Error::Timeout {
                    addr: self.addr.clone(),
                })
            }
            Ok(Err(err)) => {
                if poisons_stream(&err) {
                    session.broken = true;
                    warn!(addr = %self.addr, error = %err, "Memcached connection failed");
                }
                Err(err)
            }
            Ok(Ok(value)) => Ok(value),
        }
    }

    fn check(&self, session: &Session) -> Result<()> {
        if session.broken {
            return Err(Error::ConnectionBroken {
                addr: self.addr.clone(),
            });
        }
        Ok(())
    }

    async fn quiet(&self, opcode: Opcode, key: &[u8], extras: &[u8], value: &[u8]) -> Result<u32> {
        let opaque = self.opaque();
        let mut session = self.session.lock().await;
        self.check(&session)?;

        session.head.clear();
        encode_request_head(&mut session.head, opcode, key, extras, value.len(), opaque)?;
        let outcome = timeout(self.io_timeout, session.write_request(value)).await;
        self.finish(&mut session, outcome)?;
        Ok(opaque)
    }
}

#[async_trait]
impl CacheTransport for MemcacheConnection {
    async fn store_quiet(&self, key: &[u8], value: &[u8]) -> Result<u32> {
        let mut extras = [0u8; 8];
        // flags stay zero; expiration in the second word
        extras[4..].copy_from_slice(&self.expiration.to_be_bytes());
        self.quiet(Opcode::SetQ, key, &extras, value).await
    }

    async fn delete_quiet(&self, key: &[u8]) -> Result<u32> {
        self.quiet(Opcode::DeleteQ, key, &[], &[]).await
    }

    async fn flush(&self, tags: &[u32]) -> Result<Vec<QuietFailure>> {
        let opaque = self.opaque();
        let mut session = self.session.lock().await;
        self.check(&session)?;
        let outcome = timeout(self.io_timeout, session.flush(opaque, tags)).await;
        self.finish(&mut session, outcome)
    }

    async fn fetch_into(&self, key: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let opaque = self.opaque();
        let mut session = self.session.lock().await;
        self.check(&session)?;
        let outcome = timeout(self.io_timeout, session.fetch(opaque, key, out)).await;
        self.finish(&mut session, outcome)
    }

    fn peer(&self) -> &str {
        &self.addr
    }
}

impl std::fmt::Debug for MemcacheConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcacheConnection")
            .field("addr", &self.addr)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}
