//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use cachelog::adapters::{InMemoryCacheStore, InMemoryTransport};
use cachelog::domain::{CacheTransport, LiveIndex, RetainAll};
use cachelog::valuelog::{ConnectionPool, MemcacheValueLog, ValueLogConfig};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Install a test subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Live Index Fixture
// =============================================================================

/// Index whose live set the test controls
#[derive(Debug, Default)]
pub struct TrackedIndex {
    dead: Mutex<HashSet<u32>>,
}

impl TrackedIndex {
    pub fn kill(&self, id: u32) {
        self.dead.lock().insert(id);
    }
}

impl LiveIndex for TrackedIndex {
    fn is_live(&self, id: u32) -> bool {
        !self.dead.lock().contains(&id)
    }
}

// =============================================================================
// In-Memory Backend Fixture
// =============================================================================

pub struct InMemoryBackend {
    pub vlog: Arc<MemcacheValueLog>,
    pub store: Arc<InMemoryCacheStore>,
    pub transports: Vec<Arc<InMemoryTransport>>,
}

pub fn in_memory_backend(config: ValueLogConfig) -> InMemoryBackend {
    in_memory_backend_with_index(config, Arc::new(RetainAll))
}

pub fn in_memory_backend_with_index(
    config: ValueLogConfig,
    index: Arc<dyn LiveIndex>,
) -> InMemoryBackend {
    init_tracing();
    let store = Arc::new(InMemoryCacheStore::new());
    let transports = InMemoryTransport::pool(&store, config.connections);
    let pool = ConnectionPool::from_transports(
        transports
            .iter()
            .map(|t| t.clone() as Arc<dyn CacheTransport>)
            .collect(),
    )
    .unwrap();
    let vlog = MemcacheValueLog::open_with_pool(index, config, pool).unwrap();
    InMemoryBackend {
        vlog: Arc::new(vlog),
        store,
        transports,
    }
}

// =============================================================================
// Fake Memcached Server
// =============================================================================

const GET: u8 = 0x00;
const NOOP: u8 = 0x0a;
const SETQ: u8 = 0x11;
const DELETEQ: u8 = 0x14;

#[derive(Default)]
struct ServerState {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    connections: AtomicUsize,
    gets: AtomicUsize,
    reject_sets: AtomicU32,
}

/// Minimal memcached speaking the binary protocol subset the value log uses
pub struct FakeMemcached {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept: JoinHandle<()>,
}

impl FakeMemcached {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());

        let accept = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, state.clone()));
                }
            })
        };
        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.state.data.lock().len()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.data.lock().get(key).cloned()
    }

    pub fn insert(&self, key: &[u8], value: Vec<u8>) {
        self.state.data.lock().insert(key.to_vec(), value);
    }

    /// Answer the next `count` SETQ requests with a temporary failure
    pub fn reject_next_sets(&self, count: u32) {
        self.state.reject_sets.store(count, Ordering::SeqCst);
    }
}

impl Drop for FakeMemcached {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

fn response(opcode: u8, status: u16, opaque: u32, extras: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + extras.len() + value.len());
    out.push(0x81);
    out.push(opcode);
    out.extend_from_slice(&0u16.to_be_bytes());
    out.push(extras.len() as u8);
    out.push(0);
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(&((extras.len() + value.len()) as u32).to_be_bytes());
    out.extend_from_slice(&opaque.to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(extras);
    out.extend_from_slice(value);
    out
}

async fn serve(socket: TcpStream, state: Arc<ServerState>) {
    let (reader, writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    loop {
        let mut head = [0u8; 24];
        if reader.read_exact(&mut head).await.is_err() {
            return;
        }
        let opcode = head[1];
        let key_len = u16::from_be_bytes([head[2], head[3]]) as usize;
        let extras_len = head[4] as usize;
        let body_len = u32::from_be_bytes([head[8], head[9], head[10], head[11]]) as usize;
        let opaque = u32::from_be_bytes([head[12], head[13], head[14], head[15]]);

        let mut body = vec![0u8; body_len];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let key = body[extras_len..extras_len + key_len].to_vec();
        let value = &body[extras_len + key_len..];

        let reply = match opcode {
            GET => {
                state.gets.fetch_add(1, Ordering::SeqCst);
                match state.data.lock().get(&key) {
                    Some(stored) => Some(response(GET, 0, opaque, &[0u8; 4], stored)),
                    None => Some(response(GET, 0x0001, opaque, &[], b"Not found")),
                }
            }
            SETQ => {
                let rejected = state
                    .reject_sets
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if rejected {
                    Some(response(SETQ, 0x0086, opaque, &[], b"Temporary failure"))
                } else {
                    state.data.lock().insert(key, value.to_vec());
                    None
                }
            }
            DELETEQ => match state.data.lock().remove(&key) {
                Some(_) => None,
                None => Some(response(DELETEQ, 0x0001, opaque, &[], b"Not found")),
            },
            NOOP => Some(response(NOOP, 0, opaque, &[], &[])),
            other => Some(response(other, 0x0081, opaque, &[], b"Unknown command")),
        };

        if let Some(reply) = reply {
            if writer.write_all(&reply).await.is_err() || writer.flush().await.is_err() {
                return;
            }
        }
    }
}
