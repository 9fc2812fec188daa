//! Connection Pool
//!
//! A fixed set of transports opened together. Slot `i` is addressed by the
//! caller's hint; there is no checkout, so one slot may serve a reader and
//! its write worker at the same time.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{info, instrument};

use super::config::ValueLogConfig;
use crate::adapters::MemcacheConnection;
use crate::domain::ports::CacheTransport;
use crate::error::{Error, Result};

/// Fixed-size pool of cache transports
#[derive(Clone)]
pub struct ConnectionPool {
    conns: Vec<Arc<dyn CacheTransport>>,
}

impl ConnectionPool {
    /// Open `config.connections` memcached connections concurrently.
    ///
    /// Any single failure fails the whole pool; connections already
    /// established are dropped.
    #[instrument(skip(config), fields(server = %config.server, connections = config.connections))]
    pub async fn connect(config: &ValueLogConfig) -> Result<Self> {
        if config.connections == 0 {
            return Err(Error::Config("connections must be > 0".into()));
        }
        let attempts = (0..config.connections).map(|_| {
            MemcacheConnection::connect(
                &config.server,
                config.connect_timeout,
                config.io_timeout,
                config.expiration,
            )
        });
        let conns = try_join_all(attempts)
            .await?
            .into_iter()
            .map(|conn| Arc::new(conn) as Arc<dyn CacheTransport>)
            .collect::<Vec<_>>();

        info!(connections = conns.len(), "Connection pool established");
        Ok(Self { conns })
    }

    /// Build a pool from already-open transports
    pub fn from_transports(conns: Vec<Arc<dyn CacheTransport>>) -> Result<Self> {
        if conns.is_empty() {
            return Err(Error::Config("connection pool must not be empty".into()));
        }
        Ok(Self { conns })
    }

    /// Transport in slot `hint`
    #[inline]
    pub fn get(&self, hint: usize) -> Result<&Arc<dyn CacheTransport>> {
        self.conns.get(hint).ok_or(Error::InvalidHint {
            hint,
            connections: self.conns.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CacheTransport>> {
        self.conns.iter()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field(
                "peers",
                &self.conns.iter().map(|c| c.peer()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
