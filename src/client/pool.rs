//! Connection Pool
//!
//! Reusable transport connections keyed by target address. Each address has
//! an idle stack; a caller checks a connection out, uses it, and checks it
//! back in. Connections that failed, or sat idle past `idle_timeout`, are
//! dropped instead of reused. Connections idle longer than `probe_after` get
//! a cheap health probe before reuse.
//!
//! The pool is generic over a [`Connector`] so it can be exercised without a
//! network.

use super::ClientError;
use crate::rpc::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Opens, probes and drives transport connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + Sync + 'static;

    /// Open a new connection to `addr`
    async fn connect(&self, addr: &str) -> Result<Self::Conn, ClientError>;

    /// Cheap liveness check before reusing an idle connection
    async fn probe(&self, conn: &Self::Conn, addr: &str) -> bool;

    /// Send one RPC and wait for its response (bounded by `timeout`)
    async fn call(
        &self,
        conn: &Self::Conn,
        addr: &str,
        request: &RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per address (default: 4)
    pub max_idle_per_address: usize,

    /// Idle connections older than this are discarded (default: 90s)
    pub idle_timeout_secs: u64,

    /// Probe connections idle longer than this before reuse (default: 5s)
    pub probe_after_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_address: 4,
            idle_timeout_secs: 90,
            probe_after_secs: Some(5),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn probe_after(&self) -> Option<Duration> {
        self.probe_after_secs.map(Duration::from_secs)
    }
}

/// A connection checked out of (or destined for) the pool
#[derive(Debug)]
pub struct PooledConnection<C> {
    conn: C,
    addr: String,
    last_used: Instant,
    healthy: bool,
}

impl<C> PooledConnection<C> {
    fn new(conn: C, addr: &str) -> Self {
        Self {
            conn,
            addr: addr.to_string(),
            last_used: Instant::now(),
            healthy: true,
        }
    }

    pub fn get(&self) -> &C {
        &self.conn
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Keep this connection out of the pool on check-in
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

/// Per-address pool of idle connections
pub struct ConnectionPool<K: Connector> {
    connector: K,
    config: PoolConfig,
    idle: Mutex<HashMap<String, Vec<PooledConnection<K::Conn>>>>,
    closed: AtomicBool,
}

impl<K: Connector> ConnectionPool<K> {
    pub fn new(connector: K, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            idle: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Reuse an idle connection to `addr`, or open a new one
    pub async fn checkout(&self, addr: &str) -> Result<PooledConnection<K::Conn>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let idle_timeout = self.config.idle_timeout();
        let probe_after = self.config.probe_after();

        loop {
            // Never hold the lock across a probe
            let candidate = {
                let mut idle = self.idle.lock().await;
                idle.get_mut(addr).and_then(Vec::pop)
            };
            let Some(entry) = candidate else {
                break;
            };

            let idle_for = entry.idle_for();
            if idle_for > idle_timeout {
                debug!("Discarding connection to {} idle for {:?}", addr, idle_for);
                continue;
            }

            if probe_after.is_some_and(|after| idle_for > after)
                && !self.connector.probe(&entry.conn, addr).await
            {
                debug!("Discarding connection to {} that failed its probe", addr);
                continue;
            }

            debug!("Reusing pooled connection to {}", addr);
            return Ok(entry);
        }

        debug!("Opening new connection to {}", addr);
        let conn = self.connector.connect(addr).await?;
        Ok(PooledConnection::new(conn, addr))
    }

    /// Return a connection; unhealthy ones and overflow are dropped
    pub async fn checkin(&self, mut entry: PooledConnection<K::Conn>) {
        if !entry.healthy || self.is_closed() {
            debug!("Dropping connection to {}", entry.addr);
            return;
        }

        let idle_timeout = self.config.idle_timeout();
        let mut idle = self.idle.lock().await;
        let stack = idle.entry(entry.addr.clone()).or_default();
        stack.retain(|c| c.idle_for() <= idle_timeout);

        if stack.len() < self.config.max_idle_per_address {
            entry.last_used = Instant::now();
            stack.push(entry);
        } else {
            debug!("Pool for {} is full, dropping connection", entry.addr);
        }
    }

    /// Idle connections currently held for `addr`
    pub async fn idle_count(&self, addr: &str) -> usize {
        self.idle.lock().await.get(addr).map_or(0, Vec::len)
    }

    /// Drop every idle connection and refuse further checkouts
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut idle = self.idle.lock().await;
        let dropped: usize = idle.values().map(Vec::len).sum();
        idle.clear();
        debug!("Connection pool closed, dropped {} idle connections", dropped);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
