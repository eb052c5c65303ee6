//! Redis connection pool
//!
//! A fixed set of long-lived connections behind a mutex + condition variable.
//! Checkout validates the connection with a PING and transparently recreates
//! dead ones; a checkout that times out creates a short-lived emergency
//! connection instead of stalling the caller forever.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::config::RedisConfig;

struct PoolState {
    connections: VecDeque<redis::Connection>,
    shutdown: bool,
}

pub struct ConnectionPool {
    client: redis::Client,
    state: Mutex<PoolState>,
    available: Condvar,
    pool_size: usize,
    connect_timeout: Duration,
}

fn ping(conn: &mut redis::Connection) -> bool {
    redis::cmd("PING").query::<String>(conn).is_ok()
}

impl ConnectionPool {
    pub fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.url())?;
        let pool = Self {
            client,
            state: Mutex::new(PoolState { connections: VecDeque::new(), shutdown: false }),
            available: Condvar::new(),
            pool_size: config.pool_size,
            connect_timeout: Duration::from_millis(config.timeout_ms),
        };

        info!("initializing {} redis connection(s)", pool.pool_size);
        let mut state = pool.state.lock();
        for _ in 0..pool.pool_size {
            if let Some(conn) = pool.create_connection() {
                state.connections.push_back(conn);
            }
        }
        info!("redis pool ready with {}/{} connection(s)", state.connections.len(), pool.pool_size);
        drop(state);

        Ok(pool)
    }

    fn create_connection(&self) -> Option<redis::Connection> {
        match self.client.get_connection_with_timeout(self.connect_timeout) {
            Ok(conn) => {
                let _ = conn.set_read_timeout(Some(self.connect_timeout));
                let _ = conn.set_write_timeout(Some(self.connect_timeout));
                Some(conn)
            }
            Err(e) => {
                warn!("redis connection failed: {e}");
                None
            }
        }
    }

    /// Check a connection out, waiting up to `timeout`; a timeout falls back
    /// to an emergency connection outside the pool.
    pub fn acquire(&self, timeout: Duration) -> Option<redis::Connection> {
        let deadline = Instant::now() + timeout;
        let mut conn = {
            let mut state = self.state.lock();
            if state.shutdown {
                return None;
            }
            while state.connections.is_empty() && !state.shutdown {
                if self.available.wait_until(&mut state, deadline).timed_out() {
                    drop(state);
                    warn!("redis pool acquire timeout ({}ms)", timeout.as_millis());
                    let emergency = self.create_connection();
                    if emergency.is_some() {
                        info!("created emergency redis connection");
                    }
                    return emergency;
                }
            }
            if state.shutdown {
                return None;
            }
            state.connections.pop_front()?
        };

        // Validate outside the lock; dead connections are replaced
        if !ping(&mut conn) {
            warn!("stale redis connection on checkout, recreating");
            return self.create_connection();
        }
        Some(conn)
    }

    /// RAII checkout that returns the connection on every exit path
    pub fn acquire_guard(&self, timeout: Duration) -> Option<PooledConnection<'_>> {
        self.acquire(timeout)
            .map(|conn| PooledConnection { pool: self, conn: Some(conn) })
    }

    /// Return a connection, replacing it if it died while checked out
    pub fn release(&self, mut conn: redis::Connection) {
        let valid = ping(&mut conn);
        let replacement = if valid { Some(conn) } else { self.create_connection() };

        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        if let Some(conn) = replacement {
            state.connections.push_back(conn);
            self.available.notify_one();
        }
    }

    /// Fail all subsequent acquires and drop the pooled connections
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.connections.clear();
        self.available.notify_all();
    }

    pub fn available(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn capacity(&self) -> usize {
        self.pool_size
    }
}

pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<redis::Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = redis::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
