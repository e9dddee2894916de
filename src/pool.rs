//! Bounded connection pool per endpoint (§4.5).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::config::ClientConfig;
use crate::connection::{self, ConnectionHandle, HandshakeOptions};
use crate::error::ClientResult;

struct Idle {
    conn: ConnectionHandle,
    opened_at: Instant,
}

struct Inner {
    addr: String,
    opts: HandshakeOptions,
    config: ClientConfig,
    idle: parking_lot::Mutex<VecDeque<Idle>>,
    /// Bounds total outstanding connections (idle + leased) at `max`.
    permits: Semaphore,
    in_use: std::sync::atomic::AtomicUsize,
    shutting_down: std::sync::atomic::AtomicBool,
    /// Ceiling `release()` shrinks the pool toward. Starts at `pool_max`,
    /// i.e. not shrinking; `resize()` lowers it to actively trim idle
    /// connections back down past `pool_min` over subsequent releases.
    target_size: std::sync::atomic::AtomicUsize,
}

/// A bounded pool of connections to a single endpoint. `lease()` hands
/// out an idle connection or opens a fresh one under `max`; `release()`
/// returns it to idle or closes it when the pool is shrinking.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, config: ClientConfig, opts: HandshakeOptions) -> Self {
        let addr = addr.into();
        let permits = Semaphore::new(config.pool_max);
        let pool_max = config.pool_max;
        ConnectionPool {
            inner: Arc::new(Inner {
                addr,
                opts,
                config,
                idle: parking_lot::Mutex::new(VecDeque::new()),
                permits,
                in_use: std::sync::atomic::AtomicUsize::new(0),
                shutting_down: std::sync::atomic::AtomicBool::new(false),
                target_size: std::sync::atomic::AtomicUsize::new(pool_max),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Leases a connection: reuses idle capacity when available
    /// (discarding any entry past `idle_max_age`), otherwise opens a new
    /// one if the pool is under `max`. Callers over `max` queue on the
    /// semaphore in FIFO order and resume on the next `release`.
    pub async fn lease(&self) -> ClientResult<Leased> {
        let permit = self.inner.permits.acquire().await.expect("pool semaphore never closes");
        permit.forget();
        self.inner.in_use.fetch_add(1, std::sync::atomic::Ordering::AcqRel);

        loop {
            let candidate = { self.inner.idle.lock().pop_front() };
            match candidate {
                Some(idle) if idle.conn.is_closed() => continue,
                Some(idle) if idle.opened_at.elapsed() > self.inner.config.idle_max_age => {
                    idle.conn.shutdown();
                    continue;
                }
                Some(idle) => {
                    return Ok(Leased { pool: self.clone(), conn: Some(idle.conn) });
                }
                None => break,
            }
        }

        tracing::debug!(addr = %self.inner.addr, "opening new pooled connection");
        match connection::connect(&self.inner.addr, &self.inner.opts, self.inner.config.handshake_timeout).await {
            Ok(conn) => Ok(Leased { pool: self.clone(), conn: Some(conn) }),
            Err(err) => {
                tracing::warn!(addr = %self.inner.addr, error = %err, "failed to open pooled connection");
                self.inner.permits.add_permits(1);
                self.inner.in_use.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                Err(err)
            }
        }
    }

    fn release(&self, conn: ConnectionHandle) {
        self.inner.in_use.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        if conn.is_closed() {
            self.inner.permits.add_permits(1);
            return;
        }
        if self.inner.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
            conn.shutdown();
            self.inner.permits.add_permits(1);
            return;
        }

        let mut idle = self.inner.idle.lock();
        let target = self.inner.target_size.load(std::sync::atomic::Ordering::Acquire);
        let in_use = self.inner.in_use.load(std::sync::atomic::Ordering::Acquire);
        let total_if_idled = idle.len() + 1 + in_use;
        let shrinking = idle.len() >= self.inner.config.pool_min && total_if_idled > target;
        if shrinking {
            drop(idle);
            conn.shutdown();
        } else {
            idle.push_back(Idle { conn, opened_at: Instant::now() });
        }
        self.inner.permits.add_permits(1);
    }

    /// Sets the pool's target size, clamped to at least `pool_min`.
    /// Lowering it below the current idle+in-use total puts the pool in
    /// a shrinking state: subsequent `release()` calls close connections
    /// instead of idling them until the total settles at the new target.
    pub fn resize(&self, target: usize) {
        let target = target.max(self.inner.config.pool_min);
        self.inner.target_size.store(target, std::sync::atomic::Ordering::Release);
    }

    /// Stops accepting leases; `graceful` waits for in-use connections to
    /// drain before closing idle ones, otherwise closes everything now.
    pub async fn shutdown(&self, graceful: bool) {
        tracing::info!(addr = %self.inner.addr, graceful, "shutting down pool");
        self.inner.shutting_down.store(true, std::sync::atomic::Ordering::Release);
        if graceful {
            while self.inner.in_use.load(std::sync::atomic::Ordering::Acquire) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        let mut idle = self.inner.idle.lock();
        while let Some(entry) = idle.pop_front() {
            entry.conn.shutdown();
        }
    }
}

/// An RAII-leased connection: returned to the pool (or closed, if the
/// pool is shrinking) when dropped.
pub struct Leased {
    pool: ConnectionPool,
    conn: Option<ConnectionHandle>,
}

impl Leased {
    pub fn handle(&self) -> &ConnectionHandle {
        self.conn.as_ref().expect("conn taken only on drop")
    }
}

impl Drop for Leased {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
