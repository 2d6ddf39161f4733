//! Bounded directory connection pool.
//!
//! ## Slot lifecycle
//!
//! ```text
//! (none) --connect--> Idle --borrow--> InUse --drop lease--> Idle
//!                                        |
//!                                        +--broken--> discarded
//! ```
//!
//! A semaphore with `max` permits bounds the number of leases; a lease holds
//! its permit until it is dropped, and connections are only created when no
//! idle one is available, so live connections never exceed `max`. Releasing
//! is the lease's `Drop` and cannot fail: the connection is either reset to
//! the pool's default constraints and parked, or discarded so that the next
//! borrow opens a replacement.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dsmlgw_proto::ResultCode;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::directory::{Connector, Constraints, DirectoryConnection, DirectoryError};

/// Pool bounds and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections opened by [`ConnectionPool::warm_up`].
    pub min: usize,
    /// Upper bound on live connections.
    pub max: usize,
    /// How long `borrow` waits for a free slot.
    pub acquire_timeout: Duration,
    /// Constraints every connection is reset to on release.
    pub constraints: Constraints,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 5,
            acquire_timeout: Duration::from_secs(5),
            constraints: Constraints::default(),
        }
    }
}

/// Errors returned by [`ConnectionPool::borrow`].
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot stayed busy for the whole acquire timeout.
    #[error("{pool} pool exhausted: no connection available within {timeout:?}")]
    Exhausted {
        /// Pool name.
        pool: String,
        /// Configured acquire timeout.
        timeout: Duration,
    },

    /// Opening a replacement connection failed.
    #[error("{pool} pool could not open a connection: {source}")]
    Connect {
        /// Pool name.
        pool: String,
        /// Underlying failure.
        source: DirectoryError,
    },

    /// The pool has been closed.
    #[error("{0} pool is closed")]
    Closed(String),
}

impl PoolError {
    /// Result code reported to the client.
    pub fn result_code(&self) -> ResultCode {
        ResultCode::UNAVAILABLE
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Leases handed out.
    pub borrowed: u64,
    /// Leases returned.
    pub released: u64,
    /// Connections opened.
    pub created: u64,
    /// Connections thrown away (broken, or released after close).
    pub discarded: u64,
    /// Connections currently parked.
    pub idle: usize,
}

impl PoolStats {
    /// Leases currently outstanding.
    pub fn in_use(&self) -> u64 {
        self.borrowed.saturating_sub(self.released)
    }
}

struct PoolInner<C: Connector> {
    name: String,
    connector: C,
    config: PoolConfig,
    idle: Mutex<Vec<C::Connection>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    borrowed: AtomicU64,
    released: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<C::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop an idle connection, discarding any that broke while parked.
    fn take_idle(&self) -> Option<C::Connection> {
        let mut idle = self.lock_idle();
        while let Some(conn) = idle.pop() {
            if conn.is_broken() {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.name, "discarding idle connection that broke while parked");
                continue;
            }
            return Some(conn);
        }
        None
    }

    async fn open(&self) -> Result<C::Connection, PoolError> {
        let mut conn = self
            .connector
            .connect()
            .await
            .map_err(|source| PoolError::Connect { pool: self.name.clone(), source })?;
        self.created.fetch_add(1, Ordering::Relaxed);
        conn.set_constraints(self.config.constraints.clone());
        Ok(conn)
    }

    fn release(&self, mut conn: C::Connection, broken: bool) {
        self.released.fetch_add(1, Ordering::Relaxed);

        if broken || conn.is_broken() || self.closed.load(Ordering::Acquire) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %self.name, broken, "discarding connection on release");
            return;
        }

        conn.set_constraints(self.config.constraints.clone());
        self.lock_idle().push(conn);
    }
}

/// A bounded pool of directory connections.
///
/// Cloning is cheap and every clone shares the same slots.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create an empty pool. Nothing connects until [`Self::warm_up`] or the
    /// first borrow.
    pub fn new(name: impl Into<String>, connector: C, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max));
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                connector,
                config,
                idle: Mutex::new(Vec::new()),
                permits,
                closed: AtomicBool::new(false),
                borrowed: AtomicU64::new(0),
                released: AtomicU64::new(0),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Pool name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Open connections until `min` are live, idle or leased.
    ///
    /// Each connection is opened under a permit, so warming up next to
    /// outstanding leases never takes the pool past `max`. Stops early when
    /// every slot is taken.
    pub async fn warm_up(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        let mut opened = 0;
        loop {
            let permit = match Arc::clone(&inner.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => break,
                Err(TryAcquireError::Closed) => return Err(PoolError::Closed(inner.name.clone())),
            };
            // Leases held by others, including borrows still connecting.
            let leased = inner.config.max.saturating_sub(inner.permits.available_permits() + 1);
            if inner.lock_idle().len() + leased >= inner.config.min {
                break;
            }
            let conn = inner.open().await?;
            inner.lock_idle().push(conn);
            drop(permit);
            opened += 1;
        }
        info!(pool = %inner.name, opened, "pool warmed up");
        Ok(())
    }

    /// Borrow a connection, waiting at most the acquire timeout for a slot.
    pub async fn borrow(&self) -> Result<PooledConnection<C>, PoolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed(inner.name.clone()));
        }

        let timeout = inner.config.acquire_timeout;
        let permit = tokio::time::timeout(timeout, Arc::clone(&inner.permits).acquire_owned())
            .await
            .map_err(|_| {
                warn!(pool = %inner.name, ?timeout, "pool exhausted");
                PoolError::Exhausted { pool: inner.name.clone(), timeout }
            })?
            .map_err(|_| PoolError::Closed(inner.name.clone()))?;

        // The permit is dropped (slot freed) if opening fails.
        let conn = match inner.take_idle() {
            Some(conn) => conn,
            None => inner.open().await?,
        };

        inner.borrowed.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            broken: false,
            pool: Arc::clone(inner),
            _permit: permit,
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            borrowed: inner.borrowed.load(Ordering::Relaxed),
            released: inner.released.load(Ordering::Relaxed),
            created: inner.created.load(Ordering::Relaxed),
            discarded: inner.discarded.load(Ordering::Relaxed),
            idle: inner.lock_idle().len(),
        }
    }

    /// Refuse further borrows and unbind every idle connection.
    ///
    /// Outstanding leases are discarded when they come back.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.permits.close();

        let idle = std::mem::take(&mut *inner.lock_idle());
        let count = idle.len();
        for mut conn in idle {
            if let Err(e) = conn.unbind().await {
                debug!(pool = %inner.name, error = %e, "unbind failed during close");
            }
            inner.discarded.fetch_add(1, Ordering::Relaxed);
        }
        info!(pool = %inner.name, closed = count, "pool closed");
    }
}

/// A borrowed connection. Dropping it returns the connection to its pool.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    broken: bool,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledConnection<C> {
    /// Discard the connection instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken in drop"),
        }
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken in drop"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.broken);
        }
    }
}
