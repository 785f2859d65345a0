//! Bounded connection pool
//!
//! Sessions are pooled behind a semaphore with `max_size` permits. Checkout
//! never queues: when every permit is taken the caller gets
//! [`PoolError::Exhausted`] and is expected to try again later.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, instrument, trace};

use crate::config::duration_millis;
use crate::gateway::{Gateway, GatewayError, Session};

/// Label pooled sessions are opened with
pub const POOL_LABEL: &str = "pgload-pool";

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Sessions opened up front
    pub min_size: usize,

    /// Ceiling on concurrently checked-out sessions
    pub max_size: usize,

    /// Label (application_name) for pooled sessions
    pub label: String,

    /// Upper bound on opening one new session
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 15,
            label: POOL_LABEL.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration; `max_size` is at least 1 and `min_size`
    /// never exceeds it
    pub fn new(min_size: usize, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            min_size: min_size.min(max_size),
            max_size,
            ..Default::default()
        }
    }

    /// Set the session label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Every slot is checked out
    #[error("connection pool exhausted")]
    Exhausted,

    /// Pool was closed
    #[error("connection pool is closed")]
    Closed,

    /// Opening a new session took longer than `connect_timeout`
    #[error("timed out opening a pooled connection after {0:?}")]
    ConnectTimeout(Duration),

    /// Opening a new session failed
    #[error("failed to open pooled connection: {0}")]
    Connect(#[from] GatewayError),
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub min_size: usize,
    pub max_size: usize,
    /// Sessions currently held by borrowers
    pub checked_out: usize,
    /// Sessions sitting in the free list
    pub idle: usize,
    /// Sessions ever opened by the pool
    pub opened: u64,
    /// Sessions dropped instead of being returned (broken, discarded, closed pool)
    pub discarded: u64,
    /// Checkouts refused with `Exhausted`
    pub rejected: u64,
    pub closed: bool,
}

struct PoolInner {
    gateway: Arc<dyn Gateway>,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Session>>>,
    closed: AtomicBool,
    opened: AtomicU64,
    discarded: AtomicU64,
    rejected: AtomicU64,
}

impl PoolInner {
    #[instrument(skip(self), fields(label = %self.config.label))]
    async fn open(&self) -> Result<Box<dyn Session>, PoolError> {
        let session = tokio::time::timeout(
            self.config.connect_timeout,
            self.gateway.connect(&self.config.label),
        )
        .await
        .map_err(|_| PoolError::ConnectTimeout(self.config.connect_timeout))??;

        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    /// Put a session back, or drop it if it must not be reused
    ///
    /// A healthy session returned to a closed pool is closed gracefully on a
    /// background task.
    fn put_back(&self, session: Box<dyn Session>, discard: bool) {
        if !discard && !session.is_broken() {
            // closed is only flipped under this lock, see close_all
            let mut idle = self.idle.lock();
            if !self.closed.load(Ordering::Acquire) {
                idle.push(session);
                return;
            }
            drop(idle);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            close_detached(session);
            return;
        }
        self.discarded.fetch_add(1, Ordering::Relaxed);
        trace!(discard, "dropping session instead of pooling it");
        drop(session);
    }
}

fn close_detached(session: Box<dyn Session>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = session.close().await {
                    debug!(error = %e, "Error closing session returned after close_all");
                }
            });
        }
        // Outside a runtime the session can only be dropped.
        Err(_) => drop(session),
    }
}

/// Bounded pool of database sessions
///
/// Cloning is cheap; clones share the same pool.
///
/// # Example
///
/// ```ignore
/// use pgload::pool::{ConnectionPool, PoolConfig, PoolError};
///
/// let pool = ConnectionPool::connect(gateway, PoolConfig::new(5, 15)).await?;
///
/// match pool.acquire().await {
///     Ok(mut conn) => {
///         conn.execute("SELECT 1").await?;
///         pool.release(conn);
///     }
///     Err(PoolError::Exhausted) => { /* try again next tick */ }
///     Err(e) => return Err(e.into()),
/// }
///
/// pool.close_all().await;
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create the pool and open `min_size` sessions
    pub async fn connect(
        gateway: Arc<dyn Gateway>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let config = PoolConfig::new(config.min_size, config.max_size)
            .with_label(config.label)
            .with_connect_timeout(config.connect_timeout);

        let inner = Arc::new(PoolInner {
            gateway,
            slots: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            closed: AtomicBool::new(false),
            opened: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            config,
        });

        for _ in 0..inner.config.min_size {
            let session = inner.open().await?;
            inner.idle.lock().push(session);
        }

        info!(
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            "Connection pool ready"
        );
        Ok(Self { inner })
    }

    /// Check out a session without waiting for a free slot
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let permit = match Arc::clone(&self.inner.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Exhausted);
            }
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
        };

        let reused = self.inner.idle.lock().pop();
        let session = match reused {
            Some(session) => session,
            // On failure the permit drops with this frame and the slot is free again.
            None => self.inner.open().await?,
        };

        Ok(PooledConnection {
            session: Some(session),
            pool: Arc::clone(&self.inner),
            discard: false,
            _permit: permit,
        })
    }

    /// Return a session to the pool
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close the pool and every idle session; returns how many were closed
    ///
    /// Sessions still checked out are closed when their borrower releases
    /// them, or dropped if they are broken. Calling this more than once is
    /// harmless.
    pub async fn close_all(&self) -> usize {
        let sessions = {
            let mut idle = self.inner.idle.lock();
            self.inner.closed.store(true, Ordering::Release);
            std::mem::take(&mut *idle)
        };
        self.inner.slots.close();

        let count = sessions.len();
        for session in sessions {
            if let Err(e) = session.close().await {
                debug!(error = %e, "Error closing pooled session");
            }
        }

        info!(
            closed = count,
            checked_out = self.checked_out(),
            "Connection pool closed"
        );
        count
    }

    /// Sessions currently checked out
    pub fn checked_out(&self) -> usize {
        // A closed semaphore keeps counting returned permits, so this stays
        // accurate after close_all.
        self.inner.config.max_size - self.inner.slots.available_permits()
    }

    /// Get current counters
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            min_size: self.inner.config.min_size,
            max_size: self.inner.config.max_size,
            checked_out: self.checked_out(),
            idle: self.inner.idle.lock().len(),
            opened: self.inner.opened.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            closed: self.inner.closed.load(Ordering::Acquire),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

/// A checked-out session
///
/// Dereferences to the underlying [`Session`]. Dropping it returns the
/// session to the pool, so every exit path of the borrower releases its slot.
pub struct PooledConnection {
    session: Option<Box<dyn Session>>,
    pool: Arc<PoolInner>,
    discard: bool,
    // Declared last: the permit is released only after `drop` has put the
    // session back in the free list.
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Drop the session instead of returning it to the pool
    ///
    /// Used when the session may be mid-statement, e.g. after its statement
    /// future was abandoned.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl Deref for PooledConnection {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .expect("pooled session is present until the guard drops")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_deref_mut()
            .expect("pooled session is present until the guard drops")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.put_back(session, self.discard);
        }
    }
}
