//! Per-datasource connection pools.
//!
//! Each datasource gets its own [`Pool`], built around:
//! - a FIFO-fair semaphore with `max_connections` permits that bounds
//!   outstanding leases and queues waiting callers in arrival order
//! - one mutex over the pool's bookkeeping (idle set, open count, outstanding
//!   count, closed flag), never held across an await
//!
//! Pools share nothing with each other, so a stalled datasource cannot slow
//! down acquisition on another one.
//!
//! A checked-out connection is a [`Lease`]. It ends in exactly one of three
//! ways: [`Lease::release`] (back to the idle set), [`Lease::invalidate`]
//! (destroyed, slot freed for a replacement) or being dropped, which is
//! treated as an invalidation because the connection's state is unknown.

use crate::db::driver::{Connector, DriverConnection};
use crate::error::{DbError, DbResult};
use crate::models::PoolSettings;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Failed health checks tolerated within one acquire before giving up.
pub const MAX_HEALTH_CHECK_ATTEMPTS: u32 = 3;

struct IdleConnection<T> {
    conn: T,
    connection_id: u64,
    idle_since: Instant,
    last_validated: Instant,
}

struct PoolState<T> {
    idle: VecDeque<IdleConnection<T>>,
    /// Physical connections: idle + leased + being opened
    size: u32,
    outstanding: u32,
    closed: bool,
}

/// Point-in-time view of a pool, for logging and `listDatasources`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub outstanding: u32,
    pub max_connections: u32,
    pub closed: bool,
}

pub struct Pool<C: Connector> {
    datasource: String,
    connector: C,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<C::Connection>>,
    next_lease_id: AtomicU64,
    next_connection_id: AtomicU64,
    returned: Notify,
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("datasource", &self.datasource)
            .field("engine", &self.connector.engine())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Pool<C> {
    pub fn new(datasource: impl Into<String>, connector: C, settings: PoolSettings) -> Arc<Self> {
        let max = settings.max_connections.max(1);
        Arc::new(Self {
            datasource: datasource.into(),
            connector,
            settings: PoolSettings {
                max_connections: max,
                min_connections: settings.min_connections.min(max),
                ..settings
            },
            permits: Arc::new(Semaphore::new(max as usize)),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                size: 0,
                outstanding: 0,
                closed: false,
            }),
            next_lease_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
            returned: Notify::new(),
        })
    }

    pub fn datasource(&self) -> &str {
        &self.datasource
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        // Bookkeeping stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            size: state.size,
            idle: state.idle.len() as u32,
            outstanding: state.outstanding,
            max_connections: self.settings.max_connections,
            closed: state.closed,
        }
    }

    /// Open `min_connections` connections ahead of the first request.
    ///
    /// Failures are logged, not returned: the pool still opens connections
    /// lazily on demand.
    pub async fn warm_up(&self) {
        let target = self.settings.min_connections;
        let mut opened = 0;
        while opened < target {
            {
                let mut state = self.lock();
                if state.closed || state.size >= target {
                    break;
                }
                state.size += 1;
            }
            match self.connector.connect().await {
                Ok(conn) => {
                    let now = Instant::now();
                    let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let mut state = self.lock();
                    if state.closed {
                        state.size -= 1;
                        drop(state);
                        spawn_close(conn);
                        break;
                    }
                    state.idle.push_back(IdleConnection {
                        conn,
                        connection_id,
                        idle_since: now,
                        last_validated: now,
                    });
                    opened += 1;
                }
                Err(e) => {
                    self.lock().size -= 1;
                    warn!(datasource = %self.datasource, error = %e, "Failed to pre-open connection");
                    break;
                }
            }
        }
        if opened > 0 {
            debug!(datasource = %self.datasource, opened, "Pool warmed up");
        }
    }

    /// Check out a connection, waiting at most `timeout`.
    ///
    /// Waiters are served in arrival order. An idle connection is reused if
    /// one exists; otherwise a new one is opened while the pool is below
    /// `max_connections`.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> DbResult<Lease<C>> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let waited_ms = || started.elapsed().as_millis() as u64;

        if self.lock().closed {
            return Err(DbError::pool_closed(&self.datasource));
        }

        let permit =
            match tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                // The semaphore is closed by shutdown.
                Ok(Err(_)) => return Err(DbError::pool_closed(&self.datasource)),
                Err(_) => {
                    debug!(datasource = %self.datasource, waited_ms = waited_ms(), "Acquire timed out");
                    return Err(DbError::acquire_timeout(&self.datasource, waited_ms()));
                }
            };

        let mut failed_checks = 0;
        loop {
            let candidate = {
                let mut state = self.lock();
                if state.closed {
                    return Err(DbError::pool_closed(&self.datasource));
                }
                let candidate = state.idle.pop_back();
                if candidate.is_none() {
                    state.size += 1;
                }
                candidate
            };
            // From here the slot is counted in `size`; the guard gives it back
            // on every path that does not produce a lease, including cancellation.
            let slot = SlotGuard::new(self);

            let Some(idle) = candidate else {
                return match tokio::time::timeout_at(deadline, self.connector.connect()).await {
                    Ok(Ok(conn)) => {
                        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                        debug!(datasource = %self.datasource, connection_id, "Opened new connection");
                        Ok(self.lease(slot, conn, connection_id, Instant::now(), permit))
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(DbError::acquire_timeout(&self.datasource, waited_ms())),
                };
            };

            if idle.idle_since.elapsed() < self.settings.idle_timeout {
                return Ok(self.lease(slot, idle.conn, idle.connection_id, idle.last_validated, permit));
            }

            let mut conn = idle.conn;
            match tokio::time::timeout_at(deadline, conn.ping()).await {
                Ok(Ok(())) => {
                    return Ok(self.lease(slot, conn, idle.connection_id, Instant::now(), permit));
                }
                Ok(Err(e)) => {
                    failed_checks += 1;
                    warn!(
                        datasource = %self.datasource,
                        connection_id = idle.connection_id,
                        attempt = failed_checks,
                        error = %e,
                        "Health check failed, discarding connection"
                    );
                    drop(slot);
                    spawn_close(conn);
                    if failed_checks >= MAX_HEALTH_CHECK_ATTEMPTS {
                        return Err(DbError::pool_exhausted(&self.datasource, failed_checks));
                    }
                }
                Err(_) => {
                    drop(slot);
                    spawn_close(conn);
                    return Err(DbError::acquire_timeout(&self.datasource, waited_ms()));
                }
            }
        }
    }

    fn lease(
        self: &Arc<Self>,
        slot: SlotGuard<'_, C>,
        conn: C::Connection,
        connection_id: u64,
        last_validated: Instant,
        permit: OwnedSemaphorePermit,
    ) -> Lease<C> {
        slot.keep();
        let lease_id = self.next_lease_id.fetch_add(1, Ordering::Relaxed);
        self.lock().outstanding += 1;
        debug!(datasource = %self.datasource, lease_id, connection_id, "Connection leased");
        Lease {
            conn,
            ticket: LeaseTicket {
                pool: Arc::clone(self),
                lease_id,
                connection_id,
                last_validated,
                settled: false,
                _permit: permit,
            },
        }
    }

    /// Return a healthy connection to the idle set.
    pub fn release(&self, lease: Lease<C>) {
        let Lease { conn, mut ticket } = lease;
        ticket.settled = true;
        let mut state = self.lock();
        state.outstanding -= 1;
        if state.closed {
            state.size -= 1;
            drop(state);
            spawn_close(conn);
        } else {
            state.idle.push_back(IdleConnection {
                conn,
                connection_id: ticket.connection_id,
                idle_since: Instant::now(),
                last_validated: ticket.last_validated,
            });
            drop(state);
        }
        debug!(datasource = %self.datasource, lease_id = ticket.lease_id, "Connection released");
        self.returned.notify_waiters();
    }

    /// Destroy a connection after a connection-level failure.
    ///
    /// The slot is freed so the next acquire opens a replacement.
    pub fn invalidate(&self, lease: Lease<C>) {
        let Lease { conn, mut ticket } = lease;
        ticket.settled = true;
        self.forget_lease();
        warn!(
            datasource = %self.datasource,
            lease_id = ticket.lease_id,
            connection_id = ticket.connection_id,
            "Connection invalidated"
        );
        spawn_close(conn);
    }

    fn forget_lease(&self) {
        {
            let mut state = self.lock();
            state.outstanding -= 1;
            state.size -= 1;
        }
        self.returned.notify_waiters();
    }

    /// Stop handing out connections and close everything.
    ///
    /// New and queued acquires fail with `PoolClosed` immediately. Leases still
    /// out get up to `grace` to come back; idle connections are closed first.
    pub async fn shutdown(&self, grace: Duration) {
        let idle = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.size -= state.idle.len() as u32;
            std::mem::take(&mut state.idle)
        };
        self.permits.close();

        info!(datasource = %self.datasource, idle = idle.len(), "Shutting down pool");
        for entry in idle {
            entry.conn.close().await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let returned = self.returned.notified();
            let outstanding = self.lock().outstanding;
            if outstanding == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, returned).await.is_err() {
                warn!(
                    datasource = %self.datasource,
                    outstanding,
                    "Grace period elapsed with leases still outstanding"
                );
                break;
            }
        }
        info!(datasource = %self.datasource, "Pool closed");
    }
}

/// Gives a reserved `size` slot back unless a lease took ownership of it.
struct SlotGuard<'a, C: Connector> {
    pool: &'a Pool<C>,
    kept: bool,
}

impl<'a, C: Connector> SlotGuard<'a, C> {
    fn new(pool: &'a Pool<C>) -> Self {
        Self { pool, kept: false }
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl<C: Connector> Drop for SlotGuard<'_, C> {
    fn drop(&mut self) {
        if !self.kept {
            self.pool.lock().size -= 1;
        }
    }
}

/// Close a connection off the caller's path.
fn spawn_close<T: DriverConnection>(conn: T) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(conn.close());
        }
        Err(_) => drop(conn),
    }
}

/// A connection checked out of a [`Pool`] by one request.
pub struct Lease<C: Connector> {
    conn: C::Connection,
    ticket: LeaseTicket<C>,
}

struct LeaseTicket<C: Connector> {
    pool: Arc<Pool<C>>,
    lease_id: u64,
    connection_id: u64,
    last_validated: Instant,
    settled: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> Drop for LeaseTicket<C> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                datasource = %self.pool.datasource,
                lease_id = self.lease_id,
                "Lease dropped without release, discarding connection"
            );
            self.pool.forget_lease();
        }
    }
}

impl<C: Connector> Lease<C> {
    pub fn connection(&mut self) -> &mut C::Connection {
        &mut self.conn
    }

    pub fn lease_id(&self) -> u64 {
        self.ticket.lease_id
    }

    /// Identity of the physical connection, stable across leases.
    pub fn connection_id(&self) -> u64 {
        self.ticket.connection_id
    }

    pub fn last_validated(&self) -> Instant {
        self.ticket.last_validated
    }

    pub fn datasource(&self) -> &str {
        &self.ticket.pool.datasource
    }

    pub fn release(self) {
        let pool = Arc::clone(&self.ticket.pool);
        pool.release(self);
    }

    pub fn invalidate(self) {
        let pool = Arc::clone(&self.ticket.pool);
        pool.invalidate(self);
    }
}

impl<C: Connector> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("datasource", &self.ticket.pool.datasource)
            .field("lease_id", &self.ticket.lease_id)
            .field("connection_id", &self.ticket.connection_id)
            .finish()
    }
}

/// All pools of a session, keyed by datasource id.
pub struct PoolManager<C: Connector> {
    pools: HashMap<String, Arc<Pool<C>>>,
}

impl<C: Connector> PoolManager<C> {
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
        }
    }

    pub fn insert(&mut self, pool: Arc<Pool<C>>) {
        self.pools.insert(pool.datasource().to_string(), pool);
    }

    pub fn get(&self, datasource: &str) -> DbResult<&Arc<Pool<C>>> {
        self.pools
            .get(datasource)
            .ok_or_else(|| DbError::datasource_not_found(datasource))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub async fn warm_up_all(&self) {
        futures_util::future::join_all(self.pools.values().map(|pool| pool.warm_up())).await;
    }

    /// Shut every pool down concurrently, each with the same grace period.
    pub async fn shutdown_all(&self, grace: Duration) {
        futures_util::future::join_all(self.pools.values().map(|pool| pool.shutdown(grace)))
            .await;
    }
}

impl<C: Connector> Default for PoolManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::RowStream;
    use crate::models::{EngineKind, QueryParam};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        pings: AtomicUsize,
        fail_pings: AtomicBool,
    }

    struct TestConnector(Arc<Counters>);

    struct TestConnection(Arc<Counters>);

    impl DriverConnection for TestConnection {
        async fn ping(&mut self) -> DbResult<()> {
            self.0.pings.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_pings.load(Ordering::SeqCst) {
                Err(DbError::connection_fatal("reset", "retry"))
            } else {
                Ok(())
            }
        }

        fn fetch<'c>(&'c mut self, _sql: &'c str, _params: &'c [QueryParam]) -> RowStream<'c> {
            Box::pin(futures_util::stream::empty())
        }

        async fn execute<'c>(&'c mut self, _sql: &'c str, _params: &'c [QueryParam]) -> DbResult<u64> {
            Ok(0)
        }

        async fn close(self) {}
    }

    impl Connector for TestConnector {
        type Connection = TestConnection;

        fn engine(&self) -> EngineKind {
            EngineKind::Sqlite
        }

        async fn connect(&self) -> DbResult<TestConnection> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(TestConnection(Arc::clone(&self.0)))
        }
    }

    fn settings(max: u32, idle_timeout: Duration) -> PoolSettings {
        PoolSettings {
            min_connections: 1,
            max_connections: max,
            idle_timeout,
            acquire_timeout: Duration::from_secs(1),
        }
    }

    fn pool(max: u32, idle_timeout: Duration) -> (Arc<Pool<TestConnector>>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let pool = Pool::new("test", TestConnector(Arc::clone(&counters)), settings(max, idle_timeout));
        (pool, counters)
    }

    #[tokio::test]
    async fn test_release_reuses_connection() {
        let (pool, counters) = pool(2, Duration::from_secs(60));
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let first_conn = lease.connection_id();
        let first_lease = lease.lease_id();
        lease.release();

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease.connection_id(), first_conn);
        assert!(lease.lease_id() > first_lease);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        // Recently used connections are not pinged.
        assert_eq!(counters.pings.load(Ordering::SeqCst), 0);
        lease.release();

        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[tokio::test]
    async fn test_invalidate_frees_slot_for_replacement() {
        let (pool, counters) = pool(1, Duration::from_secs(60));
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let old = lease.connection_id();
        lease.invalidate();
        assert_eq!(pool.stats().size, 0);

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(lease.connection_id(), old);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
        lease.release();
    }

    #[tokio::test]
    async fn test_dropped_lease_counts_as_invalidation() {
        let (pool, _) = pool(1, Duration::from_secs(60));
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        drop(lease);
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.size, 0);
        assert!(pool.acquire(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_timeout_when_exhausted() {
        let (pool, _) = pool(1, Duration::from_secs(60));
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, DbError::AcquireTimeout { .. }));
        assert!(err.is_retryable());
        held.release();
    }

    #[tokio::test]
    async fn test_stale_idle_connection_is_health_checked() {
        let (pool, counters) = pool(1, Duration::ZERO);
        pool.acquire(Duration::from_secs(1)).await.unwrap().release();
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(counters.pings.load(Ordering::SeqCst), 1);
        lease.release();
    }

    #[tokio::test]
    async fn test_failed_health_checks_are_bounded() {
        let (pool, counters) = pool(4, Duration::ZERO);
        let leases: Vec<_> = futures_util::future::join_all(
            (0..4).map(|_| pool.acquire(Duration::from_secs(1))),
        )
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
        for lease in leases {
            lease.release();
        }
        counters.fail_pings.store(true, Ordering::SeqCst);

        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::PoolExhausted { attempts: MAX_HEALTH_CHECK_ATTEMPTS, .. }
        ));
        assert_eq!(pool.stats().size, 1);

        // The remaining idle connection is also bad; the next acquire falls
        // through to a fresh connection.
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 5);
        lease.release();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_acquires() {
        let (pool, _) = pool(2, Duration::from_secs(60));
        pool.acquire(Duration::from_secs(1)).await.unwrap().release();
        pool.shutdown(Duration::from_millis(10)).await;

        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DbError::PoolClosed { .. }));
        let stats = pool.stats();
        assert!(stats.closed);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn test_warm_up_opens_min_connections() {
        let (pool, counters) = pool(3, Duration::from_secs(60));
        pool.warm_up().await;
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_manager_unknown_datasource() {
        let (pool, _) = pool(1, Duration::from_secs(60));
        let mut manager = PoolManager::new();
        manager.insert(pool);
        assert!(manager.get("test").is_ok());
        let err = manager.get("missing").unwrap_err();
        assert!(matches!(err, DbError::DatasourceNotFound { .. }));
    }
}
