//! Redis connection pool.
//!
//! A bounded set of live connections to one destination. Dialing is lazy,
//! idle connections are evicted by age, and a connection that sat idle past
//! `health_check_after` is probed before it is handed out again.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{Command, ManageConnection, RedisError, Reply, Result, Wire};

/// Pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum borrowed connections at once; 0 means unbounded.
    pub max_active: usize,
    /// Maximum idle connections kept for reuse.
    pub max_idle: usize,
    /// Connections older than this are closed instead of reused.
    pub max_conn_lifetime: Option<Duration>,
    /// Idle connections older than this are closed on the next borrow.
    pub idle_timeout: Option<Duration>,
    /// Block when exhausted instead of failing with `PoolExhausted`.
    pub wait: bool,
    /// Upper bound on a blocked borrow.
    pub wait_timeout: Option<Duration>,
    /// Idle time after which a connection is probed before reuse.
    pub health_check_after: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 10,
            max_idle: 3,
            max_conn_lifetime: None,
            idle_timeout: None,
            wait: true,
            wait_timeout: None,
            health_check_after: Duration::from_secs(60),
        }
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Connections currently borrowed.
    pub active: usize,
    /// Connections waiting for reuse.
    pub idle: usize,
}

struct IdleConn<C> {
    conn: C,
    created: Instant,
    returned: Instant,
}

struct PoolInner<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConn<M::Connection>>>,
    active: AtomicUsize,
    closed: AtomicBool,
}

impl<M: ManageConnection> PoolInner<M> {
    fn expired(&self, created: Instant, returned: Instant, now: Instant) -> bool {
        if let Some(lifetime) = self.config.max_conn_lifetime
            && now.duration_since(created) >= lifetime
        {
            return true;
        }
        if let Some(timeout) = self.config.idle_timeout
            && now.duration_since(returned) >= timeout
        {
            return true;
        }
        false
    }

    fn pop_idle(&self, now: Instant) -> Option<IdleConn<M::Connection>> {
        let mut idle = self.idle.lock();
        while let Some(candidate) = idle.pop_front() {
            if self.expired(candidate.created, candidate.returned, now) {
                debug!("Evicting expired idle connection");
                continue;
            }
            return Some(candidate);
        }
        None
    }

    fn put_idle(&self, conn: M::Connection, created: Instant) {
        let now = Instant::now();
        let mut idle = self.idle.lock();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        idle.push_front(IdleConn {
            conn,
            created,
            returned: now,
        });
        while idle.len() > self.config.max_idle {
            idle.pop_back();
        }
        while idle
            .back()
            .is_some_and(|oldest| self.expired(oldest.created, oldest.returned, now))
        {
            idle.pop_back();
        }
    }
}

/// A bounded pool of connections produced by a [`ManageConnection`].
pub struct Pool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Create a pool. No connection is dialed until the first borrow.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let permits = if config.max_active == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_active
        };

        info!(
            max_active = config.max_active,
            max_idle = config.max_idle,
            "Redis connection pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                manager,
                config,
                slots: Arc::new(Semaphore::new(permits)),
                idle: Mutex::new(VecDeque::new()),
                active: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The connection factory.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Pool limits.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a ready connection.
    ///
    /// Idle connections are preferred; one that has been idle longer than
    /// `health_check_after` is probed first and silently replaced if the
    /// probe fails.
    pub async fn get(&self) -> Result<Pooled<M>> {
        if self.is_closed() {
            return Err(RedisError::PoolClosed);
        }

        let permit = self.acquire_slot().await?;
        let now = Instant::now();

        while let Some(mut idle) = self.inner.pop_idle(now) {
            if now.duration_since(idle.returned) >= self.inner.config.health_check_after {
                if let Err(err) = self.inner.manager.is_valid(&mut idle.conn).await {
                    debug!(error = %err, "Discarding stale connection that failed its probe");
                    continue;
                }
            }
            return Ok(Pooled::new(self.inner.clone(), idle.conn, idle.created, permit));
        }

        let conn = self.inner.manager.connect().await?;
        debug!("Dialed new pooled connection");
        Ok(Pooled::new(self.inner.clone(), conn, Instant::now(), permit))
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        let slots = self.inner.slots.clone();

        if !self.inner.config.wait {
            return slots.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::Closed => RedisError::PoolClosed,
                TryAcquireError::NoPermits => RedisError::PoolExhausted,
            });
        }

        match self.inner.config.wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, slots.acquire_owned()).await {
                Ok(permit) => permit.map_err(|_| RedisError::PoolClosed),
                Err(_) => Err(RedisError::PoolExhausted),
            },
            None => slots.acquire_owned().await.map_err(|_| RedisError::PoolClosed),
        }
    }

    /// Current statistics.
    pub fn state(&self) -> PoolState {
        PoolState {
            active: self.inner.active.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
        }
    }

    /// Refuse further borrows and close every idle connection.
    ///
    /// Connections already borrowed keep working and are discarded when
    /// they are returned.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.slots.close();
        let drained: Vec<_> = self.inner.idle.lock().drain(..).collect();
        info!(idle_closed = drained.len(), "Redis connection pool closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A borrowed connection, returned to its pool on drop.
///
/// It is discarded instead when it failed with a transport or protocol
/// error, when it was dropped with a command still in flight, when the pool
/// is closed, or when it outlived `max_conn_lifetime`.
pub struct Pooled<M: ManageConnection> {
    pool: Arc<PoolInner<M>>,
    conn: Option<M::Connection>,
    created: Instant,
    broken: bool,
    in_flight: bool,
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> Pooled<M> {
    fn new(
        pool: Arc<PoolInner<M>>,
        conn: M::Connection,
        created: Instant,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        pool.active.fetch_add(1, Ordering::AcqRel);
        Self {
            pool,
            conn: Some(conn),
            created,
            broken: false,
            in_flight: false,
            _permit: permit,
        }
    }

    /// When the underlying connection was dialed.
    pub fn created_at(&self) -> Instant {
        self.created
    }

    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection instead of returning it.
    pub fn discard(mut self) {
        self.broken = true;
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        self.in_flight = false;
        if let Err(err) = &result
            && err.discards_connection()
        {
            self.broken = true;
        }
        result
    }
}

fn released() -> RedisError {
    RedisError::Connection("connection already released".into())
}

#[async_trait]
impl<M: ManageConnection> Wire for Pooled<M> {
    async fn request(&mut self, cmd: &Command) -> Result<Reply> {
        let conn = self.conn.as_mut().ok_or_else(released)?;
        self.in_flight = true;
        let result = conn.request(cmd).await;
        self.settle(result)
    }

    async fn pipeline(&mut self, cmds: &[Command]) -> Result<Vec<Reply>> {
        let conn = self.conn.as_mut().ok_or_else(released)?;
        self.in_flight = true;
        let result = conn.pipeline(cmds).await;
        self.settle(result)
    }

    async fn transaction(&mut self, cmds: &[Command]) -> Result<Vec<Reply>> {
        let conn = self.conn.as_mut().ok_or_else(released)?;
        self.in_flight = true;
        let result = conn.transaction(cmds).await;
        self.settle(result)
    }
}

impl<M: ManageConnection> Drop for Pooled<M> {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::AcqRel);

        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if self.in_flight {
            debug!("Discarding connection dropped with a command in flight");
            return;
        }
        if self.broken || self.pool.manager.has_broken(&mut conn) {
            debug!("Discarding broken connection");
            return;
        }
        if self.pool.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(lifetime) = self.pool.config.max_conn_lifetime
            && self.created.elapsed() >= lifetime
        {
            debug!("Discarding connection past its lifetime");
            return;
        }

        self.pool.put_idle(conn, self.created);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockManager {
        dials: AtomicUsize,
        probes: AtomicUsize,
        healthy: AtomicBool,
    }

    impl MockManager {
        fn healthy() -> Self {
            let manager = Self::default();
            manager.healthy.store(true, Ordering::SeqCst);
            manager
        }
    }

    struct MockConn {
        hang: bool,
    }

    #[async_trait]
    impl Wire for MockConn {
        async fn request(&mut self, cmd: &Command) -> Result<Reply> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            match cmd.name() {
                "FAIL" => Err(RedisError::Connection("reset by peer".into())),
                "BADTYPE" => Err(RedisError::Command("WRONGTYPE".into())),
                _ => Ok(Reply::Status("PONG".into())),
            }
        }

        async fn pipeline(&mut self, cmds: &[Command]) -> Result<Vec<Reply>> {
            Ok(cmds.iter().map(|_| Reply::ok()).collect())
        }

        async fn transaction(&mut self, cmds: &[Command]) -> Result<Vec<Reply>> {
            self.pipeline(cmds).await
        }
    }

    #[async_trait]
    impl ManageConnection for MockManager {
        type Connection = MockConn;

        async fn connect(&self) -> Result<MockConn> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(MockConn { hang: false })
        }

        async fn is_valid(&self, _conn: &mut MockConn) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(RedisError::Connection("probe failed".into()))
            }
        }
    }

    fn pool(config: PoolConfig) -> Pool<MockManager> {
        Pool::new(MockManager::healthy(), config)
    }

    #[tokio::test]
    async fn test_reuses_returned_connection() {
        let pool = pool(PoolConfig::default());

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.state(), PoolState { active: 1, idle: 0 });
        conn.release();
        assert_eq!(pool.state(), PoolState { active: 0, idle: 1 });

        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.manager().dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_when_exhausted() {
        let pool = pool(PoolConfig {
            max_active: 2,
            wait: false,
            ..Default::default()
        });

        let _a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(RedisError::PoolExhausted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_when_exhausted() {
        let pool = pool(PoolConfig {
            max_active: 1,
            wait_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        });

        let held = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(RedisError::PoolExhausted)));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_never_exceeds_max_active() {
        let pool = pool(PoolConfig {
            max_active: 3,
            ..Default::default()
        });
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _conn = pool.get().await.unwrap();
                peak.fetch_max(pool.state().active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.state().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_only_after_staleness_threshold() {
        let pool = pool(PoolConfig::default());

        pool.get().await.unwrap().release();
        tokio::time::advance(Duration::from_secs(30)).await;
        pool.get().await.unwrap().release();
        assert_eq!(pool.manager().probes.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        pool.get().await.unwrap().release();
        assert_eq!(pool.manager().probes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.manager().dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_replaces_connection() {
        let pool = pool(PoolConfig::default());

        pool.get().await.unwrap().release();
        pool.manager().healthy.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(90)).await;

        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.manager().dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_evicts() {
        let pool = pool(PoolConfig {
            idle_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        });

        pool.get().await.unwrap().release();
        tokio::time::advance(Duration::from_secs(11)).await;
        pool.get().await.unwrap().release();

        assert_eq!(pool.manager().dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.manager().probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_discards_on_return() {
        let pool = pool(PoolConfig {
            max_conn_lifetime: Some(Duration::from_secs(5)),
            ..Default::default()
        });

        let conn = pool.get().await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        conn.release();
        assert_eq!(pool.state().idle, 0);
    }

    #[tokio::test]
    async fn test_max_idle_bounds_idle_list() {
        let pool = pool(PoolConfig {
            max_idle: 1,
            ..Default::default()
        });

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        let c = pool.get().await.unwrap();
        drop((a, b, c));
        assert_eq!(pool.state(), PoolState { active: 0, idle: 1 });
    }

    #[tokio::test]
    async fn test_close_rejects_and_discards() {
        let pool = pool(PoolConfig::default());

        pool.get().await.unwrap().release();
        let in_flight = pool.get().await.unwrap();
        pool.get().await.unwrap().release();

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.state().idle, 0);
        assert!(matches!(pool.get().await, Err(RedisError::PoolClosed)));

        drop(in_flight);
        assert_eq!(pool.state(), PoolState { active: 0, idle: 0 });
    }

    #[tokio::test]
    async fn test_transport_error_discards_connection() {
        let pool = pool(PoolConfig::default());

        let mut conn = pool.get().await.unwrap();
        assert!(conn.request(&Command::new("FAIL")).await.is_err());
        drop(conn);
        assert_eq!(pool.state().idle, 0);

        let mut conn = pool.get().await.unwrap();
        assert!(conn.request(&Command::new("BADTYPE")).await.is_err());
        drop(conn);
        assert_eq!(pool.state().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_command_discards_connection() {
        struct HangingManager;

        #[async_trait]
        impl ManageConnection for HangingManager {
            type Connection = MockConn;

            async fn connect(&self) -> Result<MockConn> {
                Ok(MockConn { hang: true })
            }

            async fn is_valid(&self, _conn: &mut MockConn) -> Result<()> {
                Ok(())
            }
        }

        let pool = Pool::new(HangingManager, PoolConfig::default());
        let mut conn = pool.get().await.unwrap();
        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            conn.request(&Command::new("PING")),
        )
        .await;
        assert!(outcome.is_err());
        drop(conn);
        assert_eq!(pool.state().idle, 0);
    }
}
