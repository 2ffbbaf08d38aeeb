//! Distributed locks.
//!
//! A lock is a plain key holding its holder's secret, with a TTL. Acquire
//! and release run as scripts so the ownership check and the write are one
//! step on the server.

use depcache_redis::{Arg, ManageConnection, RedisConnectionManager, RedisError, Wire};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::Client;
use crate::error::{CacheError, CacheResult};
use crate::script::{LOCK_ACQUIRE, LOCK_RELEASE, ScriptRegistry};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Take or refresh `name` for `secret` with a TTL of `ttl_secs`.
///
/// Fails with [`CacheError::LockMismatch`] while another secret holds it.
pub async fn acquire<W: Wire + ?Sized>(
    conn: &mut W,
    scripts: &ScriptRegistry,
    name: &str,
    secret: &str,
    ttl_secs: u64,
) -> CacheResult<bool> {
    if ttl_secs == 0 {
        return Err(RedisError::Config(format!("lock {name:?} needs a ttl of at least one second")).into());
    }

    let acquired = scripts
        .invoke(
            conn,
            LOCK_ACQUIRE,
            &[Arg::from(name)],
            &[Arg::from(secret), Arg::from(ttl_secs)],
        )
        .await?
        .into_int()?;

    if acquired == 0 {
        debug!(lock = name, "Lock held by another secret");
        return Err(CacheError::LockMismatch);
    }
    debug!(lock = name, ttl_secs, "Acquired lock");
    Ok(true)
}

/// Release `name` if `secret` holds it. A missing lock counts as released.
pub async fn release<W: Wire + ?Sized>(
    conn: &mut W,
    scripts: &ScriptRegistry,
    name: &str,
    secret: &str,
) -> CacheResult<bool> {
    let released = scripts
        .invoke(conn, LOCK_RELEASE, &[Arg::from(name)], &[Arg::from(secret)])
        .await?
        .into_int()?;

    if released == 0 {
        debug!(lock = name, "Release refused, lock held by another secret");
        return Err(CacheError::LockMismatch);
    }
    debug!(lock = name, "Released lock");
    Ok(true)
}

/// A named lock bound to a client and a random secret.
pub struct DistributedLock<M: ManageConnection = RedisConnectionManager> {
    client: Client<M>,
    name: String,
    secret: String,
    ttl: Duration,
}

impl<M: ManageConnection> DistributedLock<M> {
    /// Create a lock with a fresh secret.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use depcache::DistributedLock;
    /// use std::time::Duration;
    ///
    /// let lock = DistributedLock::new(client.clone(), "report-job", Duration::from_secs(30));
    /// if lock.try_acquire().await? {
    ///     // ...
    ///     lock.release().await?;
    /// }
    /// ```
    pub fn new(client: Client<M>, name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            name: name.into(),
            secret: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    /// Lock key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Secret fencing this holder.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Lock TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the lock once. `Ok(false)` means another holder has it.
    pub async fn try_acquire(&self) -> CacheResult<bool> {
        match self
            .client
            .write_lock(&self.name, &self.secret, self.ttl.as_secs())
            .await
        {
            Ok(acquired) => Ok(acquired),
            Err(CacheError::LockMismatch) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Poll until the lock is taken or `timeout` elapses.
    pub async fn acquire_timeout(&self, timeout: Duration) -> CacheResult<()> {
        let start = tokio::time::Instant::now();

        loop {
            if self.try_acquire().await? {
                info!(lock = %self.name, "Acquired lock");
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(CacheError::LockTimeout(self.name.clone()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Reset the TTL while still holding the lock.
    pub async fn refresh(&self) -> CacheResult<()> {
        self.client
            .write_lock(&self.name, &self.secret, self.ttl.as_secs())
            .await
            .map(|_| ())
    }

    /// Release the lock.
    pub async fn release(&self) -> CacheResult<()> {
        self.client
            .release_lock(&self.name, &self.secret)
            .await
            .map(|_| ())
    }
}

/// Builder for [`DistributedLock`].
pub struct LockBuilder {
    name: String,
    ttl: Duration,
    secret: Option<String>,
}

impl LockBuilder {
    /// Create new lock builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl: Duration::from_secs(30),
            secret: None,
        }
    }

    /// Set TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Use a caller-chosen secret instead of a random one.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Build the lock
    pub fn build<M: ManageConnection>(self, client: Client<M>) -> DistributedLock<M> {
        let mut lock = DistributedLock::new(client, self.name, self.ttl);
        if let Some(secret) = self.secret {
            lock.secret = secret;
        }
        lock
    }
}
