//! The cache client.

use depcache_redis::{
    Arg, Command, ManageConnection, Pool, PoolState, Pooled, RedisConfig, RedisConnectionManager,
    RedisError, RedisUrl, Reply, Wire,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dependency::{self, KillOutcome};
use crate::error::{CacheError, CacheResult};
use crate::lock;
use crate::script::ScriptRegistry;

struct ClientInner<M: ManageConnection> {
    pool: Pool<M>,
    scripts: ScriptRegistry,
    config: RedisConfig,
}

/// Cache client over a pool of connections.
///
/// Cloning is cheap; clones share the pool and the script digests.
pub struct Client<M: ManageConnection = RedisConnectionManager> {
    inner: Arc<ClientInner<M>>,
}

impl<M: ManageConnection> Clone for Client<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Client {
    /// Connect to the destination named by `config.url`.
    ///
    /// In dependency mode the scripts are loaded before this returns, so a
    /// bad destination fails here rather than on first use.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use depcache::{Client, RedisConfig};
    ///
    /// # async fn example() -> depcache::CacheResult<()> {
    /// let config = RedisConfig::builder()
    ///     .url("redis://localhost:6379/0")
    ///     .dependency_mode(true)
    ///     .build();
    /// let client = Client::connect(config).await?;
    ///
    /// client.set("user-michael", "...", &["user-23", "user-profile-23"]).await?;
    /// client.kill_by_dependency(&["user-23"]).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: RedisConfig) -> CacheResult<Self> {
        let url = RedisUrl::parse(&config.url)?;
        info!(url = %url, "Connecting cache client");
        let manager = RedisConnectionManager::new(url, config.dial.clone());
        Self::with_manager(manager, config).await
    }
}

impl<M: ManageConnection> Client<M> {
    /// Build a client over any connection factory.
    pub async fn with_manager(manager: M, config: RedisConfig) -> CacheResult<Self> {
        let pool = Pool::new(manager, config.pool_config());
        let client = Self {
            inner: Arc::new(ClientInner {
                pool,
                scripts: ScriptRegistry::new(),
                config,
            }),
        };

        if client.inner.config.dependency_mode {
            let mut conn = client.inner.pool.get().await?;
            client.inner.scripts.warm_up(&mut conn).await?;
        }

        Ok(client)
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &RedisConfig {
        &self.inner.config
    }

    /// The script registry.
    pub fn scripts(&self) -> &ScriptRegistry {
        &self.inner.scripts
    }

    /// Pool statistics.
    pub fn pool_state(&self) -> PoolState {
        self.inner.pool.state()
    }

    /// Borrow a connection. It returns to the pool when dropped.
    pub async fn get_connection(&self) -> CacheResult<Pooled<M>> {
        self.run(async { self.inner.pool.get().await.map_err(CacheError::from) })
            .await
    }

    /// Refuse further operations and close idle connections.
    pub fn close(&self) {
        self.inner.pool.close();
    }

    /// Whether the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Close the client when the process receives Ctrl-C or SIGTERM.
    ///
    /// The process is left running; shutting it down is up to the caller.
    pub fn close_on_shutdown_signal(&self) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing cache client");
            client.close();
        })
    }

    async fn run<T, F>(&self, op: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        match self.inner.config.command_timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| CacheError::from(RedisError::Timeout))?,
            None => op.await,
        }
    }

    async fn request(&self, cmd: Command) -> CacheResult<Reply> {
        self.run(async {
            let mut conn = self.inner.pool.get().await?;
            conn.request(&cmd).await.map_err(CacheError::from)
        })
        .await
    }

    /// Run `primary` and then link `key` to `tags` on the same connection.
    async fn write_linked(&self, primary: Vec<Command>, key: &str, tags: &[&str]) -> CacheResult<()> {
        self.run(async {
            let mut conn = self.inner.pool.get().await?;
            for cmd in &primary {
                ensure_written(conn.request(cmd).await?)?;
            }
            dependency::link(&mut conn, key, tags).await
        })
        .await
    }

    // Writes

    /// `SET key value`, then link `key` to `tags`.
    pub async fn set(&self, key: &str, value: impl Into<Arg>, tags: &[&str]) -> CacheResult<()> {
        let cmd = Command::new("SET").arg(key).arg(value);
        self.write_linked(vec![cmd], key, tags).await
    }

    /// `SETEX key ttl value`, then link. The TTL is rounded down to whole
    /// seconds; under one second the value is stored without expiration.
    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: impl Into<Arg>,
        ttl: Duration,
        tags: &[&str],
    ) -> CacheResult<()> {
        let cmd = match ttl.as_secs() {
            0 => Command::new("SET").arg(key).arg(value),
            secs => Command::new("SETEX").arg(key).arg(secs).arg(value),
        };
        self.write_linked(vec![cmd], key, tags).await
    }

    /// `HSET hash field value`, then link `hash`.
    pub async fn hash_set(
        &self,
        hash: &str,
        field: &str,
        value: impl Into<Arg>,
        tags: &[&str],
    ) -> CacheResult<()> {
        let cmd = Command::new("HSET").arg(hash).arg(field).arg(value);
        self.write_linked(vec![cmd], hash, tags).await
    }

    /// `HMSET hash f1 v1 ...`, then link `hash`. Nothing is written for an
    /// empty set of pairs.
    pub async fn hash_map_set<I, F, V>(&self, hash: &str, pairs: I, tags: &[&str]) -> CacheResult<()>
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<Arg>,
        V: Into<Arg>,
    {
        let Some(cmd) = hmset(hash, pairs) else {
            return Ok(());
        };
        self.write_linked(vec![cmd], hash, tags).await
    }

    /// `HMSET` followed by `EXPIRE hash ttl`, then link `hash`. The TTL is
    /// rounded down to whole seconds; under one second no expiration is set.
    pub async fn hash_map_set_with_ttl<I, F, V>(
        &self,
        hash: &str,
        pairs: I,
        ttl: Duration,
        tags: &[&str],
    ) -> CacheResult<()>
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<Arg>,
        V: Into<Arg>,
    {
        let Some(cmd) = hmset(hash, pairs) else {
            return Ok(());
        };
        let mut primary = vec![cmd];
        if ttl.as_secs() > 0 {
            primary.push(Command::new("EXPIRE").arg(hash).arg(ttl.as_secs()));
        }
        self.write_linked(primary, hash, tags).await
    }

    /// `SADD set member`, then link `set`.
    pub async fn set_add(&self, set: &str, member: impl Into<Arg>, tags: &[&str]) -> CacheResult<()> {
        let cmd = Command::new("SADD").arg(set).arg(member);
        self.write_linked(vec![cmd], set, tags).await
    }

    /// `SADD set m1 ... mk` without linking. Returns the number added.
    pub async fn set_add_many<I, A>(&self, set: &str, members: I) -> CacheResult<i64>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let cmd = Command::new("SADD").arg(set).args(members);
        if cmd.arguments().len() == 1 {
            return Ok(0);
        }
        Ok(self.request(cmd).await?.into_int()?)
    }

    /// `SREM set member`. Returns whether the member was present.
    pub async fn set_remove(&self, set: &str, member: impl Into<Arg>) -> CacheResult<bool> {
        let cmd = Command::new("SREM").arg(set).arg(member);
        Ok(self.request(cmd).await?.into_bool()?)
    }

    /// `RPUSH key v1 ...`. Returns the new list length.
    pub async fn list_push<I, A>(&self, key: &str, values: I) -> CacheResult<i64>
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let cmd = Command::new("RPUSH").arg(key).args(values);
        Ok(self.request(cmd).await?.into_int()?)
    }

    // Reads

    /// `GET key` as text. A missing key is the nil error.
    pub async fn get(&self, key: &str) -> CacheResult<String> {
        Ok(self.request(Command::new("GET").arg(key)).await?.into_string()?)
    }

    /// `GET key` as raw bytes.
    pub async fn get_bytes(&self, key: &str) -> CacheResult<Vec<u8>> {
        Ok(self.request(Command::new("GET").arg(key)).await?.into_bytes()?)
    }

    /// `HGET hash field`.
    pub async fn hash_get(&self, hash: &str, field: &str) -> CacheResult<String> {
        let cmd = Command::new("HGET").arg(hash).arg(field);
        Ok(self.request(cmd).await?.into_string()?)
    }

    /// `HMGET hash f1 ...`; missing fields are `None`.
    pub async fn hash_map_get(&self, hash: &str, fields: &[&str]) -> CacheResult<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let cmd = Command::new("HMGET").arg(hash).args(fields.iter().copied());
        Ok(self.request(cmd).await?.into_optional_strings()?)
    }

    /// `SISMEMBER set member`.
    pub async fn set_is_member(&self, set: &str, member: impl Into<Arg>) -> CacheResult<bool> {
        let cmd = Command::new("SISMEMBER").arg(set).arg(member);
        Ok(self.request(cmd).await?.into_bool()?)
    }

    /// `SMEMBERS set`.
    pub async fn set_members(&self, set: &str) -> CacheResult<Vec<String>> {
        let cmd = Command::new("SMEMBERS").arg(set);
        Ok(self.request(cmd).await?.into_strings()?)
    }

    /// `LRANGE key start stop`.
    pub async fn list_range(&self, key: &str, start: i64, stop: i64) -> CacheResult<Vec<String>> {
        let cmd = Command::new("LRANGE").arg(key).arg(start).arg(stop);
        Ok(self.request(cmd).await?.into_strings()?)
    }

    /// `EXISTS key`.
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.request(Command::new("EXISTS").arg(key)).await?.into_bool()?)
    }

    /// Remaining time to live; `None` for a missing or persistent key.
    pub async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let seconds = self.request(Command::new("TTL").arg(key)).await?.into_int()?;
        match seconds {
            seconds if seconds >= 0 => Ok(Some(Duration::from_secs(seconds as u64))),
            _ => Ok(None),
        }
    }

    /// Keys recorded under `tag`, sorted. Stale keys are included.
    pub async fn dependency_members(&self, tag: &str) -> CacheResult<Vec<String>> {
        self.run(async {
            let mut conn = self.inner.pool.get().await?;
            dependency::members(&mut conn, tag).await
        })
        .await
    }

    // Invalidation

    /// Delete `keys`. In dependency mode each key is also treated as a tag:
    /// everything linked to it and its index go too. Returns the number of
    /// keys removed.
    pub async fn delete(&self, keys: &[&str]) -> CacheResult<i64> {
        if !self.inner.config.dependency_mode {
            return self.delete_without_dependency(keys).await;
        }
        let KillOutcome { removed, cleaned } = self.kill(keys).await?;
        Ok(removed + cleaned)
    }

    /// Plain `DEL keys...`.
    pub async fn delete_without_dependency(&self, keys: &[&str]) -> CacheResult<i64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let cmd = Command::new("DEL").args(keys.iter().copied());
        Ok(self.request(cmd).await?.into_int()?)
    }

    /// Delete every key linked to any of `tags` together with the tag
    /// indexes, in one atomic step. Returns the number of keys the script
    /// removed.
    pub async fn kill_by_dependency(&self, tags: &[&str]) -> CacheResult<i64> {
        Ok(self.kill(tags).await?.removed)
    }

    async fn kill(&self, tags: &[&str]) -> CacheResult<KillOutcome> {
        if tags.is_empty() {
            return Ok(KillOutcome::default());
        }
        self.run(async {
            let mut conn = self.inner.pool.get().await?;
            dependency::kill(&mut conn, &self.inner.scripts, tags).await
        })
        .await
    }

    // Locks

    /// Take or refresh lock `name` for `secret`.
    ///
    /// Fails with [`CacheError::LockMismatch`] while another secret holds
    /// it. `ttl_secs` must be at least one.
    pub async fn write_lock(&self, name: &str, secret: &str, ttl_secs: u64) -> CacheResult<bool> {
        self.run(async {
            let mut conn = self.inner.pool.get().await?;
            lock::acquire(&mut conn, &self.inner.scripts, name, secret, ttl_secs).await
        })
        .await
    }

    /// Release lock `name` if `secret` holds it. Releasing a lock that is
    /// not held succeeds.
    pub async fn release_lock(&self, name: &str, secret: &str) -> CacheResult<bool> {
        self.run(async {
            let mut conn = self.inner.pool.get().await?;
            lock::release(&mut conn, &self.inner.scripts, name, secret).await
        })
        .await
    }

    // Server

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> CacheResult<()> {
        self.run(async {
            let mut conn = self.inner.pool.get().await?;
            depcache_redis::ping(&mut conn).await.map_err(CacheError::from)
        })
        .await
    }

    /// `EXPIRE key seconds`, rounded down. Returns whether the key exists.
    pub async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let cmd = Command::new("EXPIRE").arg(key).arg(ttl.as_secs());
        Ok(self.request(cmd).await?.into_bool()?)
    }

    /// Every key in the database (`KEYS *`).
    pub async fn get_all_keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.request(Command::new("KEYS").arg("*")).await?.into_strings()?)
    }

    /// Drop every key in the database (`FLUSHDB`).
    pub async fn destroy_cache(&self) -> CacheResult<()> {
        warn!("Flushing cache database");
        Ok(self.request(Command::new("FLUSHDB")).await?.expect_ok()?)
    }
}

fn hmset<I, F, V>(hash: &str, pairs: I) -> Option<Command>
where
    I: IntoIterator<Item = (F, V)>,
    F: Into<Arg>,
    V: Into<Arg>,
{
    let mut cmd = Command::new("HMSET").arg(hash);
    let mut any = false;
    for (field, value) in pairs {
        cmd = cmd.arg(field).arg(value);
        any = true;
    }
    if !any {
        debug!(hash = hash, "Skipping HMSET without pairs");
        return None;
    }
    Some(cmd)
}

fn ensure_written(reply: Reply) -> depcache_redis::Result<()> {
    match reply {
        Reply::Status(_) | Reply::Integer(_) => Ok(()),
        other => other.expect_ok(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    async fn memory_client(store: &MemoryStore, dependency_mode: bool) -> Client<crate::memory::MemoryManager> {
        let config = RedisConfig::builder()
            .url("redis://memory")
            .dependency_mode(dependency_mode)
            .build();
        Client::with_manager(store.manager(), config).await.unwrap()
    }

    #[test]
    fn test_hmset_skips_empty_pairs() {
        assert!(hmset("h", Vec::<(&str, &str)>::new()).is_none());
        let cmd = hmset("h", [("f1", "v1"), ("f2", "v2")]).unwrap();
        assert_eq!(cmd.to_string(), "HMSET h f1 v1 f2 v2");
    }

    #[tokio::test]
    async fn test_dependency_mode_warms_scripts() {
        let store = MemoryStore::new();
        let client = memory_client(&store, true).await;
        for name in client.scripts().names() {
            assert!(store.has_script(&client.scripts().digest(name).unwrap()));
        }

        let plain = MemoryStore::new();
        memory_client(&plain, false).await.set("k", "v", &[]).await.unwrap();
        assert_eq!(plain.script_loads(), 0);
    }

    #[tokio::test]
    async fn test_delete_outside_dependency_mode_is_plain() {
        let store = MemoryStore::new();
        let client = memory_client(&store, false).await;
        client.set("k", "v", &["t"]).await.unwrap();

        assert_eq!(client.delete(&["t"]).await.unwrap(), 0);
        assert!(client.exists("k").await.unwrap());
        assert_eq!(client.delete(&["k"]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_in_dependency_mode_kills_dependents() {
        let store = MemoryStore::new();
        let client = memory_client(&store, true).await;
        client.set("parent", "p", &[]).await.unwrap();
        client.set("child", "c", &["parent"]).await.unwrap();

        // child + depend:parent from the script, parent from the cleanup
        assert_eq!(client.delete(&["parent"]).await.unwrap(), 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_stores_without_expiry() {
        let store = MemoryStore::new();
        let client = memory_client(&store, false).await;
        client
            .set_with_ttl("k", "v", Duration::from_millis(900), &[])
            .await
            .unwrap();
        assert_eq!(client.ttl("k").await.unwrap(), None);
        assert_eq!(client.get("k").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_closed_client_refuses_operations() {
        let store = MemoryStore::new();
        let client = memory_client(&store, false).await;
        client.close();
        assert!(client.is_closed());

        let err = client.get("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Redis(RedisError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let store = MemoryStore::new();
        let client = memory_client(&store, false).await;
        for i in 0..5 {
            client.set("k", i.to_string(), &[]).await.unwrap();
        }
        assert_eq!(client.pool_state().idle, 1);
        assert_eq!(client.pool_state().active, 0);
    }
}
