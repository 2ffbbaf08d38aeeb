//! Server-side script registry.
//!
//! Scripts are loaded once with `SCRIPT LOAD` and invoked with `EVALSHA`.
//! When the server has forgotten a digest (restart, `SCRIPT FLUSH`) the
//! registry reloads the source and retries exactly once.

use depcache_redis::{Arg, Command, RedisError, Reply, Wire};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::error::CacheResult;

/// Name of the bulk invalidation script.
pub const KILL_BY_DEPENDENCY: &str = "kill-by-dependency";

/// Name of the lock acquisition script.
pub const LOCK_ACQUIRE: &str = "lock-acquire";

/// Name of the lock release script.
pub const LOCK_RELEASE: &str = "lock-release";

/// Deletes every tag index in KEYS together with all of its members and
/// returns the number of keys removed. `DEL` is issued in batches to stay
/// under Lua's `unpack` limit.
pub const KILL_BY_DEPENDENCY_SOURCE: &str = r#"
local doomed = {}
for _, index in ipairs(KEYS) do
    table.insert(doomed, index)
    for _, member in ipairs(redis.call('SMEMBERS', index)) do
        table.insert(doomed, member)
    end
end
local total = 0
for first = 1, #doomed, 4096 do
    local last = math.min(first + 4095, #doomed)
    total = total + redis.call('DEL', unpack(doomed, first, last))
end
return total
"#;

/// Sets KEYS[1] to ARGV[1] with a TTL of ARGV[2] seconds when the key is
/// free or already holds the same secret.
pub const LOCK_ACQUIRE_SOURCE: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
    return 1
end
return 0
"#;

/// Deletes KEYS[1] only while it holds ARGV[1]; a missing key counts as
/// released.
pub const LOCK_RELEASE_SOURCE: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    return 1
end
if current == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Every script the registry knows about.
pub const KNOWN_SCRIPTS: [(&str, &str); 3] = [
    (KILL_BY_DEPENDENCY, KILL_BY_DEPENDENCY_SOURCE),
    (LOCK_ACQUIRE, LOCK_ACQUIRE_SOURCE),
    (LOCK_RELEASE, LOCK_RELEASE_SOURCE),
];

/// SHA1 digest the server assigns to `source`.
pub fn digest(source: &str) -> String {
    depcache_redis::redis::Script::new(source).get_hash().to_string()
}

struct Slot {
    source: &'static str,
    digest: RwLock<String>,
    generation: AtomicU64,
    reload: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new(source: &'static str) -> Self {
        Self {
            source,
            digest: RwLock::new(digest(source)),
            generation: AtomicU64::new(0),
            reload: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> (String, u64) {
        let generation = self.generation.load(Ordering::Acquire);
        (self.digest.read().clone(), generation)
    }

    async fn load<W: Wire + ?Sized>(&self, conn: &mut W) -> CacheResult<String> {
        let loaded = conn
            .request(&Command::new("SCRIPT").arg("LOAD").arg(self.source))
            .await?
            .into_string()?;
        *self.digest.write() = loaded.clone();
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(loaded)
    }

    /// Reload unless another caller already did since `seen`.
    async fn reload<W: Wire + ?Sized>(&self, conn: &mut W, seen: u64) -> CacheResult<()> {
        let _guard = self.reload.lock().await;
        if self.generation.load(Ordering::Acquire) != seen {
            return Ok(());
        }
        self.load(conn).await.map(|_| ())
    }
}

/// Named scripts with their digests.
pub struct ScriptRegistry {
    slots: HashMap<&'static str, Slot>,
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRegistry {
    /// Registry of the dependency and lock scripts.
    pub fn new() -> Self {
        let slots = KNOWN_SCRIPTS
            .into_iter()
            .map(|(name, source)| (name, Slot::new(source)))
            .collect();
        Self { slots }
    }

    /// Names of every registered script.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.slots.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Digest currently used for `name`.
    pub fn digest(&self, name: &str) -> Option<String> {
        self.slots.get(name).map(|slot| slot.current().0)
    }

    fn slot(&self, name: &str) -> CacheResult<&Slot> {
        self.slots
            .get(name)
            .ok_or_else(|| RedisError::Config(format!("unknown script {name:?}")).into())
    }

    /// Load every script onto the server.
    pub async fn warm_up<W: Wire + ?Sized>(&self, conn: &mut W) -> CacheResult<()> {
        for name in self.names() {
            let slot = self.slot(name)?;
            let digest = slot.load(conn).await?;
            debug!(script = name, digest = %digest, "Loaded script");
        }
        Ok(())
    }

    /// Run `name` by digest, reloading it once if the server lost it.
    pub async fn invoke<W: Wire + ?Sized>(
        &self,
        conn: &mut W,
        name: &str,
        keys: &[Arg],
        args: &[Arg],
    ) -> CacheResult<Reply> {
        let slot = self.slot(name)?;
        let (digest, seen) = slot.current();

        match conn.request(&evalsha(&digest, keys, args)).await {
            Err(RedisError::NoScript(_)) => {}
            other => return Ok(other?),
        }

        warn!(script = name, "Script missing on server, reloading");
        slot.reload(conn, seen).await?;

        let (digest, _) = slot.current();
        match conn.request(&evalsha(&digest, keys, args)).await {
            Err(RedisError::NoScript(detail)) => Err(RedisError::Protocol(format!(
                "script {name} still missing after reload: {detail}"
            ))
            .into()),
            other => Ok(other?),
        }
    }
}

fn evalsha(digest: &str, keys: &[Arg], args: &[Arg]) -> Command {
    Command::new("EVALSHA")
        .arg(digest)
        .arg(keys.len())
        .args(keys.iter().cloned())
        .args(args.iter().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnection, MemoryStore};
    use async_trait::async_trait;

    #[test]
    fn test_digest_is_deterministic() {
        let registry = ScriptRegistry::new();
        let kill = registry.digest(KILL_BY_DEPENDENCY).unwrap();
        assert_eq!(kill, digest(KILL_BY_DEPENDENCY_SOURCE));
        assert_eq!(kill.len(), 40);
        assert_ne!(kill, registry.digest(LOCK_ACQUIRE).unwrap());
        assert!(registry.digest("nope").is_none());
    }

    #[test]
    fn test_evalsha_layout() {
        let cmd = evalsha("abc", &[Arg::from("k1"), Arg::from("k2")], &[Arg::from("s")]);
        assert_eq!(cmd.to_string(), "EVALSHA abc 2 k1 k2 s");
    }

    #[tokio::test]
    async fn test_warm_up_registers_every_script() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let registry = ScriptRegistry::new();

        registry.warm_up(&mut conn).await.unwrap();

        for name in registry.names() {
            let digest = registry.digest(name).unwrap();
            assert!(store.has_script(&digest), "{name} not loaded");
        }
    }

    #[tokio::test]
    async fn test_reloads_after_flush() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let registry = ScriptRegistry::new();
        registry.warm_up(&mut conn).await.unwrap();

        store.flush_scripts();

        let reply = registry
            .invoke(&mut conn, LOCK_RELEASE, &[Arg::from("free")], &[Arg::from("s")])
            .await
            .unwrap();
        assert_eq!(reply, Reply::Integer(1));
        assert!(store.has_script(&registry.digest(LOCK_RELEASE).unwrap()));
    }

    #[tokio::test]
    async fn test_invoke_without_warm_up() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let registry = ScriptRegistry::new();

        let reply = registry
            .invoke(&mut conn, KILL_BY_DEPENDENCY, &[Arg::from("depend:none")], &[])
            .await
            .unwrap();
        assert_eq!(reply, Reply::Integer(0));
    }

    /// Memory connection that yields to the scheduler before every reply,
    /// so concurrent callers interleave.
    struct Yielding(MemoryConnection);

    #[async_trait]
    impl Wire for Yielding {
        async fn request(&mut self, cmd: &Command) -> depcache_redis::Result<Reply> {
            tokio::task::yield_now().await;
            self.0.request(cmd).await
        }

        async fn pipeline(&mut self, cmds: &[Command]) -> depcache_redis::Result<Vec<Reply>> {
            tokio::task::yield_now().await;
            self.0.pipeline(cmds).await
        }

        async fn transaction(&mut self, cmds: &[Command]) -> depcache_redis::Result<Vec<Reply>> {
            tokio::task::yield_now().await;
            self.0.transaction(cmds).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_reload_loads_once() {
        let store = MemoryStore::new();
        let registry = ScriptRegistry::new();
        registry.warm_up(&mut store.connection()).await.unwrap();
        store.flush_scripts();
        let loads = store.script_loads();

        let (keys_a, keys_b, args) = ([Arg::from("free-a")], [Arg::from("free-b")], [Arg::from("s")]);
        let mut a = Yielding(store.connection());
        let mut b = Yielding(store.connection());
        let (first, second) = tokio::join!(
            registry.invoke(&mut a, LOCK_RELEASE, &keys_a, &args),
            registry.invoke(&mut b, LOCK_RELEASE, &keys_b, &args),
        );

        assert_eq!(first.unwrap(), Reply::Integer(1));
        assert_eq!(second.unwrap(), Reply::Integer(1));
        assert_eq!(store.script_loads(), loads + 1);
    }

    #[tokio::test]
    async fn test_unknown_script() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let registry = ScriptRegistry::new();
        let err = registry.invoke(&mut conn, "missing", &[], &[]).await.unwrap_err();
        assert!(err.to_string().contains("unknown script"));
    }
}
