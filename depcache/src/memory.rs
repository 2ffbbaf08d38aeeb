//! In-process store.
//!
//! [`MemoryStore`] understands the commands the client issues (strings,
//! lists, hashes, sets, expirations, `MULTI`/`EXEC`, `SCRIPT LOAD`,
//! `EVALSHA` of the known scripts) so the cache can run without a server.
//! Expirations follow the tokio clock, which lets tests drive time with
//! `tokio::time::pause`.

use async_trait::async_trait;
use depcache_redis::{Arg, Command, ManageConnection, RedisError, Reply, Result, Wire, ping};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::script::{self, KILL_BY_DEPENDENCY_SOURCE, LOCK_ACQUIRE_SOURCE, LOCK_RELEASE_SOURCE};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Entry>,
    scripts: HashMap<String, String>,
    script_loads: usize,
}

fn server_error(message: impl Into<String>) -> RedisError {
    RedisError::Command(message.into())
}

fn wrong_type() -> RedisError {
    server_error(WRONGTYPE)
}

fn arity(name: &str, args: &[Arg], min: usize) -> Result<()> {
    if args.len() < min {
        return Err(server_error(format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_ascii_lowercase()
        )));
    }
    Ok(())
}

fn text(arg: &Arg) -> String {
    arg.to_text()
}

fn bytes(arg: &Arg) -> Vec<u8> {
    arg.as_bytes().into_owned()
}

fn int(arg: &Arg) -> Result<i64> {
    match arg {
        Arg::Int(i) => Ok(*i),
        other => other
            .to_text()
            .parse()
            .map_err(|_| server_error("ERR value is not an integer or out of range")),
    }
}

fn bulk_array<'a>(items: impl Iterator<Item = &'a Vec<u8>>) -> Reply {
    Reply::Array(items.map(|item| Reply::Bulk(item.clone())).collect())
}

fn glob_match(pattern: &[u8], candidate: &[u8]) -> bool {
    match (pattern.first(), candidate.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], candidate)
                || (!candidate.is_empty() && glob_match(pattern, &candidate[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &candidate[1..]),
        (Some(p), Some(c)) if p == c => glob_match(&pattern[1..], &candidate[1..]),
        _ => false,
    }
}

impl State {
    fn purge(&mut self, now: Instant) {
        self.keys
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
    }

    fn string(&self, key: &str) -> Result<Option<&Vec<u8>>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(b),
                ..
            }) => Ok(Some(b)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set_ref(&self, key: &str) -> Result<Option<&BTreeSet<Vec<u8>>>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn hash_ref(&self, key: &str) -> Result<Option<&BTreeMap<Vec<u8>, Vec<u8>>>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn list_ref(&self, key: &str) -> Result<Option<&VecDeque<Vec<u8>>>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(Some(l)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut BTreeSet<Vec<u8>>> {
        let entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Set(BTreeSet::new())));
        match &mut entry.value {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type()),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut BTreeMap<Vec<u8>, Vec<u8>>> {
        let entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(BTreeMap::new())));
        match &mut entry.value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type()),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<Vec<u8>>> {
        let entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(l) => Ok(l),
            _ => Err(wrong_type()),
        }
    }

    fn put_string(&mut self, key: String, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.keys.insert(
            key,
            Entry {
                value: Value::Str(value),
                expires_at,
            },
        );
    }

    fn hash_pairs(&mut self, name: &str, args: &[Arg]) -> Result<i64> {
        arity(name, args, 3)?;
        if (args.len() - 1) % 2 != 0 {
            return Err(server_error(format!(
                "ERR wrong number of arguments for '{}' command",
                name.to_ascii_lowercase()
            )));
        }
        let hash = self.hash_mut(&text(&args[0]))?;
        let mut added = 0;
        for pair in args[1..].chunks(2) {
            if hash.insert(bytes(&pair[0]), bytes(&pair[1])).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    fn execute(&mut self, cmd: &Command) -> Result<Reply> {
        let now = Instant::now();
        self.purge(now);

        let name = cmd.name().to_ascii_uppercase();
        let args = cmd.arguments();

        match name.as_str() {
            "PING" => Ok(Reply::Status("PONG".into())),
            "AUTH" | "SELECT" => {
                arity(&name, args, 1)?;
                Ok(Reply::ok())
            }
            "CLIENT" => Ok(Reply::ok()),
            "GET" => {
                arity(&name, args, 1)?;
                Ok(match self.string(&text(&args[0]))? {
                    Some(value) => Reply::Bulk(value.clone()),
                    None => Reply::Nil,
                })
            }
            "SET" => {
                arity(&name, args, 2)?;
                let ttl = match args.get(2).map(text) {
                    Some(option) if option.eq_ignore_ascii_case("EX") => {
                        let secs = args.get(3).map(int).transpose()?.unwrap_or(0);
                        if secs <= 0 {
                            return Err(server_error("ERR invalid expire time in 'set' command"));
                        }
                        Some(Duration::from_secs(secs as u64))
                    }
                    Some(_) => return Err(server_error("ERR syntax error")),
                    None => None,
                };
                self.put_string(text(&args[0]), bytes(&args[1]), ttl);
                Ok(Reply::ok())
            }
            "SETEX" => {
                arity(&name, args, 3)?;
                let secs = int(&args[1])?;
                if secs <= 0 {
                    return Err(server_error("ERR invalid expire time in 'setex' command"));
                }
                self.put_string(
                    text(&args[0]),
                    bytes(&args[2]),
                    Some(Duration::from_secs(secs as u64)),
                );
                Ok(Reply::ok())
            }
            "DEL" => {
                arity(&name, args, 1)?;
                let removed = args
                    .iter()
                    .filter(|key| self.keys.remove(&text(key)).is_some())
                    .count();
                Ok(Reply::Integer(removed as i64))
            }
            "EXISTS" => {
                arity(&name, args, 1)?;
                let found = args
                    .iter()
                    .filter(|key| self.keys.contains_key(&text(key)))
                    .count();
                Ok(Reply::Integer(found as i64))
            }
            "EXPIRE" => {
                arity(&name, args, 2)?;
                let key = text(&args[0]);
                let secs = int(&args[1])?;
                if !self.keys.contains_key(&key) {
                    return Ok(Reply::Integer(0));
                }
                if secs <= 0 {
                    self.keys.remove(&key);
                } else if let Some(entry) = self.keys.get_mut(&key) {
                    entry.expires_at = Some(now + Duration::from_secs(secs as u64));
                }
                Ok(Reply::Integer(1))
            }
            "TTL" => {
                arity(&name, args, 1)?;
                Ok(Reply::Integer(match self.keys.get(&text(&args[0])) {
                    None => -2,
                    Some(Entry {
                        expires_at: None, ..
                    }) => -1,
                    Some(Entry {
                        expires_at: Some(at),
                        ..
                    }) => ((at.duration_since(now).as_millis() + 500) / 1000) as i64,
                }))
            }
            "HSET" => Ok(Reply::Integer(self.hash_pairs(&name, args)?)),
            "HMSET" => {
                self.hash_pairs(&name, args)?;
                Ok(Reply::ok())
            }
            "HGET" => {
                arity(&name, args, 2)?;
                let field = bytes(&args[1]);
                Ok(match self.hash_ref(&text(&args[0]))? {
                    Some(hash) => hash.get(&field).cloned().map_or(Reply::Nil, Reply::Bulk),
                    None => Reply::Nil,
                })
            }
            "HMGET" => {
                arity(&name, args, 2)?;
                let hash = self.hash_ref(&text(&args[0]))?;
                Ok(Reply::Array(
                    args[1..]
                        .iter()
                        .map(|field| {
                            hash.and_then(|h| h.get(&bytes(field)).cloned())
                                .map_or(Reply::Nil, Reply::Bulk)
                        })
                        .collect(),
                ))
            }
            "SADD" => {
                arity(&name, args, 2)?;
                let set = self.set_mut(&text(&args[0]))?;
                let added = args[1..].iter().filter(|m| set.insert(bytes(m))).count();
                Ok(Reply::Integer(added as i64))
            }
            "SREM" => {
                arity(&name, args, 2)?;
                let key = text(&args[0]);
                if self.set_ref(&key)?.is_none() {
                    return Ok(Reply::Integer(0));
                }
                let set = self.set_mut(&key)?;
                let removed = args[1..].iter().filter(|m| set.remove(&bytes(m))).count();
                if set.is_empty() {
                    self.keys.remove(&key);
                }
                Ok(Reply::Integer(removed as i64))
            }
            "SISMEMBER" => {
                arity(&name, args, 2)?;
                let member = bytes(&args[1]);
                let found = self
                    .set_ref(&text(&args[0]))?
                    .is_some_and(|set| set.contains(&member));
                Ok(Reply::Integer(found as i64))
            }
            "SMEMBERS" => {
                arity(&name, args, 1)?;
                Ok(match self.set_ref(&text(&args[0]))? {
                    Some(set) => bulk_array(set.iter()),
                    None => Reply::Array(Vec::new()),
                })
            }
            "RPUSH" | "LPUSH" => {
                arity(&name, args, 2)?;
                let list = self.list_mut(&text(&args[0]))?;
                for value in &args[1..] {
                    if name == "RPUSH" {
                        list.push_back(bytes(value));
                    } else {
                        list.push_front(bytes(value));
                    }
                }
                Ok(Reply::Integer(list.len() as i64))
            }
            "LRANGE" => {
                arity(&name, args, 3)?;
                let (start, stop) = (int(&args[1])?, int(&args[2])?);
                let Some(list) = self.list_ref(&text(&args[0]))? else {
                    return Ok(Reply::Array(Vec::new()));
                };
                let len = list.len() as i64;
                let start = if start < 0 { len + start } else { start }.max(0);
                let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
                if start > stop || start >= len {
                    return Ok(Reply::Array(Vec::new()));
                }
                Ok(bulk_array(
                    list.iter().skip(start as usize).take((stop - start + 1) as usize),
                ))
            }
            "KEYS" => {
                arity(&name, args, 1)?;
                let pattern = bytes(&args[0]);
                let mut keys: Vec<&String> = self
                    .keys
                    .keys()
                    .filter(|key| glob_match(&pattern, key.as_bytes()))
                    .collect();
                keys.sort();
                Ok(Reply::Array(
                    keys.into_iter()
                        .map(|key| Reply::Bulk(key.as_bytes().to_vec()))
                        .collect(),
                ))
            }
            "FLUSHDB" | "FLUSHALL" => {
                self.keys.clear();
                Ok(Reply::ok())
            }
            "SCRIPT" => self.script_command(args),
            "EVALSHA" => self.evalsha(args),
            other => Err(server_error(format!("ERR unknown command '{other}'"))),
        }
    }

    fn script_command(&mut self, args: &[Arg]) -> Result<Reply> {
        arity("script", args, 1)?;
        match text(&args[0]).to_ascii_uppercase().as_str() {
            "LOAD" => {
                arity("script|load", args, 2)?;
                let source = text(&args[1]);
                let digest = script::digest(&source);
                self.scripts.insert(digest.clone(), source);
                self.script_loads += 1;
                Ok(Reply::Bulk(digest.into_bytes()))
            }
            "FLUSH" => {
                self.scripts.clear();
                Ok(Reply::ok())
            }
            "EXISTS" => Ok(Reply::Array(
                args[1..]
                    .iter()
                    .map(|d| Reply::Integer(self.scripts.contains_key(&text(d)) as i64))
                    .collect(),
            )),
            other => Err(server_error(format!("ERR unknown subcommand '{other}'"))),
        }
    }

    fn evalsha(&mut self, args: &[Arg]) -> Result<Reply> {
        arity("evalsha", args, 2)?;
        let digest = text(&args[0]).to_ascii_lowercase();
        let source = self
            .scripts
            .get(&digest)
            .cloned()
            .ok_or_else(|| RedisError::NoScript(digest.clone()))?;

        let numkeys = usize::try_from(int(&args[1])?)
            .map_err(|_| server_error("ERR Number of keys can't be negative"))?;
        if numkeys > args.len() - 2 {
            return Err(server_error(
                "ERR Number of keys can't be greater than number of args",
            ));
        }
        let keys: Vec<String> = args[2..2 + numkeys].iter().map(text).collect();
        let argv = &args[2 + numkeys..];

        if source == KILL_BY_DEPENDENCY_SOURCE {
            self.kill_by_dependency(&keys)
        } else if source == LOCK_ACQUIRE_SOURCE {
            self.lock_acquire(&keys, argv)
        } else if source == LOCK_RELEASE_SOURCE {
            self.lock_release(&keys, argv)
        } else {
            Err(server_error("ERR script not supported by the in-memory store"))
        }
    }

    fn kill_by_dependency(&mut self, indexes: &[String]) -> Result<Reply> {
        let mut doomed = Vec::new();
        for index in indexes {
            doomed.push(index.clone());
            if let Some(members) = self.set_ref(index)? {
                doomed.extend(members.iter().map(|m| String::from_utf8_lossy(m).into_owned()));
            }
        }
        let total = doomed
            .iter()
            .filter(|key| self.keys.remove(key.as_str()).is_some())
            .count();
        Ok(Reply::Integer(total as i64))
    }

    fn lock_acquire(&mut self, keys: &[String], argv: &[Arg]) -> Result<Reply> {
        let (Some(name), Some(secret), Some(ttl)) = (keys.first(), argv.first(), argv.get(1)) else {
            return Err(server_error("ERR lock-acquire expects 1 key and 2 arguments"));
        };
        let secret = bytes(secret);
        let ttl = int(ttl)?;
        let free = match self.string(name)? {
            None => true,
            Some(current) => *current == secret,
        };
        if !free {
            return Ok(Reply::Integer(0));
        }
        if ttl <= 0 {
            return Err(server_error("ERR invalid expire time in 'set' command"));
        }
        self.put_string(name.clone(), secret, Some(Duration::from_secs(ttl as u64)));
        Ok(Reply::Integer(1))
    }

    fn lock_release(&mut self, keys: &[String], argv: &[Arg]) -> Result<Reply> {
        let (Some(name), Some(secret)) = (keys.first(), argv.first()) else {
            return Err(server_error("ERR lock-release expects 1 key and 1 argument"));
        };
        let secret = bytes(secret);
        let held_by_caller = match self.string(name)? {
            None => return Ok(Reply::Integer(1)),
            Some(current) => *current == secret,
        };
        if held_by_caller {
            self.keys.remove(name);
            Ok(Reply::Integer(1))
        } else {
            Ok(Reply::Integer(0))
        }
    }
}

/// Shared in-process keyspace.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection to this store.
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            store: self.clone(),
        }
    }

    /// A connection factory for [`Pool`](depcache_redis::Pool).
    pub fn manager(&self) -> MemoryManager {
        MemoryManager {
            store: self.clone(),
            dials: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        }
    }

    /// Run one command.
    pub fn execute(&self, cmd: &Command) -> Result<Reply> {
        self.state.lock().execute(cmd)
    }

    fn execute_all(&self, cmds: &[Command]) -> Result<Vec<Reply>> {
        let mut state = self.state.lock();
        let results: Vec<Result<Reply>> = cmds.iter().map(|cmd| state.execute(cmd)).collect();
        results.into_iter().collect()
    }

    /// Forget every loaded script, as `SCRIPT FLUSH` does.
    pub fn flush_scripts(&self) {
        self.state.lock().scripts.clear();
    }

    /// Whether a script with this digest is loaded.
    pub fn has_script(&self, digest: &str) -> bool {
        self.state.lock().scripts.contains_key(digest)
    }

    /// Number of `SCRIPT LOAD` calls served.
    pub fn script_loads(&self) -> usize {
        self.state.lock().script_loads
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.purge(Instant::now());
        state.keys.len()
    }

    /// Whether the keyspace is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A connection to a [`MemoryStore`].
pub struct MemoryConnection {
    store: MemoryStore,
}

#[async_trait]
impl Wire for MemoryConnection {
    async fn request(&mut self, cmd: &Command) -> Result<Reply> {
        self.store.execute(cmd)
    }

    async fn pipeline(&mut self, cmds: &[Command]) -> Result<Vec<Reply>> {
        self.store.execute_all(cmds)
    }

    async fn transaction(&mut self, cmds: &[Command]) -> Result<Vec<Reply>> {
        self.store.execute_all(cmds)
    }
}

/// Dials [`MemoryConnection`]s and counts the dials.
pub struct MemoryManager {
    store: MemoryStore,
    dials: AtomicUsize,
    refuse: AtomicBool,
}

impl MemoryManager {
    /// The store behind every connection.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Connections dialed so far.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Acquire)
    }

    /// Make subsequent dials fail.
    pub fn refuse_dials(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Release);
    }
}

#[async_trait]
impl ManageConnection for MemoryManager {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection> {
        if self.refuse.load(Ordering::Acquire) {
            return Err(RedisError::Dial("connection refused".into()));
        }
        self.dials.fetch_add(1, Ordering::AcqRel);
        Ok(self.store.connection())
    }

    async fn is_valid(&self, conn: &mut MemoryConnection) -> Result<()> {
        ping(conn).await
    }
}
