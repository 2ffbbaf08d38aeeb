//! Redis cache client with tag-based invalidation.
//!
//! Every write can carry dependency tags. A tag `T` is indexed by the set
//! `depend:T`; killing a tag deletes every key written with it, plus the
//! index, in one server-side script. Distributed locks, fenced by a
//! per-holder secret, ride on the same script registry.
//!
//! # Examples
//!
//! ## Tag-based Invalidation
//!
//! ```no_run
//! use depcache::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CacheError> {
//!     let config = RedisConfig::builder()
//!         .url("redis://localhost:6379")
//!         .dependency_mode(true)
//!         .build();
//!     let client = Client::connect(config).await?;
//!
//!     client.set("user-michael", "{}", &["user-23", "user-profile-23"]).await?;
//!
//!     // Removes user-michael and depend:user-23
//!     let removed = client.kill_by_dependency(&["user-23"]).await?;
//!     assert_eq!(removed, 2);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Locks
//!
//! ```no_run
//! use depcache::*;
//! use std::time::Duration;
//!
//! # async fn example(client: Client) -> Result<(), CacheError> {
//! let lock = LockBuilder::new("nightly-report")
//!     .with_ttl(Duration::from_secs(30))
//!     .build(client);
//!
//! lock.acquire_timeout(Duration::from_secs(5)).await?;
//! // ... work, calling lock.refresh() as a heartbeat ...
//! lock.release().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Without a server
//!
//! ```
//! use depcache::memory::MemoryStore;
//! use depcache::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), CacheError> {
//! let store = MemoryStore::new();
//! let config = RedisConfig::builder().dependency_mode(true).build();
//! let client = Client::with_manager(store.manager(), config).await?;
//!
//! client.set("k", "v", &["t"]).await?;
//! assert_eq!(client.kill_by_dependency(&["t"]).await?, 2);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod dependency;
pub mod error;
pub mod global;
pub mod json;
pub mod lock;
pub mod memory;
pub mod script;

pub use client::Client;
pub use dependency::{DEPEND_PREFIX, KillOutcome, tag_key};
pub use error::{CacheError, CacheResult};
pub use global::{default_client, set_default};
pub use lock::{DistributedLock, LockBuilder};
pub use script::ScriptRegistry;

pub use depcache_redis::{
    Arg, Command, DialOptions, Pool, PoolState, Pooled, RedisConfig, RedisConfigBuilder,
    RedisError, RedisUrl, Reply, Wire,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::lock::{DistributedLock, LockBuilder};
    pub use depcache_redis::{RedisConfig, RedisError};
}
