//! # depcache Redis transport
//!
//! The plumbing underneath `depcache`: destination URL parsing, typed
//! commands and replies, a wire client over `redis`, and a bounded
//! connection pool with lazy dialing, idle eviction and health probing.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use depcache_redis::{Command, Pool, RedisConfig, RedisConnectionManager, RedisUrl, Wire};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::builder()
//!         .url("redis://localhost:6379/0")
//!         .max_active(10)
//!         .build();
//!
//!     let url = RedisUrl::parse(&config.url)?;
//!     let manager = RedisConnectionManager::new(url, config.dial.clone());
//!     let pool = Pool::new(manager, config.pool_config());
//!
//!     let mut conn = pool.get().await?;
//!     conn.request(&Command::new("SET").arg("key").arg("value")).await?;
//!
//!     Ok(())
//! }
//! ```

mod command;
mod config;
mod error;
mod manager;
mod pool;
mod reply;
mod redis_url;
mod wire;

pub use command::{Arg, Command};
pub use config::{DialOptions, RedisConfig, RedisConfigBuilder};
pub use error::{ErrorKind, RedisError, Result};
pub use manager::{ManageConnection, RedisConnectionManager, ping};
pub use pool::{Pool, PoolConfig, PoolState, Pooled};
pub use reply::Reply;
pub use redis_url::{DEFAULT_PORT, RedisUrl};
pub use wire::{RedisConnection, Wire};

// Re-export redis crate for convenience
pub use redis;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::command::{Arg, Command};
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::error::{RedisError, Result};
    pub use crate::pool::{Pool, Pooled};
    pub use crate::reply::Reply;
    pub use crate::wire::Wire;
}
