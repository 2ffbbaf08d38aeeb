//! Wire client.
//!
//! [`Wire`] is the seam every engine talks to: one command with a typed
//! reply, a pipelined batch, or a `MULTI … EXEC` block. [`RedisConnection`]
//! implements it over a `redis` multiplexed connection.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use crate::{Command, RedisError, Reply, Result};

/// A borrowed connection able to issue commands.
#[async_trait]
pub trait Wire: Send {
    /// Issue one command and read its reply.
    async fn request(&mut self, cmd: &Command) -> Result<Reply>;

    /// Queue every command, then drain and read all replies in order.
    async fn pipeline(&mut self, cmds: &[Command]) -> Result<Vec<Reply>>;

    /// Send `MULTI`, the queued commands, and `EXEC`; return the `EXEC` array.
    async fn transaction(&mut self, cmds: &[Command]) -> Result<Vec<Reply>>;
}

/// A live connection to the store.
#[derive(Debug)]
pub struct RedisConnection {
    inner: MultiplexedConnection,
}

impl RedisConnection {
    /// Wrap an established multiplexed connection.
    pub fn new(inner: MultiplexedConnection) -> Self {
        Self { inner }
    }

    /// Underlying `redis` connection.
    pub fn inner_mut(&mut self) -> &mut MultiplexedConnection {
        &mut self.inner
    }
}

#[async_trait]
impl Wire for RedisConnection {
    async fn request(&mut self, cmd: &Command) -> Result<Reply> {
        let value: redis::Value = cmd.to_redis().query_async(&mut self.inner).await?;
        Reply::try_from(value)
    }

    async fn pipeline(&mut self, cmds: &[Command]) -> Result<Vec<Reply>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for cmd in cmds {
            pipe.add_command(cmd.to_redis());
        }
        let values: Vec<redis::Value> = pipe.query_async(&mut self.inner).await?;
        values.into_iter().map(Reply::try_from).collect()
    }

    async fn transaction(&mut self, cmds: &[Command]) -> Result<Vec<Reply>> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for cmd in cmds {
            pipe.add_command(cmd.to_redis());
        }
        let value: redis::Value = pipe.query_async(&mut self.inner).await?;
        match Reply::try_from(value)? {
            Reply::Array(items) => Ok(items),
            Reply::Nil => Err(RedisError::Command("transaction aborted".into())),
            other => Err(RedisError::Protocol(format!(
                "expected EXEC array, got {other:?}"
            ))),
        }
    }
}
