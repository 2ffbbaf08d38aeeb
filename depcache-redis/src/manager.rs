//! Connection factories.

use async_trait::async_trait;
use tracing::debug;

use crate::{Command, DialOptions, RedisConnection, RedisError, RedisUrl, Result, Wire};

/// Creates and checks connections on behalf of a [`Pool`](crate::Pool).
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    /// The connection type handed out by the pool.
    type Connection: Wire + Send + 'static;

    /// Dial a new, ready-to-use connection.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Probe a connection that has been idle for a while.
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Synchronous check run when a connection is returned.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Dials TCP connections to a single destination.
#[derive(Debug, Clone)]
pub struct RedisConnectionManager {
    url: RedisUrl,
    dial: DialOptions,
}

impl RedisConnectionManager {
    /// Create a manager for a parsed destination.
    pub fn new(url: RedisUrl, dial: DialOptions) -> Self {
        Self { url, dial }
    }

    /// Destination of every dial.
    pub fn url(&self) -> &RedisUrl {
        &self.url
    }
}

#[async_trait]
impl ManageConnection for RedisConnectionManager {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<RedisConnection> {
        tokio::time::timeout(self.dial.connect_timeout, self.handshake())
            .await
            .map_err(|_| RedisError::Dial(format!("connect to {} timed out", self.url.address())))?
    }

    async fn is_valid(&self, conn: &mut RedisConnection) -> Result<()> {
        ping(conn).await
    }
}

impl RedisConnectionManager {
    /// Replies are never bounded here; `command_timeout` on the client is
    /// the only per-operation limit.
    fn connection_config(&self) -> redis::AsyncConnectionConfig {
        redis::AsyncConnectionConfig::new()
            .set_connection_timeout(Some(self.dial.connect_timeout))
            .set_response_timeout(None)
    }

    async fn handshake(&self) -> Result<RedisConnection> {
        let client = redis::Client::open(self.url.transport_url())
            .map_err(|e| RedisError::Dial(e.to_string()))?;

        let inner = client
            .get_multiplexed_async_connection_with_config(&self.connection_config())
            .await
            .map_err(|e| RedisError::Dial(e.to_string()))?;

        let mut conn = RedisConnection::new(inner);

        if let Some(password) = self.url.password() {
            conn.request(&Command::new("AUTH").arg(password))
                .await
                .and_then(|reply| reply.expect_ok())
                .map_err(|e| RedisError::Dial(format!("AUTH failed: {e}")))?;
        }

        if let Some(db) = self.url.database() {
            conn.request(&Command::new("SELECT").arg(db))
                .await
                .and_then(|reply| reply.expect_ok())
                .map_err(|e| RedisError::Dial(format!("SELECT {db} failed: {e}")))?;
        }

        if let Some(name) = &self.dial.client_name {
            conn.request(&Command::new("CLIENT").arg("SETNAME").arg(name.as_str()))
                .await
                .and_then(|reply| reply.expect_ok())
                .map_err(|e| RedisError::Dial(format!("CLIENT SETNAME failed: {e}")))?;
        }

        debug!(url = %self.url, "Dialed Redis connection");
        Ok(conn)
    }
}

/// Issue `PING` and require `PONG`.
pub async fn ping<W: Wire + ?Sized>(conn: &mut W) -> Result<()> {
    let reply = conn.request(&Command::new("PING")).await?.into_string()?;
    if reply == "PONG" {
        Ok(())
    } else {
        Err(RedisError::Protocol(format!("unexpected PING reply {reply:?}")))
    }
}
