//! Destination URL parsing.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::{RedisError, Result};

/// Port used when the URL does not carry one.
pub const DEFAULT_PORT: u16 = 6379;

/// A parsed `redis://[user[:password]@]host:port[/database]` URL.
///
/// The user part is accepted but ignored; authentication uses the password
/// only.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisUrl {
    host: String,
    port: u16,
    password: Option<String>,
    database: Option<i64>,
}

impl RedisUrl {
    /// Parse a destination URL.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RedisError::MissingUrl);
        }

        let url = Url::parse(input).map_err(|e| RedisError::InvalidUrl(format!("{input}: {e}")))?;
        if url.scheme() != "redis" {
            return Err(RedisError::InvalidUrl(format!(
                "unsupported scheme {:?}, expected redis://",
                url.scheme()
            )));
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.trim_matches(|c| c == '[' || c == ']').to_string(),
            _ => return Err(RedisError::InvalidUrl(format!("{input}: missing host"))),
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let password = match url.password() {
            Some(raw) if !raw.is_empty() => Some(
                percent_decode_str(raw)
                    .decode_utf8()
                    .map_err(|e| RedisError::InvalidUrl(format!("password is not utf-8: {e}")))?
                    .into_owned(),
            ),
            _ => None,
        };

        let segment = url.path().trim_matches('/');
        let database = if segment.is_empty() {
            None
        } else {
            let db = segment
                .parse::<i64>()
                .map_err(|_| RedisError::InvalidUrl(format!("invalid database {segment:?}")))?;
            Some(db)
        };

        Ok(Self {
            host,
            port,
            password,
            database,
        })
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Password to authenticate with, if any.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Database to select after connecting, if any.
    pub fn database(&self) -> Option<i64> {
        self.database
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Bare URL used to open the transport; credentials and database are
    /// applied by the dialer with explicit commands.
    pub fn transport_url(&self) -> String {
        format!("redis://{}/", self.address())
    }
}

impl fmt::Display for RedisUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("redis://")?;
        if self.password.is_some() {
            f.write_str(":***@")?;
        }
        f.write_str(&self.address())?;
        if let Some(db) = self.database {
            write!(f, "/{db}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RedisUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisUrl")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}
