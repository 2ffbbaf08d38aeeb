//! Decoded replies.

use crate::{RedisError, Result};

/// A reply from the store, reduced to the shapes the client consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nil bulk or nil array.
    Nil,
    /// Integer reply.
    Integer(i64),
    /// Bulk string.
    Bulk(Vec<u8>),
    /// Status line such as `OK` or `PONG`.
    Status(String),
    /// Array of replies.
    Array(Vec<Reply>),
}

impl Reply {
    /// Convenience constructor for the `OK` status.
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// Whether this is the nil reply.
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Decode an integer. Numeric bulk strings are accepted.
    pub fn into_int(self) -> Result<i64> {
        match self {
            Reply::Integer(i) => Ok(i),
            Reply::Bulk(b) => std::str::from_utf8(&b)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| RedisError::Protocol("bulk reply is not an integer".into())),
            Reply::Nil => Err(RedisError::Nil),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Decode a boolean from an integer reply (`0` is false).
    pub fn into_bool(self) -> Result<bool> {
        Ok(self.into_int()? != 0)
    }

    /// Decode a bulk or status reply as raw bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Reply::Bulk(b) => Ok(b),
            Reply::Status(s) => Ok(s.into_bytes()),
            Reply::Integer(i) => Ok(i.to_string().into_bytes()),
            Reply::Nil => Err(RedisError::Nil),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    /// Decode a bulk or status reply as UTF-8 text.
    pub fn into_string(self) -> Result<String> {
        let bytes = self.into_bytes()?;
        String::from_utf8(bytes).map_err(|e| RedisError::Protocol(format!("reply is not utf-8: {e}")))
    }

    /// Decode an array of bulk strings. Nil decodes as empty.
    pub fn into_strings(self) -> Result<Vec<String>> {
        match self {
            Reply::Array(items) => items.into_iter().map(Reply::into_string).collect(),
            Reply::Nil => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Decode an array whose elements may be nil (for `HMGET`).
    pub fn into_optional_strings(self) -> Result<Vec<Option<String>>> {
        match self {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Nil => Ok(None),
                    other => other.into_string().map(Some),
                })
                .collect(),
            Reply::Nil => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Decode an array reply.
    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            Reply::Nil => Err(RedisError::Nil),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Require a status reply of `OK`.
    pub fn expect_ok(self) -> Result<()> {
        match self {
            Reply::Status(s) if s.eq_ignore_ascii_case("OK") => Ok(()),
            other => Err(unexpected("OK status", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> RedisError {
    let shape = match got {
        Reply::Nil => "nil",
        Reply::Integer(_) => "integer",
        Reply::Bulk(_) => "bulk string",
        Reply::Status(_) => "status",
        Reply::Array(_) => "array",
    };
    RedisError::Protocol(format!("expected {wanted} reply, got {shape}"))
}

impl TryFrom<redis::Value> for Reply {
    type Error = RedisError;

    fn try_from(value: redis::Value) -> Result<Self> {
        Ok(match value {
            redis::Value::Nil => Reply::Nil,
            redis::Value::Int(i) => Reply::Integer(i),
            redis::Value::BulkString(b) => Reply::Bulk(b),
            redis::Value::SimpleString(s) => Reply::Status(s),
            redis::Value::Okay => Reply::ok(),
            redis::Value::Array(items) => Reply::Array(
                items
                    .into_iter()
                    .map(Reply::try_from)
                    .collect::<Result<Vec<_>>>()?,
            ),
            redis::Value::Set(items) => Reply::Array(
                items
                    .into_iter()
                    .map(Reply::try_from)
                    .collect::<Result<Vec<_>>>()?,
            ),
            other => {
                return Err(RedisError::Protocol(format!(
                    "unsupported reply type: {other:?}"
                )));
            }
        })
    }
}
