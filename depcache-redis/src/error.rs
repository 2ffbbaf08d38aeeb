//! Redis error types.

use thiserror::Error;

/// Result type for Redis operations.
pub type Result<T> = std::result::Result<T, RedisError>;

/// Broad classification of a [`RedisError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed configuration.
    Configuration,
    /// Dial, read or write failure.
    Transport,
    /// Unexpected reply shape.
    Protocol,
    /// Not-found, pool exhausted, pool closed.
    Semantic,
    /// The server does not know a script digest.
    Script,
}

/// Redis errors.
#[derive(Debug, Error)]
pub enum RedisError {
    /// No URL was configured.
    #[error("missing required parameter: redisURL")]
    MissingUrl,

    /// The URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dialing a new connection failed.
    #[error("Dial failure: {0}")]
    Dial(String),

    /// Connection error (I/O, reset, dropped).
    #[error("Connection error: {0}")]
    Connection(String),

    /// The reply did not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply.
    #[error("Command error: {0}")]
    Command(String),

    /// The server has no script with this digest.
    #[error("NOSCRIPT: no script with digest {0}")]
    NoScript(String),

    /// The server returned a nil reply.
    #[error("redis: nil")]
    Nil,

    /// Every connection slot is in use.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,
}

impl RedisError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingUrl | Self::InvalidUrl(_) | Self::Config(_) => ErrorKind::Configuration,
            Self::Dial(_) | Self::Connection(_) | Self::Timeout => ErrorKind::Transport,
            Self::Protocol(_) | Self::Command(_) => ErrorKind::Protocol,
            Self::Nil | Self::PoolExhausted | Self::PoolClosed => ErrorKind::Semantic,
            Self::NoScript(_) => ErrorKind::Script,
        }
    }

    /// Check if this error is the nil reply of a read that found nothing.
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Dial(_) | Self::Timeout | Self::PoolExhausted
        )
    }

    /// Check if this error indicates connection loss.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Dial(_))
    }

    /// Whether a connection that produced this error must not be reused.
    pub fn discards_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Protocol(_) | Self::Timeout
        )
    }
}

impl From<redis::RedisError> for RedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        if err.is_io_error() {
            return Self::Connection(err.to_string());
        }
        match err.kind() {
            redis::ErrorKind::Server(redis::ServerErrorKind::NoScript) => {
                Self::NoScript(err.to_string())
            }
            _ => Self::Command(err.to_string()),
        }
    }
}

impl From<std::io::Error> for RedisError {
    fn from(err: std::io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_url_message() {
        assert_eq!(
            RedisError::MissingUrl.to_string(),
            "missing required parameter: redisURL"
        );
    }

    #[test]
    fn test_kinds() {
        assert_eq!(RedisError::InvalidUrl("x".into()).kind(), ErrorKind::Configuration);
        assert_eq!(RedisError::Dial("x".into()).kind(), ErrorKind::Transport);
        assert_eq!(RedisError::Protocol("x".into()).kind(), ErrorKind::Protocol);
        assert_eq!(RedisError::Nil.kind(), ErrorKind::Semantic);
        assert_eq!(RedisError::PoolClosed.kind(), ErrorKind::Semantic);
        assert_eq!(RedisError::NoScript("abc".into()).kind(), ErrorKind::Script);
    }

    #[test]
    fn test_discards_connection() {
        assert!(RedisError::Connection("reset".into()).discards_connection());
        assert!(RedisError::Timeout.discards_connection());
        assert!(!RedisError::Nil.discards_connection());
        assert!(!RedisError::Command("WRONGTYPE".into()).discards_connection());
    }

    #[test]
    fn test_noscript_kind_maps_to_noscript() {
        let err = redis::RedisError::from((
            redis::ErrorKind::Server(redis::ServerErrorKind::NoScript),
            "no matching script",
        ));
        assert!(matches!(RedisError::from(err), RedisError::NoScript(_)));
    }

    #[test]
    fn test_noscript_text_in_other_errors_is_a_command_error() {
        let err = redis::RedisError::from((
            redis::ErrorKind::Server(redis::ServerErrorKind::ResponseError),
            "ERR key NOSCRIPT-cache is the wrong kind",
        ));
        assert!(matches!(RedisError::from(err), RedisError::Command(_)));
    }

    #[test]
    fn test_io_error_is_connection_error() {
        let err: RedisError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_connection_error());
        assert!(err.is_retryable());
    }
}
