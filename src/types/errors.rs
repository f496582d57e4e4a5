//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. The
//! variants follow the server's fault taxonomy: protocol faults and I/O
//! faults are connection scoped, `Sink` marks an invariant violation that
//! tears down the whole agent, and `Http` carries an application fault that
//! is answered with an error response.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the server core.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed wire data. Lenient server-mode handlers may keep the
    /// connection, everything else closes it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O errors (always terminal for the connection).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Impossible state: double rent, duplicate correlation id, use of an
    /// uninitialized actor. Fatal to the containing agent.
    #[error("invariant violated: {0}")]
    Sink(String),

    /// Application/domain fault answered with an error status.
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed control frame or broken control channel.
    #[error("control channel error: {0}")]
    Control(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for errors that must propagate to `GrandAgent::abort`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Sink(_))
    }

    /// Status code used when the error is answered on a live tour.
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::Http { status, .. } => *status,
            Error::Protocol(_) => 400,
            Error::Io(_) | Error::Sink(_) | Error::Config(_) | Error::Control(_) => 500,
            Error::Serialization(_) => 500,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn http(status: u16, msg: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn control(msg: impl Into<String>) -> Self {
        Self::Control(msg.into())
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            msg.into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sink_is_fatal() {
        assert!(Error::sink("double rent").is_fatal());
        assert!(!Error::protocol("bad header").is_fatal());
        assert!(!Error::http(404, "missing").is_fatal());
        assert!(!Error::not_connected("gone").is_fatal());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(Error::http(503, "busy").to_http_status(), 503);
        assert_eq!(Error::protocol("x").to_http_status(), 400);
        assert_eq!(Error::sink("x").to_http_status(), 500);
    }
}
