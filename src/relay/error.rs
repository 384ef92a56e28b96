// Error taxonomy for the relay core.
//
// One enum covers the concern boundaries the relay crosses: the shared
// store, durable message persistence, the inter-instance broker, the wire
// protocol, and bearer-token checking. Callers decide per call site whether
// a failure aborts (persistence during a send) or degrades (membership
// lookup during fan-out).

use std::fmt;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug)]
pub enum RelayError {
    /// Shared presence/membership store operation failed.
    Store(String),
    /// Durable message persistence failed; the send must abort.
    Persist(String),
    /// Inter-instance publish or inbox declaration failed.
    Broker(String),
    /// Collaborator lookup failed (display name, durable membership).
    Collaborator(String),
    /// Malformed or out-of-contract protocol frame.
    Protocol(String),
    /// Bearer credential rejected.
    Auth(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(msg) => write!(f, "store error: {msg}"),
            Self::Persist(msg) => write!(f, "persistence error: {msg}"),
            Self::Broker(msg) => write!(f, "broker error: {msg}"),
            Self::Collaborator(msg) => write!(f, "collaborator error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Auth(msg) => write!(f, "auth error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        Self::Store(e.to_string())
    }
}
