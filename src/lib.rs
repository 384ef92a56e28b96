//! Multi-instance chat relay: STOMP over WebSocket in front, a shared
//! presence store and per-instance inboxes behind, so any instance can
//! accept a connection and still reach users parked on its peers.

pub mod relay;

pub use relay::error::{RelayError, Result};
pub use relay::server::{RelayConfig, RelayNode};
