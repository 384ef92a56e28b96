// One live client connection: id, resolved identity, subscriptions, and
// the handshake state machine. A session object exists from transport
// accept until close; reconnecting always mints a new id.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use uuid::Uuid;

use super::error::{RelayError, Result};

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Connected,
}

const STATE_DISCONNECTED: u8 = 0;
const STATE_HANDSHAKING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

#[derive(Debug)]
pub struct Session {
    id: String,
    state: AtomicU8,
    user_id: OnceLock<String>,
    subscriptions: DashMap<String, String>,
    last_activity_ms: AtomicU64,
}

impl Session {
    /// Fresh session in the handshaking state.
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            state: AtomicU8::new(STATE_HANDSHAKING),
            user_id: OnceLock::new(),
            subscriptions: DashMap::new(),
            last_activity_ms: AtomicU64::new(epoch_ms()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            STATE_HANDSHAKING => SessionState::Handshaking,
            STATE_CONNECTED => SessionState::Connected,
            _ => SessionState::Disconnected,
        }
    }

    /// User identity resolved at CONNECT; `None` for anonymous sessions.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(String::as_str)
    }

    /// Handshaking -> Connected. Fails on repeated CONNECT or on a session
    /// that already ended.
    pub fn mark_connected(&self, user_id: Option<&str>) -> Result<()> {
        self.state
            .compare_exchange(
                STATE_HANDSHAKING,
                STATE_CONNECTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|current| match current {
                STATE_CONNECTED => RelayError::Protocol("session already connected".into()),
                _ => RelayError::Protocol("session already closed".into()),
            })?;
        if let Some(user) = user_id {
            let _ = self.user_id.set(user.to_string());
        }
        Ok(())
    }

    /// Terminal transition. Idempotent; returns whether this call ended a
    /// live session.
    pub fn mark_disconnected(&self) -> bool {
        self.state.swap(STATE_DISCONNECTED, Ordering::AcqRel) != STATE_DISCONNECTED
    }

    pub fn subscribe(&self, destination: &str, subscription_id: &str) {
        self.subscriptions
            .insert(destination.to_string(), subscription_id.to_string());
    }

    pub fn subscription_id(&self, destination: &str) -> Option<String> {
        self.subscriptions.get(destination).map(|id| id.clone())
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(epoch_ms(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(epoch_ms().saturating_sub(last))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
