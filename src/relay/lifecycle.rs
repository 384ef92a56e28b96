// CONNECT/DISCONNECT interception. Every inbound frame passes through
// here before normal dispatch; only these two commands touch the shared
// store, everything else is waved through untouched.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};

use super::collab::RoomDirectory;
use super::error::Result;
use super::stomp::{Command, Frame};
use super::store::{SharedStore, presence_key, room_members_key};

/// What dispatch should do with an intercepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    Forward,
    /// Lifecycle processing failed; the frame is lost, the connection and
    /// every other frame keep flowing.
    Dropped,
}

pub struct LifecycleHandler {
    store: Arc<dyn SharedStore>,
    rooms: Arc<dyn RoomDirectory>,
    instance_id: String,
    presence_ttl: Duration,
}

impl LifecycleHandler {
    pub fn new(
        store: Arc<dyn SharedStore>,
        rooms: Arc<dyn RoomDirectory>,
        instance_id: impl Into<String>,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            store,
            rooms,
            instance_id: instance_id.into(),
            presence_ttl,
        }
    }

    pub async fn intercept(&self, frame: &Frame, user_id: Option<&str>) -> FrameDisposition {
        let outcome = match (&frame.command, user_id) {
            (Command::Connect, Some(user)) => self.on_connect(user).await,
            (Command::Disconnect, Some(user)) => self.on_disconnect(user).await,
            // No resolved identity: nothing to record, frame flows on.
            _ => return FrameDisposition::Forward,
        };
        match outcome {
            Ok(()) => FrameDisposition::Forward,
            Err(e) => {
                error!(
                    "[relay-lifecycle] dropping {} frame for {}: {e}",
                    frame.command.name(),
                    user_id.unwrap_or("<anonymous>"),
                );
                FrameDisposition::Dropped
            }
        }
    }

    /// Record presence on this instance and join the user's durable rooms'
    /// live membership sets.
    pub async fn on_connect(&self, user_id: &str) -> Result<()> {
        self.store
            .set_with_expiry(&presence_key(user_id), &self.instance_id, self.presence_ttl)
            .await?;
        for room_id in self.rooms.durable_rooms_for_user(user_id).await? {
            self.store
                .set_add(&room_members_key(&room_id), user_id)
                .await?;
        }
        debug!("[relay-lifecycle] {user_id} present on {}", self.instance_id);
        Ok(())
    }

    /// Drop presence and leave live membership sets. The presence delete is
    /// unconditional: if the user already reconnected elsewhere, the fresh
    /// entry is lost too and heals on the next CONNECT or by TTL.
    pub async fn on_disconnect(&self, user_id: &str) -> Result<()> {
        self.store.delete(&presence_key(user_id)).await?;
        for room_id in self.rooms.durable_rooms_for_user(user_id).await? {
            self.store
                .set_remove(&room_members_key(&room_id), user_id)
                .await?;
        }
        debug!("[relay-lifecycle] {user_id} left {}", self.instance_id);
        Ok(())
    }
}
