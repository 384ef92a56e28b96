// Out-of-scope collaborators, reduced to the interfaces the relay consumes:
// user display names, durable room membership, and durable message
// persistence. In-memory implementations back tests and standalone runs;
// production wires real stores behind the same traits.

use async_trait::async_trait;
use dashmap::DashMap;

use super::error::{RelayError, Result};
use super::payload::ChatMessageRecord;

/// Messages per history page, matching the history controller's page size.
pub const HISTORY_PAGE_SIZE: usize = 100;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Result<String>;
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Rooms the user is a durable member of (invited/joined, not
    /// necessarily connected).
    async fn durable_rooms_for_user(&self, user_id: &str) -> Result<Vec<String>>;
    async fn durable_room_members(&self, room_id: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one record. Returns the stored record.
    async fn append(&self, record: ChatMessageRecord) -> Result<ChatMessageRecord>;
    /// Page 0 is the newest page; records within a page are oldest-first.
    async fn page(&self, room_id: &str, page: usize) -> Result<Vec<ChatMessageRecord>>;
}

// ---------------------------------------------------------------------------
// In-memory directory
// ---------------------------------------------------------------------------

/// Fixture directory covering both the user and room collaborator roles.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    display_names: DashMap<String, String>,
    room_members: DashMap<String, Vec<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: &str, display_name: &str) {
        self.display_names
            .insert(user_id.to_string(), display_name.to_string());
    }

    pub fn add_room(&self, room_id: &str, members: &[&str]) {
        self.room_members.insert(
            room_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn display_name(&self, user_id: &str) -> Result<String> {
        self.display_names
            .get(user_id)
            .map(|name| name.clone())
            .ok_or_else(|| RelayError::Collaborator(format!("unknown user: {user_id}")))
    }
}

#[async_trait]
impl RoomDirectory for MemoryDirectory {
    async fn durable_rooms_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .room_members
            .iter()
            .filter(|entry| entry.value().iter().any(|m| m == user_id))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn durable_room_members(&self, room_id: &str) -> Result<Vec<String>> {
        Ok(self
            .room_members
            .get(room_id)
            .map(|members| members.clone())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// In-memory message store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    by_room: DashMap<String, Vec<ChatMessageRecord>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, record: ChatMessageRecord) -> Result<ChatMessageRecord> {
        self.by_room
            .entry(record.room_id.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn page(&self, room_id: &str, page: usize) -> Result<Vec<ChatMessageRecord>> {
        let Some(records) = self.by_room.get(room_id) else {
            return Ok(Vec::new());
        };
        let total = records.len();
        // Page 0 ends at the newest record; walk whole pages back from there.
        let end = total.saturating_sub(page * HISTORY_PAGE_SIZE);
        let start = end.saturating_sub(HISTORY_PAGE_SIZE);
        Ok(records[start..end].to_vec())
    }
}
