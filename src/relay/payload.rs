// JSON payloads crossing the relay's boundaries: inbound sends, durable
// message records, delivery payloads, and the envelopes exchanged between
// instances through the per-instance inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Destination clients subscribe to for direct chat delivery.
pub const CHAT_QUEUE_DESTINATION: &str = "/user/queue/chat";

/// Destination clients publish chat sends to.
pub const CHAT_SEND_DESTINATION: &str = "/app/chat";

/// Fixed notification text attached to every AI completion event.
pub const AI_COMPLETION_TEXT: &str = "AI 응답이 완료되었습니다";

/// Broadcast destination for one user's AI completion events.
pub fn ai_response_destination(user_id: &str) -> String {
    format!("/topic/ai-response.{user_id}")
}

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Message categories. `Ai` originates from the completion notifier;
/// the rest arrive in client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Join,
    Chat,
    Leave,
    Text,
    Image,
    File,
    Ai,
}

// ---------------------------------------------------------------------------
// Inbound send
// ---------------------------------------------------------------------------

/// Body of a SEND frame to `/app/chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSend {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub room_id: String,
    #[serde(default)]
    pub content: Option<String>,
}

// ---------------------------------------------------------------------------
// Durable record
// ---------------------------------------------------------------------------

/// Append-only chat message record, ordered by creation time per room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRecord {
    pub id: Uuid,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

impl ChatMessageRecord {
    pub fn new(
        room_id: &str,
        sender_id: &str,
        sender_name: &str,
        message: &str,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            message: message.to_string(),
            kind,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery payload
// ---------------------------------------------------------------------------

/// Payload delivered to a client's private queue or broadcast topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub room_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub content: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatPayload {
    pub fn from_record(record: &ChatMessageRecord) -> Self {
        Self {
            kind: record.kind,
            room_id: Some(record.room_id.clone()),
            sender_id: Some(record.sender_id.clone()),
            sender_name: Some(record.sender_name.clone()),
            content: Some(record.message.clone()),
            timestamp: Some(record.created_at),
        }
    }
}

/// Body broadcast on `/topic/ai-response.{userId}` when a user's AI
/// result completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiNotification {
    pub user_id: String,
    pub result_id: String,
    pub message: String,
}

impl AiNotification {
    pub fn new(user_id: &str, result_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            result_id: result_id.to_string(),
            message: AI_COMPLETION_TEXT.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Inter-instance envelopes
// ---------------------------------------------------------------------------

/// Everything published to a per-instance inbox. Tagged so one inbox
/// carries both chat fan-out and AI completion traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RelayEnvelope {
    Chat {
        #[serde(rename = "userIds")]
        user_ids: Vec<String>,
        chat: ChatPayload,
    },
    Ai {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "resultId")]
        result_id: String,
        message: String,
    },
}
