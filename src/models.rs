use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of content carried by a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Audio,
    File,
}

/// A chat message as it is written to the `messages` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    /// Idempotency key shared by every delivery attempt of this message.
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutgoingMessage {
    /// Build a new text message with fresh id and idempotency key
    pub fn text(conversation_id: &str, sender_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            message_type: MessageType::Text,
            client_id: Uuid::new_v4().to_string(),
            media_url: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_media(mut self, message_type: MessageType, media_url: &str) -> Self {
        self.message_type = message_type;
        self.media_url = Some(media_url.to_string());
        self
    }
}

/// A message waiting in the local queue for another delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    #[serde(flatten)]
    pub message: OutgoingMessage,
    #[serde(default)]
    pub retries: u32,
}

impl QueuedMessage {
    pub fn new(message: OutgoingMessage) -> Self {
        Self { message, retries: 0 }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// Row returned by the backend after a successful insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&OutgoingMessage> for MessageRow {
    fn from(message: &OutgoingMessage) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: Some(message.conversation_id.clone()),
            sender_id: Some(message.sender_id.clone()),
            content: Some(message.content.clone()),
            message_type: Some(message.message_type),
            client_id: Some(message.client_id.clone()),
            media_url: message.media_url.clone(),
            created_at: Some(message.created_at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// One row of the `user_presence` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Connectivity as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub online: bool,
    pub reconnecting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Offline,
    Reconnecting,
}

impl ConnectionState {
    pub const ONLINE: ConnectionState = ConnectionState { online: true, reconnecting: false };
    pub const OFFLINE: ConnectionState = ConnectionState { online: false, reconnecting: false };
    pub const RECONNECTING: ConnectionState = ConnectionState { online: false, reconnecting: true };

    pub fn status(&self) -> ConnectionStatus {
        match (self.online, self.reconnecting) {
            (_, true) => ConnectionStatus::Reconnecting,
            (true, false) => ConnectionStatus::Online,
            (false, false) => ConnectionStatus::Offline,
        }
    }
}
