use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationKey, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.sender_id, &self.receiver_id)
    }

    pub fn is_temporary(&self) -> bool {
        self.id.is_temporary()
    }

    /// The participant on the other side of `me`, if `me` took part.
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        if &self.sender_id == me {
            Some(&self.receiver_id)
        } else if &self.receiver_id == me {
            Some(&self.sender_id)
        } else {
            None
        }
    }
}

/// Frames written by the client on the real-time connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    Message {
        #[serde(rename = "receiverId")]
        receiver_id: UserId,
        content: String,
    },
}

/// Frames pushed by the server. Unknown tags fail to decode and are dropped by the reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthSuccess,
    AuthError {
        #[serde(default)]
        message: String,
    },
    NewMessage {
        message: ChatMessage,
    },
    MessageSent {
        message: ChatMessage,
    },
    Typing {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    UserStatusChange {
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "isOnline")]
        is_online: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub user: UserSummary,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsTokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub reaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRequest {
    pub reaction: String,
}
