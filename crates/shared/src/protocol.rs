use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AttachmentKind, ChatId, MessageId, UserId},
    store::DocPath,
};

pub const USERS_COLLECTION: &str = "users";
pub const USER_CHATS_COLLECTION: &str = "userchats";
pub const CHATS_COLLECTION: &str = "chats";

pub fn profile_path(user_id: &UserId) -> DocPath {
    DocPath::new(USERS_COLLECTION, user_id.as_str())
}

pub fn user_chats_path(user_id: &UserId) -> DocPath {
    DocPath::new(USER_CHATS_COLLECTION, user_id.as_str())
}

pub fn conversation_path(chat_id: &ChatId) -> DocPath {
    DocPath::new(CHATS_COLLECTION, chat_id.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub blocked: Vec<UserId>,
}

impl UserProfile {
    pub fn new(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            email: String::new(),
            avatar: None,
            blocked: Vec::new(),
        }
    }

    pub fn has_blocked(&self, other: &UserId) -> bool {
        self.blocked.contains(other)
    }
}

/// One owner's replica of a conversation's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub chat_id: ChatId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub is_seen: bool,
    pub updated_at: i64,
}

impl ConversationSummary {
    pub fn new(chat_id: ChatId, receiver_id: UserId, updated_at: i64) -> Self {
        Self {
            chat_id,
            receiver_id,
            last_message: String::new(),
            is_seen: false,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChatsDocument {
    #[serde(default)]
    pub chats: Vec<ConversationSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_kind: Option<AttachmentKind>,
}

impl Message {
    /// Text shown in the conversation list for this message.
    pub fn preview(&self) -> String {
        if !self.text.is_empty() {
            return self.text.clone();
        }
        match (self.attachment_url.as_ref(), self.attachment_kind) {
            (Some(_), Some(AttachmentKind::File)) => "[file]".to_string(),
            (Some(_), _) => "[image]".to_string(),
            (None, _) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDocument {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ConversationDocument {
    pub fn empty(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            messages: Vec::new(),
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
