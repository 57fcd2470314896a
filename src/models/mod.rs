mod requests;
mod responses;

pub use requests::{
    CreateChatRequest, GenerationOptions, PromptMessage, RelayRequest, RenameRequest,
    SaveMessagesRequest, SendRequest,
};
pub use responses::{BackendChunk, ChunkMessage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name given to conversations created without an explicit one, and restored
/// when a conversation is cleared.
pub const DEFAULT_CONVERSATION_NAME: &str = "New chat";

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/// One chat turn as stored on disk and shipped to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: String,
    /// RFC 3339 timestamp, set when the turn is finalized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ROLE_USER.to_string(),
            content: content.into(),
            ts: Some(Utc::now().to_rfc3339()),
            meta: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ROLE_ASSISTANT.to_string(),
            content: content.into(),
            ts: Some(Utc::now().to_rfc3339()),
            meta: None,
        }
    }
}

/// Latency metadata recorded on assistant replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Milliseconds from request start to the first received fragment.
    #[serde(rename = "ttfbMs", skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<f64>,
    /// Milliseconds from request start to stream completion.
    #[serde(rename = "totalMs", skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<f64>,
}

/// One persisted chat session: a record file keyed by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Listing row kept in the index file, denormalized for fast enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}
