use serde::{Deserialize, Serialize};

use super::Message;

/// Body of `POST /api/chat`, forwarded upstream with `stream: true` added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub options: GenerationOptions,
}

/// Sampling options passed to the backend verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

/// Role/content pair as the backend expects it; storage-only fields stripped.
#[derive(Debug, Serialize)]
pub struct PromptMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

impl<'a> From<&'a Message> for PromptMessage<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            role: &message.role,
            content: &message.content,
        }
    }
}

/// Body of `POST /api/chats`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateChatRequest {
    pub name: Option<String>,
}

/// Body of `POST /api/chats/:id`.
#[derive(Debug, Default, Deserialize)]
pub struct RenameRequest {
    pub name: Option<String>,
}

/// Body of `POST /api/chats/:id/messages`.
#[derive(Debug, Default, Deserialize)]
pub struct SaveMessagesRequest {
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Body of `POST /api/chats/:id/send`.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub message: String,
}
