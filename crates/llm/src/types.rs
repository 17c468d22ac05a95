use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token usage reported by a provider. Zero when the vendor does not
/// report usage on the chosen path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One entry of the provider settings store: where to send requests and
/// with which credentials. `api_key` may be empty for local providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
}

impl ProviderSettings {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

/// A fully assembled upstream request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: 4096,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Which model produced an assistant message. Attached when a completion
/// finishes so the record survives provider switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            meta: None,
        }
    }

    pub fn parts(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            content: MessageContent::Parts(parts),
            meta: None,
        }
    }

    /// The concatenated text of the message, ignoring non-text parts.
    pub fn text_content(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A piece of a multimodal message.
///
/// `ImageRef` is the persisted form: an opaque handle into the image
/// store. Binary data is only inlined (`Image`) while building the
/// upstream request and never written back to conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageRef { reference: String },
    Image { media_type: String, data: String },
}

/// A completed non-streaming response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// Errors from provider communication, classified so callers can pick a
/// recovery policy instead of string-matching vendor messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),
    #[error("Service overloaded: {0}")]
    Overloaded(String),
    #[error("Service error: {0}")]
    ServiceError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Stream closed unexpectedly: {0}")]
    StreamClosed(String),
    #[error("Unknown error: {0}")]
    Unknown(String),
}
