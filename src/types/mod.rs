//! Shared data structures: chat messages, request options, usage and status snapshots.
//!
//! Responses are deliberately not modeled here. Each backend returns the raw provider
//! JSON and callers pull fields out with [`crate::extract`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a conversation.
///
/// # Examples
///
/// ```
/// use kagi_llm::types::{Message, Role};
///
/// let msg = Message::user("What is Rust?");
/// assert_eq!(msg.role, Role::User);
/// assert!(msg.timestamp.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Creation time, omitted from the wire format when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Builds a message stamped with the current time.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// `{role, content}` object in the shape every chat API accepts.
    pub(crate) fn to_wire(&self) -> Value {
        serde_json::json!({
            "role": self.role.as_str(),
            "content": self.content,
        })
    }
}

/// Sampling and routing options shared by the chat-style operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Overrides the model the handle was built with.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Extra top-level fields merged verbatim into the request body.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl ChatOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Options for the image generation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageOptions {
    pub size: String,
    pub n: u32,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            size: "1024x1024".to_string(),
            n: 1,
            extra: Map::new(),
        }
    }
}

/// Family of HTTP API a service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierKind {
    OpenAiLike,
    AnthropicLike,
    Generic,
}

impl SupplierKind {
    /// Infers the supplier family from a well-known service name.
    ///
    /// ```
    /// use kagi_llm::types::SupplierKind;
    ///
    /// assert_eq!(SupplierKind::for_service("OpenAI"), SupplierKind::OpenAiLike);
    /// assert_eq!(SupplierKind::for_service("huggingface"), SupplierKind::Generic);
    /// ```
    pub fn for_service(service: &str) -> Self {
        match service.to_ascii_lowercase().as_str() {
            "openai" => SupplierKind::OpenAiLike,
            "anthropic" => SupplierKind::AnthropicLike,
            _ => SupplierKind::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SupplierKind::OpenAiLike => "openai_like",
            SupplierKind::AnthropicLike => "anthropic_like",
            SupplierKind::Generic => "generic",
        }
    }
}

/// Token counts attributed to a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `true` when the counts come from the local estimate rather than the provider.
    pub estimated: bool,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Point-in-time view of a service handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub model: String,
    pub supplier: SupplierKind,
    pub initialized: bool,
    pub token_budget: i64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub on_hold: bool,
}

/// Describes which operations a backend implements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub supports_chat: bool,
    pub supports_text_completion: bool,
    pub supports_image_generation: bool,
    pub supports_classification: bool,
    pub supports_model_listing: bool,
    pub supports_stream: bool,
}
