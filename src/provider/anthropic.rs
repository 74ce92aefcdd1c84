use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::LLMError;
use crate::http::{
    DynHttpTransport, HttpBodyStream, get_with_headers, post_json_stream_with_headers,
    post_json_with_headers,
};
use crate::types::{CapabilityDescriptor, ChatOptions, Message, Role, SupplierKind, TokenUsage};

use super::{
    DEFAULT_TEMPERATURE, ServiceBackend, ensure_json, ensure_stream, merge_extra, model_ids,
    versioned_endpoint,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_VERSION: &str = "2023-06-01";
/// `max_tokens` is mandatory on the Messages API.
const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Backend for the Anthropic Messages API and compatible proxies.
pub struct AnthropicBackend {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) version: String,
    pub(crate) timeout: Option<Duration>,
}

impl AnthropicBackend {
    /// Creates a backend with the default base URL and `anthropic-version`.
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            version: DEFAULT_VERSION.to_string(),
            timeout: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the `anthropic-version` header.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        versioned_endpoint(&self.base_url, path)
    }

    fn build_headers(&self) -> HashMap<String, String> {
        HashMap::from([
            ("x-api-key".to_string(), self.api_key.clone()),
            ("Accept".to_string(), "application/json".to_string()),
            ("anthropic-version".to_string(), self.version.clone()),
        ])
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, LLMError> {
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(path),
            self.build_headers(),
            body,
            self.timeout,
        )
        .await?;
        ensure_json(self.name(), response)
    }
}

/// Builds a `/v1/messages` body. System messages are folded into the top-level
/// `system` field; the remaining turns keep their order.
pub(crate) fn build_messages_body(
    model: &str,
    messages: &[Message],
    options: &ChatOptions,
    stream: bool,
) -> Result<Value, LLMError> {
    let mut system_texts = Vec::new();
    let mut turns = Vec::new();
    for message in messages {
        match message.role {
            Role::System => system_texts.push(message.content.as_str()),
            Role::User | Role::Assistant => turns.push(message.to_wire()),
        }
    }

    if turns.is_empty() {
        return Err(LLMError::Validation {
            message: "Anthropic Messages request requires at least one user/assistant message"
                .to_string(),
        });
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert("messages".to_string(), Value::Array(turns));
    body.insert(
        "max_tokens".to_string(),
        Value::from(options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    body.insert(
        "temperature".to_string(),
        Value::from(options.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
    );
    if !system_texts.is_empty() {
        body.insert(
            "system".to_string(),
            Value::String(system_texts.join("\n\n")),
        );
    }
    merge_extra(&mut body, &options.extra);
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    Ok(Value::Object(body))
}

/// Wraps a prompt in the `Human:`/`Assistant:` framing of the legacy completion API.
pub(crate) fn legacy_prompt(prompt: &str) -> String {
    let mut framed = if prompt.starts_with("\n\nHuman: ") {
        prompt.to_string()
    } else {
        format!("\n\nHuman: {prompt}")
    };
    if !framed.contains("\n\nAssistant: ") {
        framed.push_str("\n\nAssistant: ");
    }
    framed
}

#[async_trait]
impl ServiceBackend for AnthropicBackend {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %model))]
    async fn chat_complete(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<Value, LLMError> {
        let body = build_messages_body(model, messages, options, false)?;
        self.post("messages", &body).await
    }

    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<HttpBodyStream, LLMError> {
        let body = build_messages_body(model, messages, options, true)?;
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint("messages"),
            self.build_headers(),
            &body,
            self.timeout,
        )
        .await?;
        ensure_stream(self.name(), response).await
    }

    async fn text_complete(
        &self,
        model: &str,
        prompt: &str,
        options: &ChatOptions,
    ) -> Result<Value, LLMError> {
        let mut body = Map::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert("prompt".to_string(), Value::String(legacy_prompt(prompt)));
        body.insert(
            "max_tokens_to_sample".to_string(),
            Value::from(options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        body.insert(
            "temperature".to_string(),
            Value::from(options.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
        );
        merge_extra(&mut body, &options.extra);
        self.post("complete", &Value::Object(body)).await
    }

    async fn list_models(&self) -> Result<Vec<String>, LLMError> {
        let response = get_with_headers(
            self.transport.as_ref(),
            self.endpoint("models"),
            self.build_headers(),
            self.timeout,
        )
        .await?;
        let body = ensure_json(self.name(), response)?;
        Ok(model_ids(&body))
    }

    fn usage_from_response(&self, response: &Value) -> Option<TokenUsage> {
        let usage = response.get("usage")?;
        let input = usage.get("input_tokens").and_then(Value::as_u64);
        let output = usage.get("output_tokens").and_then(Value::as_u64);
        if input.is_none() && output.is_none() {
            return None;
        }
        Some(TokenUsage {
            input_tokens: input.unwrap_or(0),
            output_tokens: output.unwrap_or(0),
            estimated: false,
        })
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            supports_chat: true,
            supports_text_completion: true,
            supports_image_generation: false,
            supports_classification: false,
            supports_model_listing: true,
            supports_stream: true,
        }
    }

    fn supplier(&self) -> SupplierKind {
        SupplierKind::AnthropicLike
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
