use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::LLMError;
use crate::http::{
    DynHttpTransport, HttpBodyStream, post_json_stream_with_headers, post_json_with_headers,
};
use crate::types::{CapabilityDescriptor, ChatOptions, Message, Role, SupplierKind};

use super::{ServiceBackend, bearer_headers, ensure_json, ensure_stream, merge_extra};

const DEFAULT_BASE_URL: &str = "https://api-inference.huggingface.co/models";

/// Backend for model-per-URL inference services such as the Hugging Face Inference API.
///
/// Every call posts `{"inputs": ..}` to `{base_url}/{model}`.
pub struct GenericBackend {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) timeout: Option<Duration>,
}

impl GenericBackend {
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            model.trim_start_matches('/')
        )
    }

    async fn post(&self, model: &str, body: &Value) -> Result<Value, LLMError> {
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(model),
            bearer_headers(&self.api_key),
            body,
            self.timeout,
        )
        .await?;
        ensure_json(self.name(), response)
    }
}

/// Flattens a chat history into a single prompt ending with an open assistant turn.
pub(crate) fn render_prompt(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let label = match message.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

/// `{"inputs": .., "parameters": {..}}` text-generation body.
pub(crate) fn build_generation_body(prompt: &str, options: &ChatOptions, stream: bool) -> Value {
    let mut parameters = Map::new();
    if let Some(max_tokens) = options.max_tokens {
        parameters.insert("max_new_tokens".to_string(), Value::from(max_tokens));
    }
    if let Some(temperature) = options.temperature {
        parameters.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(Value::Object(extra)) = options.extra.get("parameters") {
        merge_extra(&mut parameters, extra);
    }

    let mut body = Map::new();
    body.insert("inputs".to_string(), Value::String(prompt.to_string()));
    if !parameters.is_empty() {
        body.insert("parameters".to_string(), Value::Object(parameters));
    }
    for (key, value) in &options.extra {
        if key != "parameters" {
            body.insert(key.clone(), value.clone());
        }
    }
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    Value::Object(body)
}

#[async_trait]
impl ServiceBackend for GenericBackend {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %model))]
    async fn chat_complete(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<Value, LLMError> {
        if messages.is_empty() {
            return Err(LLMError::Validation {
                message: "chat completion requires at least one message".to_string(),
            });
        }
        let body = build_generation_body(&render_prompt(messages), options, false);
        self.post(model, &body).await
    }

    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<HttpBodyStream, LLMError> {
        let body = build_generation_body(&render_prompt(messages), options, true);
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint(model),
            bearer_headers(&self.api_key),
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
        let body = build_generation_body(prompt, options, false);
        self.post(model, &body).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %model))]
    async fn classify(
        &self,
        model: &str,
        inputs: &Value,
        extra: &Map<String, Value>,
    ) -> Result<Value, LLMError> {
        let mut body = Map::new();
        body.insert("inputs".to_string(), inputs.clone());
        merge_extra(&mut body, extra);
        self.post(model, &Value::Object(body)).await
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            supports_chat: true,
            supports_text_completion: true,
            supports_image_generation: false,
            supports_classification: true,
            supports_model_listing: false,
            supports_stream: true,
        }
    }

    fn supplier(&self) -> SupplierKind {
        SupplierKind::Generic
    }

    fn name(&self) -> &'static str {
        "generic"
    }
}
