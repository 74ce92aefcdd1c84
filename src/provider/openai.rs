use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::LLMError;
use crate::http::{
    DynHttpTransport, HttpBodyStream, get_with_headers, post_json_stream_with_headers,
    post_json_with_headers,
};
use crate::types::{
    CapabilityDescriptor, ChatOptions, ImageOptions, Message, SupplierKind, TokenUsage,
};

use super::{
    DEFAULT_TEMPERATURE, ServiceBackend, bearer_headers, ensure_json, ensure_stream, merge_extra,
    model_ids, versioned_endpoint,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_COMPLETION_TOKENS: u32 = 100;

/// Backend for OpenAI and OpenAI-compatible endpoints.
pub struct OpenAiBackend {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) organization: Option<String>,
    pub(crate) timeout: Option<Duration>,
}

impl OpenAiBackend {
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            organization: None,
            timeout: None,
        }
    }

    /// Points the backend at a proxy or compatible server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
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
        let mut headers = bearer_headers(&self.api_key);
        if let Some(org) = &self.organization {
            headers.insert("OpenAI-Organization".to_string(), org.clone());
        }
        headers
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

/// Builds a `/chat/completions` body.
pub(crate) fn build_chat_body(
    model: &str,
    messages: &[Message],
    options: &ChatOptions,
    stream: bool,
) -> Result<Value, LLMError> {
    if messages.is_empty() {
        return Err(LLMError::Validation {
            message: "chat completion requires at least one message".to_string(),
        });
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert(
        "messages".to_string(),
        Value::Array(messages.iter().map(Message::to_wire).collect()),
    );
    body.insert(
        "temperature".to_string(),
        Value::from(options.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
    );
    if let Some(max_tokens) = options.max_tokens {
        body.insert("max_tokens".to_string(), Value::from(max_tokens));
    }
    merge_extra(&mut body, &options.extra);
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }
    Ok(Value::Object(body))
}

fn build_completion_body(model: &str, prompt: &str, options: &ChatOptions) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert("prompt".to_string(), Value::String(prompt.to_string()));
    body.insert(
        "temperature".to_string(),
        Value::from(options.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
    );
    body.insert(
        "max_tokens".to_string(),
        Value::from(options.max_tokens.unwrap_or(DEFAULT_COMPLETION_TOKENS)),
    );
    merge_extra(&mut body, &options.extra);
    Value::Object(body)
}

fn build_image_body(prompt: &str, options: &ImageOptions) -> Value {
    let mut body = Map::new();
    body.insert("prompt".to_string(), Value::String(prompt.to_string()));
    body.insert("size".to_string(), Value::String(options.size.clone()));
    body.insert("n".to_string(), Value::from(options.n));
    merge_extra(&mut body, &options.extra);
    Value::Object(body)
}

#[async_trait]
impl ServiceBackend for OpenAiBackend {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %model))]
    async fn chat_complete(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<Value, LLMError> {
        let body = build_chat_body(model, messages, options, false)?;
        self.post("chat/completions", &body).await
    }

    async fn stream_chat(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<HttpBodyStream, LLMError> {
        let body = build_chat_body(model, messages, options, true)?;
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint("chat/completions"),
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
        let body = build_completion_body(model, prompt, options);
        self.post("completions", &body).await
    }

    async fn generate_image(&self, prompt: &str, options: &ImageOptions) -> Result<Value, LLMError> {
        let body = build_image_body(prompt, options);
        self.post("images/generations", &body).await
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
        let input = usage.get("prompt_tokens").and_then(Value::as_u64);
        let output = usage.get("completion_tokens").and_then(Value::as_u64);
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
            supports_image_generation: true,
            supports_classification: false,
            supports_model_listing: true,
            supports_stream: true,
        }
    }

    fn supplier(&self) -> SupplierKind {
        SupplierKind::OpenAiLike
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::http::HttpMethod;
    use crate::provider::testing::RecordingTransport;

    #[test]
    fn chat_body_applies_defaults_and_extra_fields() {
        let messages = vec![Message::system("be brief"), Message::user("hi")];
        let options = ChatOptions::default()
            .with_max_tokens(64)
            .with_extra("top_p", json!(0.9));
        let body = build_chat_body("gpt-4o-mini", &messages, &options, true).expect("body");

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["stream"], true);
        assert!((body["temperature"].as_f64().expect("temperature") - 0.7).abs() < 1e-6);
    }

    #[test]
    fn chat_body_requires_messages() {
        let err = build_chat_body("gpt-4o", &[], &ChatOptions::default(), false)
            .expect_err("empty history");
        assert!(matches!(err, LLMError::Validation { .. }));
    }

    #[tokio::test]
    async fn chat_complete_posts_with_bearer_auth() {
        let transport = Arc::new(RecordingTransport::new(vec![(
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}],"usage":{"prompt_tokens":5,"completion_tokens":1}}"#,
        )]));
        let backend = OpenAiBackend::new(transport.clone(), "sk-test");

        let response = backend
            .chat_complete("gpt-4o", &[Message::user("hi")], &ChatOptions::default())
            .await
            .expect("response");
        assert_eq!(response["choices"][0]["message"]["content"], "hello");

        let requests = transport.requests();
        assert_eq!(requests[0].url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            requests[0].headers.get("Authorization").map(String::as_str),
            Some("Bearer sk-test")
        );

        let usage = backend.usage_from_response(&response).expect("usage");
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 1);
        assert!(!usage.estimated);
    }

    #[tokio::test]
    async fn image_and_completion_endpoints() {
        let transport = Arc::new(RecordingTransport::new(vec![
            (200, r#"{"data":[{"url":"https://img"}]}"#),
            (200, r#"{"choices":[{"text":"world"}]}"#),
        ]));
        let backend =
            OpenAiBackend::new(transport.clone(), "sk-test").with_base_url("http://local/v1");

        backend
            .generate_image("a cat", &ImageOptions::default())
            .await
            .expect("image");
        assert_eq!(
            transport.last_body(),
            json!({"prompt": "a cat", "size": "1024x1024", "n": 1})
        );

        backend
            .text_complete("gpt-3.5-turbo-instruct", "hello", &ChatOptions::default())
            .await
            .expect("completion");
        let body = transport.last_body();
        assert_eq!(body["max_tokens"], 100);

        let urls: Vec<_> = transport.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(
            urls,
            vec![
                "http://local/v1/images/generations".to_string(),
                "http://local/v1/completions".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn list_models_uses_get() {
        let transport = Arc::new(RecordingTransport::new(vec![(
            200,
            r#"{"object":"list","data":[{"id":"gpt-4o"}]}"#,
        )]));
        let backend = OpenAiBackend::new(transport.clone(), "sk-test");
        let models = backend.list_models().await.expect("models");
        assert_eq!(models, vec!["gpt-4o".to_string()]);
        assert_eq!(transport.requests()[0].method, HttpMethod::Get);
    }

    #[tokio::test]
    async fn unauthorized_status_is_typed() {
        let transport = Arc::new(RecordingTransport::new(vec![(
            401,
            r#"{"error":{"message":"Incorrect API key provided","code":"invalid_api_key"}}"#,
        )]));
        let backend = OpenAiBackend::new(transport, "bad");
        let err = backend
            .chat_complete("gpt-4o", &[Message::user("hi")], &ChatOptions::default())
            .await
            .expect_err("401");
        assert!(matches!(err, LLMError::Unauthorized { .. }));
    }
}
