use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Map, Value};

use crate::error::LLMError;
use crate::http::{DynHttpTransport, HttpBodyStream, HttpResponse, HttpStreamResponse};
use crate::types::{
    CapabilityDescriptor, ChatOptions, ImageOptions, Message, SupplierKind, TokenUsage,
};

pub mod anthropic;
pub(crate) mod error;
pub mod generic;
pub mod openai;

pub use anthropic::AnthropicBackend;
pub use generic::GenericBackend;
pub use openai::OpenAiBackend;

use error::parse_http_error;

/// Sampling temperature sent when the caller does not choose one.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Uniform capability surface implemented by every supplier backend.
///
/// Every operation returns the provider's raw JSON body. Operations a supplier does not
/// offer keep the default implementation and fail with
/// [`LLMError::UnsupportedFeature`].
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Chat-style completion over an ordered message history.
    async fn chat_complete(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<Value, LLMError>;

    /// Streamed chat completion. Yields the raw body once the status is known to be 2xx.
    async fn stream_chat(
        &self,
        _model: &str,
        _messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<HttpBodyStream, LLMError> {
        Err(LLMError::UnsupportedFeature {
            feature: "stream_chat",
        })
    }

    /// Single-prompt text completion.
    async fn text_complete(
        &self,
        _model: &str,
        _prompt: &str,
        _options: &ChatOptions,
    ) -> Result<Value, LLMError> {
        Err(LLMError::UnsupportedFeature {
            feature: "text_complete",
        })
    }

    async fn generate_image(
        &self,
        _prompt: &str,
        _options: &ImageOptions,
    ) -> Result<Value, LLMError> {
        Err(LLMError::UnsupportedFeature {
            feature: "generate_image",
        })
    }

    /// Classification or raw inference against a hosted model.
    async fn classify(
        &self,
        _model: &str,
        _inputs: &Value,
        _extra: &Map<String, Value>,
    ) -> Result<Value, LLMError> {
        Err(LLMError::UnsupportedFeature {
            feature: "classify",
        })
    }

    /// Model identifiers visible to the credential.
    async fn list_models(&self) -> Result<Vec<String>, LLMError> {
        Err(LLMError::UnsupportedFeature {
            feature: "list_models",
        })
    }

    /// Provider-reported token usage in a response body, if any.
    fn usage_from_response(&self, _response: &Value) -> Option<TokenUsage> {
        None
    }

    fn capabilities(&self) -> CapabilityDescriptor;

    fn supplier(&self) -> SupplierKind;

    /// Backend name, such as `openai`.
    fn name(&self) -> &'static str;
}

/// Thread-safe backend handle.
pub type DynBackend = Arc<dyn ServiceBackend>;

/// Connection settings shared by every backend constructor.
#[derive(Debug, Clone, Default)]
pub struct BackendSettings {
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
}

/// Builds the backend matching `supplier`.
pub fn build_backend(
    supplier: SupplierKind,
    transport: DynHttpTransport,
    api_key: impl Into<String>,
    settings: &BackendSettings,
) -> DynBackend {
    let api_key = api_key.into();
    match supplier {
        SupplierKind::OpenAiLike => {
            let mut backend = OpenAiBackend::new(transport, api_key).with_timeout(settings.timeout);
            if let Some(base_url) = &settings.base_url {
                backend = backend.with_base_url(base_url.clone());
            }
            Arc::new(backend)
        }
        SupplierKind::AnthropicLike => {
            let mut backend =
                AnthropicBackend::new(transport, api_key).with_timeout(settings.timeout);
            if let Some(base_url) = &settings.base_url {
                backend = backend.with_base_url(base_url.clone());
            }
            Arc::new(backend)
        }
        SupplierKind::Generic => {
            let mut backend = GenericBackend::new(transport, api_key).with_timeout(settings.timeout);
            if let Some(base_url) = &settings.base_url {
                backend = backend.with_base_url(base_url.clone());
            }
            Arc::new(backend)
        }
    }
}

/// Joins a base URL and a versioned path, tolerating a trailing `/v1` on the base.
pub(crate) fn versioned_endpoint(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/{path}")
    } else {
        format!("{base}/v1/{path}")
    }
}

/// Turns a buffered response into JSON, classifying non-2xx statuses.
pub(crate) fn ensure_json(provider: &'static str, response: HttpResponse) -> Result<Value, LLMError> {
    let status = response.status;
    let headers = response.headers.clone();
    let text = response.into_string()?;
    if !(200..300).contains(&status) {
        return Err(parse_http_error(provider, status, &headers, &text));
    }
    serde_json::from_str(&text).map_err(|err| LLMError::ServiceError {
        provider,
        status,
        message: format!("failed to parse response body: {err}"),
    })
}

/// Passes a 2xx stream through, or drains the body and classifies the error.
pub(crate) async fn ensure_stream(
    provider: &'static str,
    response: HttpStreamResponse,
) -> Result<HttpBodyStream, LLMError> {
    if (200..300).contains(&response.status) {
        return Ok(response.body);
    }
    let mut body = response.body;
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    let text = String::from_utf8_lossy(&bytes);
    Err(parse_http_error(
        provider,
        response.status,
        &response.headers,
        &text,
    ))
}

/// Merges caller-supplied extra fields into a request body.
pub(crate) fn merge_extra(body: &mut Map<String, Value>, extra: &Map<String, Value>) {
    for (key, value) in extra {
        body.insert(key.clone(), value.clone());
    }
}

/// Auth header map for bearer-token APIs.
pub(crate) fn bearer_headers(api_key: &str) -> HashMap<String, String> {
    HashMap::from([
        ("Authorization".to_string(), format!("Bearer {api_key}")),
        ("Accept".to_string(), "application/json".to_string()),
    ])
}

/// Reads `data[].id` (OpenAI and Anthropic) or a bare `models` array.
pub(crate) fn model_ids(body: &Value) -> Vec<String> {
    if let Some(data) = body.get("data").and_then(Value::as_array) {
        return data
            .iter()
            .filter_map(|entry| entry.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
    }
    body.get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|entry| {
                    entry
                        .as_str()
                        .or_else(|| entry.get("id").and_then(Value::as_str))
                })
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
