use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use serde::Serialize;

use crate::error::LLMError;

/// HTTP methods the backends issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Minimal HTTP request representation shared across backends.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Builds a POST request with a JSON request body.
    ///
    /// # Examples
    ///
    /// ```
    /// use kagi_llm::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(request.method, HttpMethod::Post);
    /// assert_eq!(request.headers.get("Content-Type"), Some(&"application/json".to_string()));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body: Some(body),
            timeout: None,
        }
    }

    /// Builds a body-less GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Merges headers into the request, replacing values with the same name.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Minimal HTTP response representation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts the body into a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::ServiceUnreachable`] when the body is not valid UTF-8, since
    /// that only happens when the transfer itself was mangled.
    pub fn into_string(self) -> Result<String, LLMError> {
        String::from_utf8(self.body).map_err(|err| LLMError::unreachable(err.to_string()))
    }
}

/// HTTP response that carries a streaming body.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

/// Alias for the body stream returned by [`HttpTransport::send_stream`].
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LLMError>> + Send>>;

/// Transport abstraction used to decouple backends from the concrete HTTP client.
///
/// Tests plug in in-memory implementations; production code uses
/// [`reqwest::ReqwestTransport`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and resolves when the full response is available.
    ///
    /// # Errors
    ///
    /// Implementations map connection failures to [`LLMError::ServiceUnreachable`] and
    /// client-side timeouts to [`LLMError::Timeout`]. Non-2xx statuses are not errors at
    /// this layer.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError>;

    /// Sends a request and returns a streaming body.
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, LLMError> {
    serde_json::to_vec(body).map_err(|err| LLMError::Validation {
        message: format!("failed to serialize request: {err}"),
    })
}

/// Serializes a body to JSON, attaches headers, and issues a POST request.
///
/// # Errors
///
/// Returns [`LLMError::Validation`] if serialization fails or forwards the error raised by
/// [`HttpTransport::send`].
pub async fn post_json_with_headers<T: Serialize>(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    body: &T,
    timeout: Option<Duration>,
) -> Result<HttpResponse, LLMError> {
    let request = HttpRequest::post_json(url, encode_body(body)?)
        .with_headers(headers)
        .with_timeout(timeout);
    transport.send(request).await
}

/// Issues a JSON POST request and returns the streaming response.
pub async fn post_json_stream_with_headers<T: Serialize>(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    body: &T,
    timeout: Option<Duration>,
) -> Result<HttpStreamResponse, LLMError> {
    let request = HttpRequest::post_json(url, encode_body(body)?)
        .with_headers(headers)
        .with_timeout(timeout);
    transport.send_stream(request).await
}

/// Issues a GET request with the given headers.
pub async fn get_with_headers(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    timeout: Option<Duration>,
) -> Result<HttpResponse, LLMError> {
    let request = HttpRequest::get(url)
        .with_headers(headers)
        .with_timeout(timeout);
    transport.send(request).await
}

pub mod reqwest;
