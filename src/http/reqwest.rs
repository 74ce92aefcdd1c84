use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Method};

use crate::error::LLMError;

use super::{
    DynHttpTransport, HttpBodyStream, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse,
    HttpTransport,
};

/// Default request timeout applied when a request does not carry its own.
///
/// Buffered requests must complete within it. Streams must deliver their response
/// head within it and may then run for as long as the server keeps sending.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Limit on establishing the TCP/TLS connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// reqwest-backed [`HttpTransport`].
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client with [`DEFAULT_CONNECT_TIMEOUT`]. Request limits are applied per
    /// request, so no client-wide total timeout is set.
    pub fn default_client() -> Result<Self, LLMError> {
        Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map(Self::new)
            .map_err(|err| LLMError::unreachable(format!("failed to create reqwest client: {err}")))
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        }
    }

    fn build_request(
        &self,
        mut request: HttpRequest,
        total_timeout: Option<Duration>,
    ) -> Result<reqwest::RequestBuilder, LLMError> {
        let method = Self::method(request.method);
        let mut builder = self.client.request(method, &request.url);

        if let Some(timeout) = total_timeout {
            builder = builder.timeout(timeout);
        }

        for (name, value) in request.headers.drain() {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| LLMError::Validation {
                    message: format!("invalid header name: {err}"),
                })?;
            let header_value = reqwest::header::HeaderValue::from_str(&value).map_err(|err| {
                LLMError::Validation {
                    message: format!("invalid header value for {header_name}: {err}"),
                }
            })?;
            builder = builder.header(header_name, header_value);
        }

        if let Some(body) = request.body.take() {
            builder = builder.body(body);
        }

        Ok(builder)
    }

    fn headers_to_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

fn map_reqwest_error(err: reqwest::Error) -> LLMError {
    if err.is_timeout() {
        LLMError::Timeout {
            message: err.to_string(),
        }
    } else {
        LLMError::unreachable(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        tracing::debug!(url = %request.url, method = ?request.method, "sending request");
        let timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let response = self
            .build_request(request, Some(timeout))?
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(map_reqwest_error)?
            .to_vec();
        tracing::debug!(status, bytes = body.len(), "received response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        tracing::debug!(url = %request.url, "opening stream");
        let head_timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let pending = self.build_request(request, None)?.send();
        let response = tokio::time::timeout(head_timeout, pending)
            .await
            .map_err(|_| LLMError::Timeout {
                message: format!("no stream response within {head_timeout:?}"),
            })?
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(map_reqwest_error));
        let body: HttpBodyStream = Box::pin(stream);

        Ok(HttpStreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Convenience constructor for a shareable reqwest transport.
pub fn default_dyn_transport() -> Result<DynHttpTransport, LLMError> {
    Ok(Arc::new(ReqwestTransport::default_client()?))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::stream::relay;
    use crate::types::SupplierKind;

    /// Serves one connection: reads the request, waits `head_delay`, then writes an
    /// SSE body one event per `gap`.
    async fn serve_once(events: Vec<String>, head_delay: Duration, gap: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(head_delay).await;
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for event in events {
                tokio::time::sleep(gap).await;
                if socket.write_all(event.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
            }
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/v1/chat/completions")
    }

    fn delta_event(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
    }

    #[tokio::test]
    async fn stream_outlives_the_request_timeout() {
        let mut events: Vec<String> = ["a", "b", "c", "d"].iter().map(|t| delta_event(t)).collect();
        events.push("data: [DONE]\n\n".to_string());
        let url = serve_once(events, Duration::ZERO, Duration::from_millis(150)).await;

        let transport = ReqwestTransport::default_client().expect("client");
        let request = HttpRequest::post_json(url, b"{}".to_vec())
            .with_timeout(Some(Duration::from_millis(300)));
        let response = transport.send_stream(request).await.expect("stream head");
        assert_eq!(response.status, 200);

        let text = relay(response.body, SupplierKind::OpenAiLike, |_| {})
            .await
            .expect("full stream");
        assert_eq!(text, "abcd");
    }

    #[tokio::test]
    async fn slow_stream_head_times_out() {
        let url = serve_once(
            vec![delta_event("late")],
            Duration::from_millis(500),
            Duration::ZERO,
        )
        .await;

        let transport = ReqwestTransport::default_client().expect("client");
        let request = HttpRequest::post_json(url, b"{}".to_vec())
            .with_timeout(Some(Duration::from_millis(100)));
        match transport.send_stream(request).await {
            Err(LLMError::Timeout { .. }) => {}
            Err(other) => panic!("unexpected error type: {other:?}"),
            Ok(_) => panic!("expected a timeout"),
        }
    }

    #[tokio::test]
    async fn buffered_request_keeps_its_total_timeout() {
        let url = serve_once(
            vec![delta_event("a"), delta_event("b")],
            Duration::ZERO,
            Duration::from_millis(200),
        )
        .await;

        let transport = ReqwestTransport::default_client().expect("client");
        let request = HttpRequest::post_json(url, b"{}".to_vec())
            .with_timeout(Some(Duration::from_millis(250)));
        let err = transport.send(request).await.expect_err("total timeout");
        assert!(matches!(err, LLMError::Timeout { .. }), "{err:?}");
    }
}
