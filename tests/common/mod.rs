use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use kagi_llm::LLMError;
use kagi_llm::http::{HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};

/// Replays canned `(status, body)` pairs in order and keeps every request.
pub struct ScriptedTransport {
    responses: Mutex<Vec<(u16, String)>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: &[(u16, &str)]) -> Self {
        Self {
            responses: Mutex::new(
                responses
                    .iter()
                    .rev()
                    .map(|(status, body)| (*status, body.to_string()))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn next(&self, request: HttpRequest) -> Result<(u16, String), LLMError> {
        self.requests.lock().expect("requests lock").push(request);
        self.responses
            .lock()
            .expect("responses lock")
            .pop()
            .ok_or_else(|| LLMError::unreachable("script exhausted"))
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        let (status, body) = self.next(request)?;
        Ok(HttpResponse {
            status,
            headers: HashMap::new(),
            body: body.into_bytes(),
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        let (status, body) = self.next(request)?;
        // Split mid-line so the decoder has to reassemble fragments.
        let bytes = body.into_bytes();
        let chunks: Vec<Result<Vec<u8>, LLMError>> =
            bytes.chunks(7).map(|chunk| Ok(chunk.to_vec())).collect();
        Ok(HttpStreamResponse {
            status,
            headers: HashMap::new(),
            body: Box::pin(stream::iter(chunks)),
        })
    }
}
