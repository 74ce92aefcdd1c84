//! Streamed responses: SSE line decoding and the fragment relay.
//!
//! Fragments arrive as arbitrary byte chunks. [`StreamDecoder`] reassembles them into
//! SSE events and [`relay`] turns each event into a text delta for the caller.

use std::collections::VecDeque;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::types::SupplierKind;

/// SSE event yielded by [`StreamDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Raw `data:` payload emitted by the provider.
    Data(String),
    /// Terminal marker reported via `[DONE]`.
    Done,
}

/// Reassembles a chunked body into [`StreamEvent`] values.
///
/// Besides regular SSE framing, bare JSON lines (newline-delimited JSON, as sent by some
/// inference servers) are treated as complete events.
pub struct StreamDecoder {
    body: HttpBodyStream,
    buffer: Vec<u8>,
    data_lines: Vec<Vec<u8>>,
    pending: VecDeque<StreamEvent>,
    stream_closed: bool,
    done_received: bool,
}

impl StreamDecoder {
    pub fn new(body: HttpBodyStream) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            data_lines: Vec::new(),
            pending: VecDeque::new(),
            stream_closed: false,
            done_received: false,
        }
    }

    fn handle_line(&mut self, line: Vec<u8>) {
        if let Some(rest) = line.strip_prefix(b"data:") {
            let data = rest.strip_prefix(b" ").unwrap_or(rest);
            self.data_lines.push(data.to_vec());
        } else if line.first() == Some(&b'{') {
            self.flush_event();
            self.data_lines.push(line);
            self.flush_event();
        }
    }

    fn flush_event(&mut self) {
        if self.data_lines.is_empty() {
            return;
        }

        let joined = self.data_lines.drain(..).collect::<Vec<_>>().join(&b'\n');
        if joined.is_empty() {
            return;
        }

        let data = match String::from_utf8(joined) {
            Ok(data) => data,
            Err(err) => {
                tracing::debug!(error = %err, "skipping non UTF-8 stream event");
                return;
            }
        };

        if data.trim() == "[DONE]" {
            if !self.done_received {
                self.done_received = true;
                self.pending.push_back(StreamEvent::Done);
            }
        } else {
            self.pending.push_back(StreamEvent::Data(data));
        }
    }

    fn drain_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        buffer.iter().position(|b| *b == b'\n').map(|pos| {
            let mut line: Vec<u8> = buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            line
        })
    }
}

impl Stream for StreamDecoder {
    type Item = Result<StreamEvent, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }

        if this.done_received {
            return Poll::Ready(None);
        }

        loop {
            if this.stream_closed {
                if !this.buffer.is_empty() {
                    let line = std::mem::take(&mut this.buffer);
                    this.handle_line(line);
                }
                this.flush_event();
                return Poll::Ready(this.pending.pop_front().map(Ok));
            }

            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    while let Some(line) = Self::drain_line(&mut this.buffer) {
                        if line.is_empty() {
                            this.flush_event();
                        } else {
                            this.handle_line(line);
                        }
                    }
                    if let Some(event) = this.pending.pop_front() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => this.stream_closed = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Decodes one event payload into the text delta it carries.
///
/// Returns `Ok(None)` for events without text (role announcements, pings, stop
/// markers) and for payloads that are not JSON.
///
/// # Errors
///
/// [`LLMError::ServiceError`] when the provider reports an error inside the stream.
pub fn decode_delta(supplier: SupplierKind, data: &str) -> Result<Option<String>, LLMError> {
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        tracing::debug!(supplier = supplier.as_str(), "skipping unparseable stream event");
        return Ok(None);
    };

    if let Some(error) = event.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(LLMError::ServiceError {
            provider: supplier.as_str(),
            status: 200,
            message,
        });
    }

    let delta = match supplier {
        SupplierKind::OpenAiLike => event
            .pointer("/choices/0/delta/content")
            .or_else(|| event.pointer("/choices/0/text")),
        SupplierKind::AnthropicLike => match event.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => event.pointer("/delta/text"),
            Some("completion") | None => event.get("completion"),
            Some(_) => None,
        },
        SupplierKind::Generic => {
            let special = event
                .pointer("/token/special")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if special {
                None
            } else {
                event.pointer("/token/text")
            }
        }
    };

    Ok(delta
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string))
}

/// Relays a streamed response to `handler`, one text delta at a time.
///
/// Deltas are delivered in arrival order and also accumulated; the full text is
/// returned once the stream ends or a `[DONE]` marker arrives. Events that cannot be
/// decoded are skipped.
///
/// # Errors
///
/// Transport errors raised by the body stream and in-stream provider errors.
pub async fn relay<F>(
    fragments: HttpBodyStream,
    supplier: SupplierKind,
    mut handler: F,
) -> Result<String, LLMError>
where
    F: FnMut(&str),
{
    let mut decoder = StreamDecoder::new(fragments);
    let mut text = String::new();
    let mut deltas = 0usize;

    while let Some(event) = decoder.next().await {
        match event? {
            StreamEvent::Done => break,
            StreamEvent::Data(data) => {
                if let Some(delta) = decode_delta(supplier, &data)? {
                    handler(&delta);
                    text.push_str(&delta);
                    deltas += 1;
                }
            }
        }
    }

    tracing::debug!(
        supplier = supplier.as_str(),
        deltas,
        chars = text.len(),
        "stream relay finished"
    );
    Ok(text)
}

/// Handler that writes each delta to stdout as it arrives.
pub fn print_handler() -> impl FnMut(&str) {
    |delta: &str| {
        let mut stdout = std::io::stdout().lock();
        // A closed stdout must not abort the relay.
        let _ = stdout.write_all(delta.as_bytes());
        let _ = stdout.flush();
    }
}
