use std::pin::Pin;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::Stream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{BackendChunk, PromptMessage, RelayRequest};

/// Terminal warning emitted when the upstream connection drops mid-stream.
pub const WARN_STREAMING: &str = "⚠️ streaming error.";

/// Incremental text fragments from one streaming completion. Consumed once,
/// front to back; every exit path terminates the stream cleanly.
pub type FragmentStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The backend could not be reached at all.
    #[error("inference backend unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    /// The backend answered, but with a non-success status.
    #[error("inference backend returned {status}: {detail}")]
    Status { status: u16, detail: String },
}

/// Seam between the controller/routes and the inference backend, so tests can
/// substitute a scripted stream for a live server.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn open(
        &self,
        request: &RelayRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, RelayError>;
}

/// Bridges the backend's newline-delimited JSON chat protocol into a flat
/// text stream. Protocol-level trouble becomes inline `⚠️` fragments; only a
/// failure to open the stream at all surfaces as an error.
pub struct StreamRelay {
    base_url: String,
    client: reqwest::Client,
}

impl StreamRelay {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait]
impl ChatBackend for StreamRelay {
    async fn open(
        &self,
        request: &RelayRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, RelayError> {
        // Storage-only fields (timestamps, latency metadata) stay out of the
        // prompt the backend sees.
        let prompt: Vec<PromptMessage> = request.messages.iter().map(PromptMessage::from).collect();
        let body = serde_json::json!({
            "model": request.model,
            "messages": prompt,
            "options": request.options,
            "stream": true,
        });

        let response = self
            .client
            .post(self.chat_url())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RelayError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        Ok(fragment_stream(response.bytes_stream(), cancel))
    }
}

/// Output of one decoded protocol line.
#[derive(Debug, PartialEq)]
pub(crate) enum LineEvent {
    Fragment(String),
    Done,
}

/// Buffers raw bytes and extracts complete newline-terminated JSON lines.
///
/// Splitting on `\n` is safe mid-chunk: UTF-8 continuation bytes never equal
/// 0x0A, so a multi-byte character split across chunk boundaries stays in the
/// buffer until its line completes.
#[derive(Default)]
pub(crate) struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<LineEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            decode_line(line.trim(), &mut events);
        }
        events
    }
}

/// One candidate line: empty lines and non-JSON noise are dropped, explicit
/// backend errors become visibly marked fragments, content passes through
/// verbatim, and `done` ends the stream.
fn decode_line(line: &str, events: &mut Vec<LineEvent>) {
    if line.is_empty() {
        return;
    }
    let Ok(chunk) = serde_json::from_str::<BackendChunk>(line) else {
        // Interleaved transport noise, not fatal.
        return;
    };
    if let Some(error) = chunk.error {
        events.push(LineEvent::Fragment(format!("⚠️ {error}")));
        return;
    }
    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            events.push(LineEvent::Fragment(message.content));
        }
    }
    if chunk.done {
        events.push(LineEvent::Done);
    }
}

/// Turns a raw NDJSON byte stream into text fragments. Reading stops at the
/// `done` line even when more lines sit in the buffer; a transport failure
/// emits one terminal warning instead of an error; cancellation ends the
/// stream between reads.
pub(crate) fn fragment_stream<S, B, E>(byte_stream: S, cancel: CancellationToken) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
{
    let stream = stream! {
        let mut decoder = NdjsonDecoder::default();
        let mut byte_stream = Box::pin(byte_stream);

        'read: loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break 'read,
                chunk = byte_stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                // Upstream closed without a done flag.
                break;
            };
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(bytes.as_ref()) {
                        match event {
                            LineEvent::Fragment(text) => yield text,
                            LineEvent::Done => break 'read,
                        }
                    }
                }
                Err(_) => {
                    yield WARN_STREAMING.to_string();
                    break;
                }
            }
        }
    };
    Box::pin(stream)
}
