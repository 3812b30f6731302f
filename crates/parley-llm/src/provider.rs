use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use serde_json::json;
use tracing::instrument;

use parley_core::errors::GatewayError;
use parley_core::provider::{ChunkStream, CompletionBackend, CompletionRequest};
use parley_core::security::ApiKey;
use parley_core::stream::CompletionChunk;

use crate::sse::{self, SseFrame};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection settings for an OpenAI-compatible chat-completions endpoint.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub base_url: String,
    /// Used when the client does not supply its own key.
    pub default_api_key: Option<ApiKey>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_api_key: None,
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }
}

pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, request: &CompletionRequest) -> Result<reqwest::RequestBuilder, GatewayError> {
        let key = request
            .api_key
            .as_ref()
            .or(self.config.default_api_key.as_ref())
            .ok_or_else(|| GatewayError::AuthenticationFailed("no API key configured".into()))?;

        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        });

        Ok(self
            .client
            .post(self.endpoint())
            .bearer_auth(key.expose())
            .header("accept", "text/event-stream")
            .json(&body))
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, request), fields(model = %request.model, max_tokens = request.max_tokens))]
    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, GatewayError> {
        let req = self.build_request(request)?;

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.config.connect_timeout)
            } else {
                GatewayError::NetworkError(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_response(status, body, retry_after));
        }

        let stream = SseStream::with_idle_timeout(resp.bytes_stream(), self.config.idle_timeout);
        Ok(Box::pin(stream))
    }
}

/// Wraps a byte stream from reqwest and yields completion chunks.
/// Includes an idle timeout: if no data arrives within `idle_duration`, emits an error.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    /// Raw bytes of the event still being received; decoded once complete
    /// so multi-byte characters split across reads stay intact.
    buffer: Vec<u8>,
    pending: VecDeque<Result<CompletionChunk, GatewayError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn absorb_bytes(&mut self, raw: &[u8]) {
        match std::str::from_utf8(raw) {
            Ok(text) => self.absorb(text),
            Err(_) => self.absorb(&String::from_utf8_lossy(raw)),
        }
    }

    fn absorb(&mut self, raw: &str) {
        for data in sse::parse_sse_lines(raw) {
            if self.finished {
                return;
            }
            match sse::parse_data(&data) {
                Some(SseFrame::Chunk(chunk)) => self.pending.push_back(Ok(chunk)),
                Some(SseFrame::Error(e)) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                }
                Some(SseFrame::Done) => self.finished = true,
                None => {}
            }
        }
    }
}

fn find_event_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

impl Stream for SseStream {
    type Item = Result<CompletionChunk, GatewayError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if let Some(item) = self.pending.pop_front() {
            return std::task::Poll::Ready(Some(item));
        }
        if self.finished {
            return std::task::Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    self.buffer.extend_from_slice(&bytes);
                    while let Some(pos) = find_event_end(&self.buffer) {
                        let event: Vec<u8> = self.buffer.drain(..pos + 2).collect();
                        self.absorb_bytes(&event);
                    }

                    if let Some(item) = self.pending.pop_front() {
                        return std::task::Poll::Ready(Some(item));
                    }
                    if self.finished {
                        return std::task::Poll::Ready(None);
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return std::task::Poll::Ready(Some(Err(GatewayError::StreamInterrupted(
                        e.to_string(),
                    ))));
                }
                std::task::Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.absorb_bytes(&remaining);
                    }
                    self.finished = true;
                    return std::task::Poll::Ready(self.pending.pop_front());
                }
                std::task::Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return std::task::Poll::Ready(Some(Err(GatewayError::StreamInterrupted(
                            format!("idle timeout after {}s", self.idle_duration.as_secs()),
                        ))));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}
