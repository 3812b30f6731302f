use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use parley_core::errors::GatewayError;
use parley_core::provider::{ChunkStream, CompletionBackend, CompletionRequest};
use parley_core::stream::CompletionChunk;

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Yield a sequence of chunk results.
    Chunks(Vec<Result<CompletionChunk, GatewayError>>),
    /// Return an error from the stream() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield whatever the test pushes into the channel, ending when it is dropped.
    Channel(mpsc::Receiver<Result<CompletionChunk, GatewayError>>),
    /// Sleep between consecutive chunks.
    Paced(Duration, Vec<CompletionChunk>),
}

impl MockResponse {
    /// Convenience: one chunk per piece, the last carrying `finish_reason = "stop"`.
    pub fn text_chunks(pieces: &[&str]) -> Self {
        let last = pieces.len().saturating_sub(1);
        Self::Chunks(
            pieces
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    Ok(if i == last {
                        CompletionChunk::finished(*p, "stop")
                    } else {
                        CompletionChunk::delta(*p)
                    })
                })
                .collect(),
        )
    }

    /// Convenience: stream some chunks, then fail mid-stream.
    pub fn chunks_then_error(pieces: &[&str], error: GatewayError) -> Self {
        let mut items: Vec<_> = pieces.iter().map(|p| Ok(CompletionChunk::delta(*p))).collect();
        items.push(Err(error));
        Self::Chunks(items)
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock backend that returns pre-programmed responses in sequence.
pub struct MockBackend {
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Upstream invocations received so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let response = self.responses.lock().pop_front().ok_or_else(|| {
            GatewayError::InvalidRequest(format!("MockBackend: no response configured for call {idx}"))
        })?;

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<ChunkStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Chunks(items) => return Ok(Box::pin(stream::iter(items))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
            MockResponse::Channel(rx) => {
                return Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)));
            }
            MockResponse::Paced(interval, chunks) => {
                let paced = stream::iter(chunks).then(move |chunk| async move {
                    tokio::time::sleep(interval).await;
                    Ok(chunk)
                });
                return Ok(Box::pin(paced));
            }
        }
    }
}
