use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::GatewayError;
use crate::messages::ChatMessage;
use crate::security::ApiKey;
use crate::stream::CompletionChunk;

/// Stream of chunks produced by a backend for one generation.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, GatewayError>> + Send>>;

/// Fully resolved upstream invocation.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model: String,
    /// System prompt first, then the conversation history.
    pub messages: Vec<ChatMessage>,
    /// Already clamped to the model's remaining context budget.
    pub max_tokens: u32,
    pub temperature: f64,
    /// Caller credential; backends fall back to their own default when absent.
    pub api_key: Option<ApiKey>,
}

/// A chunked token-generation backend.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, GatewayError>;
}
