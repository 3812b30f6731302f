//! Turns one chat request into a sequence of client-facing progress events.
//!
//! The bridge owns prompt accounting: it counts prompt tokens, clamps the
//! requested completion length to what the model's context window still
//! allows, and prices every emitted snapshot from the model rate table.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use parley_core::errors::GatewayError;
use parley_core::ids::ConnectionId;
use parley_core::messages::{ChatMessage, Role};
use parley_core::provider::{CompletionBackend, CompletionRequest};
use parley_core::security::ApiKey;
use parley_core::stream::{CompletionChunk, StreamEvent};

use crate::models::{self, ModelInfo};
use crate::tokenizer::Tokenizer;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful and concise assistant.";

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Context window assumed for models missing from the rate table.
    pub fallback_context_window: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fallback_context_window: 4_096,
        }
    }
}

/// A validated chat message from the client, ready for upstream dispatch.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Text the assistant reply continues from; prepended to every snapshot.
    pub continuation: String,
    pub api_key: Option<ApiKey>,
}

/// How a generation ended.
#[derive(Debug)]
pub enum GenerationOutcome {
    /// Terminal event with a finish reason was delivered.
    Finished { finish_reason: String },
    /// Terminal error event was delivered.
    Failed(GatewayError),
    /// The event queue closed before the generation ended.
    Abandoned,
}

pub struct CompletionBridge {
    backend: Arc<dyn CompletionBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    config: BridgeConfig,
}

impl CompletionBridge {
    pub fn new(backend: Arc<dyn CompletionBackend>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self::with_config(backend, tokenizer, BridgeConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn CompletionBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            config,
        }
    }

    pub fn model_info(&self, model: &str) -> ModelInfo {
        models::find_model(model)
            .copied()
            .unwrap_or_else(|| ModelInfo::unpriced(self.config.fallback_context_window))
    }

    /// Tokens consumed by the system prompt plus every message's role and content.
    pub fn prompt_tokens(&self, system_prompt: &str, messages: &[ChatMessage]) -> u32 {
        let mut total = self.tokenizer.count(Role::System.as_str()) + self.tokenizer.count(system_prompt);
        for message in messages {
            total += self.tokenizer.count(&message.content);
            total += self.tokenizer.count(message.role.as_str());
        }
        u32::try_from(total).unwrap_or(u32::MAX)
    }

    /// Stream one generation into `events`. Exactly one terminal event is
    /// sent unless the receiver goes away first.
    #[instrument(skip_all, fields(connection_id = %id, model = %request.model))]
    pub async fn run(
        &self,
        id: ConnectionId,
        request: StreamRequest,
        events: &mpsc::Sender<StreamEvent>,
    ) -> GenerationOutcome {
        let model = self.model_info(&request.model);
        let system_prompt = if request.system_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            request.system_prompt
        };

        let prompt_tokens = self.prompt_tokens(&system_prompt, &request.messages);
        let budget = model.remaining_budget(prompt_tokens);
        let max_tokens = request.max_tokens.min(budget);
        if max_tokens < request.max_tokens {
            debug!(
                requested = request.max_tokens,
                forwarded = max_tokens,
                prompt_tokens,
                context_window = model.context_window,
                "clamped max_tokens to remaining context"
            );
        }

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(request.messages);

        let upstream = CompletionRequest {
            model: request.model,
            messages,
            max_tokens,
            temperature: request.temperature,
            api_key: request.api_key,
        };

        let mut progress = Progress::new(id, &request.continuation, prompt_tokens, model);

        let mut chunks = match self.backend.stream(&upstream).await {
            Ok(chunks) => chunks,
            Err(e) => return fail(progress, e, events).await,
        };

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    let event = progress.advance(chunk);
                    let finish_reason = event.finish_reason.clone();
                    if events.send(event).await.is_err() {
                        return GenerationOutcome::Abandoned;
                    }
                    if let Some(finish_reason) = finish_reason {
                        debug!(
                            %finish_reason,
                            completion_tokens = progress.completion_tokens,
                            "generation finished"
                        );
                        return GenerationOutcome::Finished { finish_reason };
                    }
                }
                Err(e) => return fail(progress, e, events).await,
            }
        }

        fail(
            progress,
            GatewayError::StreamInterrupted("upstream ended without a finish reason".into()),
            events,
        )
        .await
    }
}

async fn fail(progress: Progress, error: GatewayError, events: &mpsc::Sender<StreamEvent>) -> GenerationOutcome {
    warn!(error_kind = error.error_kind(), error = %error, "generation failed");
    let event = progress.failure(&error);
    if events.send(event).await.is_err() {
        return GenerationOutcome::Abandoned;
    }
    GenerationOutcome::Failed(error)
}

/// Running totals for one generation.
struct Progress {
    id: ConnectionId,
    prefix: String,
    text: String,
    prompt_tokens: u32,
    completion_tokens: u32,
    model: ModelInfo,
}

impl Progress {
    fn new(id: ConnectionId, continuation: &str, prompt_tokens: u32, model: ModelInfo) -> Self {
        let prefix = if continuation.is_empty() {
            String::new()
        } else {
            format!("{continuation} ")
        };
        Self {
            id,
            prefix,
            text: String::new(),
            prompt_tokens,
            completion_tokens: 0,
            model,
        }
    }

    fn advance(&mut self, chunk: CompletionChunk) -> StreamEvent {
        self.text.push_str(&chunk.delta);
        // One per chunk, not the chunk's true token count.
        self.completion_tokens += 1;
        self.snapshot(chunk.finish_reason)
    }

    fn snapshot(&self, finish_reason: Option<String>) -> StreamEvent {
        StreamEvent {
            id: self.id.clone(),
            role: Role::Assistant,
            message: format!("{}{}", self.prefix, self.text),
            finish_reason,
            cost_tokens_completion: self.completion_tokens,
            cost_tokens_prompt: self.prompt_tokens,
            cost_usd: self.model.calculate_cost(self.prompt_tokens, self.completion_tokens),
            error: None,
        }
    }

    fn failure(&self, error: &GatewayError) -> StreamEvent {
        StreamEvent {
            error: Some(error.to_string()),
            ..self.snapshot(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockResponse};
    use crate::tokenizer::HeuristicTokenizer;

    fn setup(responses: Vec<MockResponse>) -> (CompletionBridge, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new(responses));
        let bridge = CompletionBridge::new(backend.clone(), Arc::new(HeuristicTokenizer));
        (bridge, backend)
    }

    fn request(model: &str, max_tokens: u32) -> StreamRequest {
        StreamRequest {
            system_prompt: String::new(),
            messages: vec![ChatMessage::user("Tell me a joke")],
            model: model.into(),
            max_tokens,
            temperature: 1.0,
            continuation: String::new(),
            api_key: None,
        }
    }

    async fn collect(
        bridge: &CompletionBridge,
        request: StreamRequest,
    ) -> (Vec<StreamEvent>, GenerationOutcome) {
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = bridge.run(ConnectionId::from_raw("conn_test"), request, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, outcome)
    }

    #[tokio::test]
    async fn message_grows_by_concatenation() {
        let (bridge, _) = setup(vec![MockResponse::text_chunks(&["Why ", "did ", "the ", "crab?"])]);
        let (events, outcome) = collect(&bridge, request("gpt-4", 100)).await;

        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["Why ", "Why did ", "Why did the ", "Why did the crab?"]);
        assert!(events[..3].iter().all(|e| e.finish_reason.is_none()));
        assert_eq!(events[3].finish_reason.as_deref(), Some("stop"));
        assert!(matches!(outcome, GenerationOutcome::Finished { finish_reason } if finish_reason == "stop"));
    }

    #[tokio::test]
    async fn completion_tokens_count_chunks_and_cost_follows() {
        let (bridge, _) = setup(vec![MockResponse::text_chunks(&["a", "bb", "ccc"])]);
        let (events, _) = collect(&bridge, request("gpt-4", 100)).await;

        let prompt = bridge.prompt_tokens(DEFAULT_SYSTEM_PROMPT, &[ChatMessage::user("Tell me a joke")]);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.cost_tokens_completion, i as u32 + 1);
            assert_eq!(event.cost_tokens_prompt, prompt);
            let expected = models::GPT_4.calculate_cost(prompt, i as u32 + 1);
            assert!((event.cost_usd - expected).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn continuation_prefix_gets_one_space() {
        let (bridge, _) = setup(vec![MockResponse::text_chunks(&["over", " the lazy dog"])]);
        let mut req = request("gpt-4", 100);
        req.continuation = "The quick fox jumped".into();
        let (events, _) = collect(&bridge, req).await;
        assert_eq!(events[0].message, "The quick fox jumped over");
        assert_eq!(events[1].message, "The quick fox jumped over the lazy dog");
    }

    #[tokio::test]
    async fn max_tokens_clamped_to_remaining_context() {
        let (bridge, backend) = setup(vec![MockResponse::text_chunks(&["ok"])]);
        let req = request("gpt-4", 0);
        let prompt = bridge.prompt_tokens(DEFAULT_SYSTEM_PROMPT, &req.messages);
        let limit = models::GPT_4.context_window;

        let req = StreamRequest {
            max_tokens: limit - prompt + 50,
            ..req
        };
        collect(&bridge, req).await;
        assert_eq!(backend.last_request().unwrap().max_tokens, limit - prompt);
    }

    #[tokio::test]
    async fn max_tokens_within_budget_passes_through() {
        let (bridge, backend) = setup(vec![MockResponse::text_chunks(&["ok"])]);
        collect(&bridge, request("gpt-4", 256)).await;
        assert_eq!(backend.last_request().unwrap().max_tokens, 256);
    }

    #[tokio::test]
    async fn upstream_request_starts_with_system_prompt() {
        let (bridge, backend) = setup(vec![MockResponse::text_chunks(&["ok"])]);
        let mut req = request("gpt-4", 10);
        req.system_prompt = "Answer in French.".into();
        collect(&bridge, req).await;
        let sent = backend.last_request().unwrap();
        assert_eq!(sent.messages[0], ChatMessage::system("Answer in French."));
        assert_eq!(sent.messages[1], ChatMessage::user("Tell me a joke"));

        let (bridge, backend) = setup(vec![MockResponse::text_chunks(&["ok"])]);
        collect(&bridge, request("gpt-4", 10)).await;
        assert_eq!(
            backend.last_request().unwrap().messages[0].content,
            DEFAULT_SYSTEM_PROMPT
        );
    }

    #[tokio::test]
    async fn open_failure_yields_single_error_event() {
        let (bridge, _) = setup(vec![MockResponse::Error(GatewayError::AuthenticationFailed(
            "no API key configured".into(),
        ))]);
        let (events, outcome) = collect(&bridge, request("gpt-4", 10)).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].error.as_deref().unwrap().contains("no API key"));
        assert!(events[0].finish_reason.is_none());
        assert!(matches!(outcome, GenerationOutcome::Failed(GatewayError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn mid_stream_error_keeps_last_snapshot() {
        let (bridge, _) = setup(vec![MockResponse::chunks_then_error(
            &["par", "tial"],
            GatewayError::ProviderOverloaded,
        )]);
        let (events, outcome) = collect(&bridge, request("gpt-4", 10)).await;
        assert_eq!(events.len(), 3);
        let last = &events[2];
        assert_eq!(last.message, "partial");
        assert_eq!(last.cost_tokens_completion, 2);
        assert_eq!(last.error.as_deref(), Some("provider overloaded"));
        assert!(matches!(outcome, GenerationOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn stream_ending_without_finish_reason_is_an_error() {
        let (bridge, _) = setup(vec![MockResponse::Chunks(vec![Ok(CompletionChunk::delta("cut"))])]);
        let (events, outcome) = collect(&bridge, request("gpt-4", 10)).await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_error());
        assert!(matches!(outcome, GenerationOutcome::Failed(GatewayError::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn unknown_model_is_free_with_fallback_window() {
        let backend = Arc::new(MockBackend::new(vec![MockResponse::text_chunks(&["x"])]));
        let bridge = CompletionBridge::with_config(
            backend.clone(),
            Arc::new(HeuristicTokenizer),
            BridgeConfig {
                fallback_context_window: 100,
            },
        );
        let (events, _) = collect(&bridge, request("local-llama", 5_000)).await;
        assert_eq!(events[0].cost_usd, 0.0);
        let prompt = events[0].cost_tokens_prompt;
        assert_eq!(backend.last_request().unwrap().max_tokens, 100 - prompt);
    }

    #[tokio::test]
    async fn closed_queue_abandons_generation() {
        let (bridge, _) = setup(vec![MockResponse::text_chunks(&["a", "b"])]);
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let outcome = bridge.run(ConnectionId::from_raw("conn_gone"), request("gpt-4", 10), &tx).await;
        assert!(matches!(outcome, GenerationOutcome::Abandoned));
    }
}
