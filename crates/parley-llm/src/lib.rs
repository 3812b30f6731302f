pub mod bridge;
pub mod models;
pub mod provider;
pub mod sse;
pub mod tokenizer;

pub mod mock;

pub use bridge::{BridgeConfig, CompletionBridge, GenerationOutcome, StreamRequest};
pub use mock::{MockBackend, MockResponse};
pub use provider::{OpenAiBackend, OpenAiConfig};
pub use tokenizer::{HeuristicTokenizer, Tokenizer};
