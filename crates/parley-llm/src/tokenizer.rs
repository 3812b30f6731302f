/// Counts tokens for prompt budgeting.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Roughly four bytes per token. Used when no vocabulary file is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to load tokenizer from {path}: {detail}")]
pub struct TokenizerLoadError {
    pub path: String,
    pub detail: String,
}

/// Vocabulary-backed tokenizer loaded from a HuggingFace `tokenizer.json`.
#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenizer {
    pub fn from_file(path: &std::path::Path) -> Result<Self, TokenizerLoadError> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| TokenizerLoadError {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self { inner })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl Tokenizer for HfTokenizer {
    fn count(&self, text: &str) -> usize {
        match self.inner.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(e) => {
                tracing::debug!(error = %e, "tokenizer encode failed, using estimate");
                HeuristicTokenizer.count(text)
            }
        }
    }
}

/// Load the configured tokenizer, falling back to the heuristic when no path is given.
pub fn load(path: Option<&std::path::Path>) -> Result<std::sync::Arc<dyn Tokenizer>, TokenizerLoadError> {
    match path {
        None => Ok(std::sync::Arc::new(HeuristicTokenizer)),
        #[cfg(feature = "hf-tokenizer")]
        Some(path) => Ok(std::sync::Arc::new(HfTokenizer::from_file(path)?)),
        #[cfg(not(feature = "hf-tokenizer"))]
        Some(path) => Err(TokenizerLoadError {
            path: path.display().to_string(),
            detail: "built without the hf-tokenizer feature".into(),
        }),
    }
}
