/// Context size and per-token pricing for an upstream chat model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelInfo {
    pub name: &'static str,
    pub context_window: u32,
    pub prompt_cost_per_token: f64,
    pub completion_cost_per_token: f64,
}

impl ModelInfo {
    /// Zero-rate entry for models missing from the table.
    pub fn unpriced(context_window: u32) -> Self {
        Self {
            name: "unknown",
            context_window,
            prompt_cost_per_token: 0.0,
            completion_cost_per_token: 0.0,
        }
    }

    pub fn calculate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        prompt_tokens as f64 * self.prompt_cost_per_token
            + completion_tokens as f64 * self.completion_cost_per_token
    }

    /// Largest completion the model can still produce after `prompt_tokens`.
    pub fn remaining_budget(&self, prompt_tokens: u32) -> u32 {
        self.context_window.saturating_sub(prompt_tokens)
    }
}

pub static GPT_4: ModelInfo = ModelInfo {
    name: "gpt-4",
    context_window: 8_192,
    prompt_cost_per_token: 0.000_03,
    completion_cost_per_token: 0.000_06,
};

pub static GPT_4_32K: ModelInfo = ModelInfo {
    name: "gpt-4-32k",
    context_window: 32_768,
    prompt_cost_per_token: 0.000_06,
    completion_cost_per_token: 0.000_12,
};

pub static GPT_4O: ModelInfo = ModelInfo {
    name: "gpt-4o",
    context_window: 128_000,
    prompt_cost_per_token: 0.000_002_5,
    completion_cost_per_token: 0.000_01,
};

pub static GPT_35_TURBO: ModelInfo = ModelInfo {
    name: "gpt-3.5-turbo",
    context_window: 4_096,
    prompt_cost_per_token: 0.000_001_5,
    completion_cost_per_token: 0.000_002,
};

pub static GPT_35_TURBO_16K: ModelInfo = ModelInfo {
    name: "gpt-3.5-turbo-16k",
    context_window: 16_384,
    prompt_cost_per_token: 0.000_003,
    completion_cost_per_token: 0.000_004,
};

static ALL_MODELS: &[&ModelInfo] = &[
    &GPT_4,
    &GPT_4_32K,
    &GPT_4O,
    &GPT_35_TURBO,
    &GPT_35_TURBO_16K,
];

pub fn find_model(name: &str) -> Option<&'static ModelInfo> {
    ALL_MODELS.iter().find(|m| m.name == name).copied()
}

pub fn all_models() -> &'static [&'static ModelInfo] {
    ALL_MODELS
}
