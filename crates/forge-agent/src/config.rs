use serde::{Deserialize, Serialize};
use std::fmt;

/// Which wire protocol a model is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Anthropic Messages API.
    Claude,
    /// OpenAI chat completions API.
    OpenAi,
    /// Local Ollama server through its OpenAI-compatible endpoint. No key.
    Ollama,
}

/// A fully resolved model endpoint, ready to build a backend from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: LlmProvider,
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    pub api_base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    2000
}

impl ModelConfig {
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                LlmProvider::Claude => "https://api.anthropic.com",
                LlmProvider::OpenAi => "https://api.openai.com",
                LlmProvider::Ollama => "http://localhost:11434",
            }
        }
    }
}

/// Capability/cost tier a request is routed to.
///
/// Ordered from cheapest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Local,
    Economic,
    Standard,
    HighPerformance,
}

impl ModelTier {
    /// Every tier, cheapest first.
    pub const ALL: [ModelTier; 4] = [
        ModelTier::Local,
        ModelTier::Economic,
        ModelTier::Standard,
        ModelTier::HighPerformance,
    ];

    /// One step cheaper. `Local` stays `Local`.
    pub fn downgrade(self) -> Self {
        match self {
            ModelTier::HighPerformance => ModelTier::Standard,
            ModelTier::Standard => ModelTier::Economic,
            ModelTier::Economic | ModelTier::Local => ModelTier::Local,
        }
    }

    /// Maps a complexity score in `[0, 1]` to a tier.
    pub fn from_score(score: f64) -> Self {
        if score < 0.3 {
            ModelTier::Local
        } else if score < 0.5 {
            ModelTier::Economic
        } else if score < 0.7 {
            ModelTier::Standard
        } else {
            ModelTier::HighPerformance
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Local => "local",
            ModelTier::Economic => "economic",
            ModelTier::Standard => "standard",
            ModelTier::HighPerformance => "high_performance",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate model inside a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierModel {
    pub provider: LlmProvider,
    pub model_id: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl TierModel {
    fn new(provider: LlmProvider, model_id: &str) -> Self {
        Self {
            provider,
            model_id: model_id.to_string(),
            base_url: None,
        }
    }
}

/// Settings shared by every model in a tier. Models are tried in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub models: Vec<TierModel>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Estimated USD per 1000 tokens.
    pub cost_per_1k_tokens: f64,
}

impl TierConfig {
    /// Resolves this tier's models into backend configs.
    ///
    /// Models whose provider needs a key that is not available are skipped.
    pub fn model_configs(&self, keys: &ApiKeys) -> Vec<ModelConfig> {
        self.models
            .iter()
            .filter_map(|m| {
                let api_key = match m.provider {
                    LlmProvider::OpenAi => keys.openai.clone()?,
                    LlmProvider::Claude => keys.anthropic.clone()?,
                    LlmProvider::Ollama => String::new(),
                };
                Some(ModelConfig {
                    provider: m.provider,
                    model_id: m.model_id.clone(),
                    api_key,
                    api_base_url: m.base_url.clone(),
                    temperature: self.temperature,
                    max_tokens: self.max_tokens,
                })
            })
            .collect()
    }

    /// Cost of `tokens` tokens at this tier's rate.
    pub fn cost_for(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_tokens
    }
}

/// The four tier definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub local: TierConfig,
    pub economic: TierConfig,
    pub standard: TierConfig,
    pub high_performance: TierConfig,
}

impl TierTable {
    pub fn get(&self, tier: ModelTier) -> &TierConfig {
        match tier {
            ModelTier::Local => &self.local,
            ModelTier::Economic => &self.economic,
            ModelTier::Standard => &self.standard,
            ModelTier::HighPerformance => &self.high_performance,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        use LlmProvider::{Claude, Ollama, OpenAi};
        Self {
            high_performance: TierConfig {
                models: vec![
                    TierModel::new(Claude, "claude-3-opus-20240229"),
                    TierModel::new(OpenAi, "gpt-4-turbo-preview"),
                ],
                temperature: 0.1,
                max_tokens: 4000,
                cost_per_1k_tokens: 0.075,
            },
            standard: TierConfig {
                models: vec![
                    TierModel::new(OpenAi, "gpt-4"),
                    TierModel::new(Claude, "claude-3-sonnet-20240229"),
                ],
                temperature: 0.3,
                max_tokens: 2000,
                cost_per_1k_tokens: 0.03,
            },
            economic: TierConfig {
                models: vec![
                    TierModel::new(OpenAi, "gpt-3.5-turbo"),
                    TierModel::new(Claude, "claude-instant-1.2"),
                ],
                temperature: 0.5,
                max_tokens: 1000,
                cost_per_1k_tokens: 0.002,
            },
            local: TierConfig {
                models: vec![
                    TierModel::new(Ollama, "deepseek-coder:33b"),
                    TierModel::new(Ollama, "codellama:34b"),
                    TierModel::new(Ollama, "mixtral:8x7b"),
                ],
                temperature: 0.1,
                max_tokens: 4000,
                cost_per_1k_tokens: 0.0002,
            },
        }
    }
}

/// Provider credentials. Never serialized.
#[derive(Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
}

impl ApiKeys {
    /// Reads `OPENAI_API_KEY` and `ANTHROPIC_API_KEY`. Empty values count as absent.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            openai: read("OPENAI_API_KEY"),
            anthropic: read("ANTHROPIC_API_KEY"),
        }
    }
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeys")
            .field("openai", &self.openai.as_ref().map(|_| "***"))
            .field("anthropic", &self.anthropic.as_ref().map(|_| "***"))
            .finish()
    }
}
