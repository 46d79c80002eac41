use crate::backends::claude::ClaudeBackend;
use crate::backends::openai::OpenAiBackend;
use crate::backends::LlmBackend;
use crate::config::{ApiKeys, LlmProvider, ModelConfig, ModelTier, TierTable};
use crate::failover::{FailoverBackend, RetryPolicy};
use forge_core::{ForgeError, ForgeResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Builds a backend for a single resolved model.
pub fn backend_for(config: ModelConfig) -> Box<dyn LlmBackend> {
    match config.provider {
        LlmProvider::Claude => Box::new(ClaudeBackend::new(config)),
        LlmProvider::OpenAi | LlmProvider::Ollama => Box::new(OpenAiBackend::new(config)),
    }
}

/// Hands out the backend serving a tier.
///
/// The orchestrator depends on this trait rather than on concrete providers so
/// tests can plug in scripted backends.
pub trait BackendFactory: Send + Sync {
    /// The backend for `tier`, or an error if the tier has no usable model.
    fn backend(&self, tier: ModelTier) -> ForgeResult<Arc<dyn LlmBackend>>;
}

/// Default factory: one [`FailoverBackend`] per tier over the tier's models,
/// skipping models whose provider key is missing.
pub struct ProviderBackendFactory {
    backends: HashMap<ModelTier, Arc<dyn LlmBackend>>,
}

impl ProviderBackendFactory {
    pub fn new(tiers: &TierTable, keys: &ApiKeys, policy: RetryPolicy) -> Self {
        let mut backends: HashMap<ModelTier, Arc<dyn LlmBackend>> = HashMap::new();
        for tier in ModelTier::ALL {
            let models: Vec<Box<dyn LlmBackend>> = tiers
                .get(tier)
                .model_configs(keys)
                .into_iter()
                .map(backend_for)
                .collect();
            let count = models.len();
            match FailoverBackend::new(models, policy.clone()) {
                Ok(failover) => {
                    info!(tier = %tier, models = count, "Tier backend ready");
                    backends.insert(tier, Arc::new(failover));
                }
                Err(_) => warn!(tier = %tier, "No usable model for tier (missing API keys?)"),
            }
        }
        Self { backends }
    }

    /// Tiers that have at least one usable model.
    pub fn available_tiers(&self) -> Vec<ModelTier> {
        let mut tiers: Vec<_> = self.backends.keys().copied().collect();
        tiers.sort();
        tiers
    }
}

impl BackendFactory for ProviderBackendFactory {
    fn backend(&self, tier: ModelTier) -> ForgeResult<Arc<dyn LlmBackend>> {
        self.backends
            .get(&tier)
            .cloned()
            .ok_or_else(|| ForgeError::Config(format!("no usable model configured for tier '{tier}'")))
    }
}
