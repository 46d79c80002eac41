//! Generative completion backends for Forge.
//!
//! Models are grouped into [`ModelTier`]s; each tier is served by a
//! [`FailoverBackend`] over its models in preference order. Providers speak
//! either the OpenAI chat completions API (OpenAI, Ollama) or the Anthropic
//! Messages API.

pub mod backends;
pub mod config;
pub mod failover;
pub mod llm;

pub use backends::{Completion, LlmBackend};
pub use config::{ApiKeys, LlmProvider, ModelConfig, ModelTier, TierConfig, TierModel, TierTable};
pub use failover::{FailoverBackend, RetryPolicy};
pub use llm::{backend_for, BackendFactory, ProviderBackendFactory};
