pub mod claude;
pub mod openai;

use async_trait::async_trait;
use forge_core::{ForgeResult, Message};

/// Text produced by a single completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The model's text output.
    pub text: String,
    /// Prompt plus completion tokens, as reported by the provider.
    pub tokens_used: u64,
    /// Model that actually answered (matters after failover).
    pub model: String,
}

/// Trait for generative completion backends.
///
/// Each provider implements this trait to handle API communication. The
/// orchestrator only ever sees this trait, so tests substitute scripted
/// backends for real ones.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Non-streaming completion.
    async fn complete(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> ForgeResult<Completion>;
}
