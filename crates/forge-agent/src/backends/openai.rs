use super::{Completion, LlmBackend};
use crate::config::ModelConfig;
use async_trait::async_trait;
use forge_core::{ForgeError, ForgeResult, Message, Role};

/// OpenAI-compatible API backend.
///
/// Works with OpenAI and with Ollama's OpenAI-compatible endpoint.
pub struct OpenAiBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn build_messages(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();

        if let Some(sys) = system_prompt {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }

        for m in messages {
            let role = match m.role {
                Role::System => continue,
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            api_messages.push(serde_json::json!({
                "role": role,
                "content": m.content
            }));
        }

        api_messages
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> ForgeResult<Completion> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());

        let body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": self.build_messages(system_prompt, messages),
        });

        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json");
        if !self.config.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let resp = request
            .json(&body)
            .send()
            .await
            .map_err(|e| ForgeError::Http(e.to_string()))?;

        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ForgeError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(ForgeError::Http(format!(
                "OpenAI API error {status}: {resp_body}"
            )));
        }

        parse_openai_response(&resp_body, &self.config.model_id)
    }
}

/// Extracts the first choice's text and the token usage.
pub fn parse_openai_response(body: &serde_json::Value, model: &str) -> ForgeResult<Completion> {
    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ForgeError::Agent("Missing choices[0].message.content in response".into()))?;

    let tokens_used = body["usage"]["total_tokens"].as_u64().unwrap_or_else(|| {
        body["usage"]["prompt_tokens"].as_u64().unwrap_or(0)
            + body["usage"]["completion_tokens"].as_u64().unwrap_or(0)
    });

    Ok(Completion {
        text: text.to_string(),
        tokens_used,
        model: body["model"].as_str().unwrap_or(model).to_string(),
    })
}
