use super::{Completion, LlmBackend};
use crate::config::ModelConfig;
use async_trait::async_trait;
use forge_core::{ForgeError, ForgeResult, Message, Role};
use serde::Serialize;

/// Claude (Anthropic) API backend.
pub struct ClaudeBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl ClaudeBackend {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ClaudeMessage {
    role: &'static str,
    content: String,
}

#[async_trait]
impl LlmBackend for ClaudeBackend {
    async fn complete(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> ForgeResult<Completion> {
        let url = format!("{}/v1/messages", self.config.base_url());

        let api_messages: Vec<ClaudeMessage> = messages
            .iter()
            .filter_map(|m| {
                let role = match m.role {
                    Role::System => return None,
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                Some(ClaudeMessage {
                    role,
                    content: m.content.clone(),
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": api_messages,
        });

        if let Some(sys) = system_prompt {
            body["system"] = serde_json::json!(sys);
        }

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
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
                "Claude API error {status}: {resp_body}"
            )));
        }

        parse_claude_response(&resp_body, &self.config.model_id)
    }
}

/// Joins the text blocks of a Messages API response.
pub fn parse_claude_response(body: &serde_json::Value, model: &str) -> ForgeResult<Completion> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| ForgeError::Agent("Missing content in Claude response".into()))?;

    let text = content
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let tokens_used = body["usage"]["input_tokens"].as_u64().unwrap_or(0)
        + body["usage"]["output_tokens"].as_u64().unwrap_or(0);

    Ok(Completion {
        text,
        tokens_used,
        model: body["model"].as_str().unwrap_or(model).to_string(),
    })
}
