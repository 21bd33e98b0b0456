use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::CompletionConfig;
use crate::services::question::TextCompletionProvider;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

/// OpenAI-compatible `/v1/chat/completions` endpoint (llama.cpp server and friends).
#[derive(Clone)]
pub struct HttpCompletionProvider {
    client: Client,
    config: CompletionConfig,
}

impl HttpCompletionProvider {
    /// `timeout` is the per-question budget; the HTTP client gets twice that
    /// so the renderer's own timeout is what fires first.
    pub fn new(config: &CompletionConfig, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout.saturating_mul(2).max(Duration::from_secs(1)))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config: CompletionConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config.clone()
            },
        }
    }
}

/// Prior exchanges go in the system message, the instruction in the user message.
fn build_messages<'a>(system: &'a str, prompt: &'a str) -> Vec<ChatMessage<'a>> {
    vec![
        ChatMessage {
            role: "system",
            content: system,
        },
        ChatMessage {
            role: "user",
            content: prompt,
        },
    ]
}

fn system_prompt(context_chunks: &[String]) -> String {
    let mut system = String::from(
        "You help a product investigator interview a founder about their product idea.",
    );
    if !context_chunks.is_empty() {
        system.push_str("\n\nRelevant earlier answers:\n");
        for chunk in context_chunks {
            system.push_str(chunk);
            system.push_str("\n---\n");
        }
    }
    system
}

#[async_trait]
impl TextCompletionProvider for HttpCompletionProvider {
    async fn generate(&self, prompt: &str, context_chunks: &[String]) -> Result<String> {
        debug!(
            "Requesting question wording with {} context chunks",
            context_chunks.len()
        );

        let system = system_prompt(context_chunks);
        let request = ChatCompletionRequest {
            messages: build_messages(&system, prompt),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to call completion API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Completion API error: {} - {}", status, body);
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("No choices returned from completion API")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_lists_context() {
        let chunks = vec!["Q: who?\nA: teams".to_string(), "Q: why?\nA: speed".to_string()];
        let system = system_prompt(&chunks);
        assert!(system.contains("Relevant earlier answers"));
        assert!(system.contains("A: teams"));
        assert!(system.contains("A: speed"));
        assert!(!system_prompt(&[]).contains("Relevant earlier answers"));
    }

    #[test]
    fn test_request_shape() {
        let request = ChatCompletionRequest {
            messages: build_messages("sys", "ask"),
            max_tokens: 64,
            temperature: 0.7,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "ask");
        assert_eq!(json["stream"], false);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let config = CompletionConfig {
            enabled: true,
            base_url: "http://127.0.0.1:9/".into(),
            ..CompletionConfig::default()
        };
        let provider = HttpCompletionProvider::new(&config, Duration::from_millis(200));
        assert!(provider.generate("ask", &[]).await.is_err());
    }
}
