//! The `Summarizer.summarize(prompt) -> string` external collaborator.
//!
//! Grounded in the teacher's multi-provider HTTP summarizer: the same
//! provider-prefix parsing (`"anthropic/..."`, `"openai/..."`,
//! `"google/..."`) and per-provider response-path extraction.

use anyhow::{Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str, model: &str) -> Result<String>;
}

enum Provider {
    Anthropic,
    OpenAi,
    Google,
}

fn parse_model(model: &str) -> (Provider, &str) {
    if let Some(rest) = model.strip_prefix("anthropic/") {
        (Provider::Anthropic, rest)
    } else if let Some(rest) = model.strip_prefix("google/") {
        (Provider::Google, rest)
    } else if let Some(rest) = model.strip_prefix("openai/") {
        (Provider::OpenAi, rest)
    } else {
        (Provider::OpenAi, model)
    }
}

/// HTTP-backed summarizer bounded at ~150 output tokens per spec.md §4.5.
pub struct LlmSummarizer {
    http_client: reqwest::Client,
    anthropic_api_key: Option<String>,
    openai_api_key: Option<String>,
    google_api_key: Option<String>,
}

impl LlmSummarizer {
    pub fn new(
        anthropic_api_key: Option<String>,
        openai_api_key: Option<String>,
        google_api_key: Option<String>,
    ) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            anthropic_api_key,
            openai_api_key,
            google_api_key,
        }
    }

    async fn call_anthropic(&self, model: &str, prompt: &str) -> Result<String> {
        let api_key = self
            .anthropic_api_key
            .as_ref()
            .context("ANTHROPIC_API_KEY not configured")?;

        let body = serde_json::json!({
            "model": model,
            "max_tokens": 150,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .http_client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?
            .error_for_status()
            .context("anthropic returned an error status")?
            .json::<serde_json::Value>()
            .await
            .context("parsing anthropic response")?;

        resp["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .context("unexpected anthropic response shape")
    }

    async fn call_openai(&self, model: &str, prompt: &str) -> Result<String> {
        let api_key = self
            .openai_api_key
            .as_ref()
            .context("OPENAI_API_KEY not configured")?;

        let body = serde_json::json!({
            "model": model,
            "max_tokens": 150,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .http_client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("openai request failed")?
            .error_for_status()
            .context("openai returned an error status")?
            .json::<serde_json::Value>()
            .await
            .context("parsing openai response")?;

        resp["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .context("unexpected openai response shape")
    }

    async fn call_google(&self, model: &str, prompt: &str) -> Result<String> {
        let api_key = self
            .google_api_key
            .as_ref()
            .context("GOOGLE_API_KEY not configured")?;

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent?key={api_key}"
        );
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {"maxOutputTokens": 150},
        });

        let resp = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("google request failed")?
            .error_for_status()
            .context("google returned an error status")?
            .json::<serde_json::Value>()
            .await
            .context("parsing google response")?;

        resp["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .context("unexpected google response shape")
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, prompt: &str, model: &str) -> Result<String> {
        let (provider, model_name) = parse_model(model);
        match provider {
            Provider::Anthropic => self.call_anthropic(model_name, prompt).await,
            Provider::OpenAi => self.call_openai(model_name, prompt).await,
            Provider::Google => self.call_google(model_name, prompt).await,
        }
    }
}

/// Deterministic fake for tests: truncates to 100 chars plus an ellipsis.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockSummarizer;

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, prompt: &str, _model: &str) -> Result<String> {
        if prompt.len() <= 100 {
            Ok(prompt.to_string())
        } else {
            Ok(format!("{}...", &prompt[..100]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_summarizer_truncates_long_prompts() {
        let summarizer = MockSummarizer;
        let long = "a".repeat(200);
        let summary = summarizer.summarize(&long, "any/model").await.unwrap();
        assert_eq!(summary.len(), 103);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn parse_model_dispatches_on_prefix() {
        assert!(matches!(parse_model("anthropic/claude-haiku").0, Provider::Anthropic));
        assert!(matches!(parse_model("google/gemini-flash").0, Provider::Google));
        assert!(matches!(parse_model("gpt-4o-mini").0, Provider::OpenAi));
    }
}
