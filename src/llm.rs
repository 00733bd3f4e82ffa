//! The `Llm.chat_stream(messages, temperature) -> Stream<String>` external
//! collaborator: a generalization of `summarizer.rs`'s multi-provider HTTP
//! call shape to streaming, via `reqwest`'s byte-stream body and
//! OpenAI/Anthropic-compatible SSE `data: {...}` line framing (the format
//! OpenRouter, the original's LLM gateway, actually speaks).

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Streams assistant tokens for a chat turn. Errors are plain
/// `anyhow::Error`; a `Display` containing `"system message"` signals the
/// model rejected the system role, which the orchestrator retries once by
/// folding the system text into the first user message.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String>>>;
}

/// OpenRouter streaming chat client (OpenAI-compatible `chat/completions`
/// SSE framing).
pub struct OpenRouterLlm {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterLlm {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl Llm for OpenRouterLlm {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "stream": true,
        });

        let resp = self
            .http_client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", "https://localhost")
            .header("X-Title", "Causal-Fractal Context Engine")
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?;

        if let Err(e) = resp.error_for_status_ref() {
            let text = resp.text().await.unwrap_or_default();
            if text.contains("Developer instruction") || text.to_lowercase().contains("system message") {
                anyhow::bail!("model rejected system message: {text}");
            }
            return Err(anyhow::anyhow!(e)).context(format!("chat completion returned an error status: {text}"));
        }

        let byte_stream = resp.bytes_stream();
        let token_stream = async_stream::stream! {
            futures::pin_mut!(byte_stream);
            let mut buffer = String::new();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(anyhow::anyhow!(e).context("reading chat stream body"));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
                        return;
                    }

                    match serde_json::from_str::<serde_json::Value>(data) {
                        Ok(value) => {
                            if let Some(err_msg) = value["error"]["message"].as_str() {
                                yield Err(anyhow::anyhow!(err_msg.to_string()));
                                return;
                            }
                            if let Some(content) = value["choices"][0]["delta"]["content"].as_str() {
                                if !content.is_empty() {
                                    yield Ok(content.to_string());
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping unparseable SSE data line");
                        }
                    }
                }
            }
        };

        Ok(Box::pin(token_stream))
    }
}

/// Deterministic fake for tests: yields scripted tokens, optionally
/// failing once with a system-role-rejection error to exercise the
/// orchestrator's retry path.
pub struct MockLlm {
    tokens: Vec<String>,
    reject_system_role_once: std::sync::atomic::AtomicBool,
}

impl MockLlm {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            reject_system_role_once: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn rejecting_system_role_once(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            reject_system_role_once: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Llm for MockLlm {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let has_system = messages.iter().any(|m| m.role == ChatRole::System);
        if has_system
            && self
                .reject_system_role_once
                .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            anyhow::bail!("model rejected system message: Developer instruction is not enabled for this model");
        }
        let tokens = self.tokens.clone();
        Ok(Box::pin(futures::stream::iter(tokens.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_llm_streams_scripted_tokens() {
        let llm = MockLlm::new(vec!["hel".to_string(), "lo".to_string()]);
        let mut stream = llm
            .chat_stream(&[ChatMessage::user("hi")], 0.7)
            .await
            .unwrap();
        let mut out = String::new();
        while let Some(tok) = stream.next().await {
            out.push_str(&tok.unwrap());
        }
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn mock_llm_rejects_system_role_once_then_succeeds() {
        let llm = MockLlm::rejecting_system_role_once(vec!["ok".to_string()]);

        let err = llm
            .chat_stream(&[ChatMessage::system("be nice"), ChatMessage::user("hi")], 0.7)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("system message"));

        let mut stream = llm
            .chat_stream(&[ChatMessage::user("System Instructions: be nice\n\nUser Query: hi")], 0.7)
            .await
            .unwrap();
        let mut out = String::new();
        while let Some(tok) = stream.next().await {
            out.push_str(&tok.unwrap());
        }
        assert_eq!(out, "ok");
    }
}
