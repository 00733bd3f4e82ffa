//! Orchestrator: composes TreeStore, VectorIndex, CausalFilter,
//! CoarseGrainer, Security, and Llm into the single end-to-end chat-turn
//! operation.
//!
//! Grounded step-for-step in `original_source/app/routers/chat.py`'s
//! `/api/chat` handler: sanitize -> injection check -> sql-injection check
//! -> create user node -> pre-mint assistant id -> vector retrieval ->
//! causal verification -> ancestor assembly -> system-message build ->
//! stream -> persist-if-non-empty -> schedule coarse-graining. The
//! system-role-rejection retry folds the system text into the first user
//! message, matching the same substring-triggered recovery.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

use crate::causal::filter::CausalFilter;
use crate::coarse_grainer::CoarseGrainer;
use crate::error::{DegradeReason, EngineError};
use crate::llm::{ChatMessage, ChatRole, Llm};
use crate::security::{Security, SecurityVerdict};
use crate::store::{Role, TreeStore};
use crate::tokenizer::Tokenizer;
use crate::vector::VectorIndex;

/// One message in a caller-supplied linear history: the Turn API's
/// request-body shape, independent of the internal `store::Role`/
/// `llm::ChatRole` types.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: String,
}

/// Input to [`Orchestrator::handle_turn`]; `messages` must contain at
/// least the new user turn as its last entry (the rest, when
/// `parent_node_id` is absent, are treated as an already-assembled linear
/// history — matching the original's backward-compatible fallback).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TurnInput {
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub parent_node_id: Option<Uuid>,
    pub messages: Vec<IncomingMessage>,
}

/// Node ids minted for this turn, surfaced to the caller as response
/// headers before the token stream completes.
#[derive(Debug, Clone, Copy)]
pub struct TurnHandles {
    pub session_id: Uuid,
    pub user_node_id: Uuid,
    pub assistant_node_id: Uuid,
}

pub struct TurnResponse {
    pub handles: TurnHandles,
    pub tokens: BoxStream<'static, String>,
}

const GUARDRAILS: &str =
    "\nStay grounded in the verified context above; if the answer isn't there, say so rather than guessing.";

pub struct Orchestrator {
    store: Arc<TreeStore>,
    vector_index: Arc<VectorIndex>,
    causal_filter: Arc<CausalFilter>,
    llm: Arc<dyn Llm>,
    coarse_grainer: CoarseGrainer,
    security: Arc<dyn Security>,
    tokenizer: Arc<dyn Tokenizer>,
    system_persona: String,
    temperature: f32,
    max_context_tokens: usize,
    prompt_injection_block_threshold: f32,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TreeStore>,
        vector_index: Arc<VectorIndex>,
        causal_filter: Arc<CausalFilter>,
        llm: Arc<dyn Llm>,
        coarse_grainer: CoarseGrainer,
        security: Arc<dyn Security>,
        tokenizer: Arc<dyn Tokenizer>,
        system_persona: String,
        temperature: f32,
        max_context_tokens: usize,
        prompt_injection_block_threshold: f32,
    ) -> Self {
        Self {
            store,
            vector_index,
            causal_filter,
            llm,
            coarse_grainer,
            security,
            tokenizer,
            system_persona,
            temperature,
            max_context_tokens,
            prompt_injection_block_threshold,
        }
    }

    pub async fn handle_turn(&self, input: TurnInput) -> Result<TurnResponse, EngineError> {
        let user_content = input
            .messages
            .last()
            .map(|m| m.content.clone())
            .ok_or_else(|| EngineError::InputRejected("messages must contain at least one entry".to_string()))?;

        let sanitized_content = self.security.sanitize(&user_content);

        match self.security.check(&sanitized_content) {
            SecurityVerdict::SqlInjection => {
                return Err(EngineError::InputRejected("invalid input detected".to_string()));
            }
            SecurityVerdict::Injection { confidence } if confidence > self.prompt_injection_block_threshold => {
                return Err(EngineError::InputRejected(
                    "invalid input detected, please rephrase your message".to_string(),
                ));
            }
            _ => {}
        }

        let session_id = match input.session_id {
            Some(id) => id,
            None => {
                self.store
                    .create_session(None)
                    .await
                    .map_err(EngineError::PersistenceError)?
                    .session_id
            }
        };

        let user_tokens = self.tokenizer.count(&sanitized_content) as i64;
        let user_node_id = self
            .store
            .create_node(session_id, input.parent_node_id, Role::User, sanitized_content.clone(), user_tokens)
            .await?;

        let assistant_node_id = Uuid::new_v4();

        let ancestors: Vec<ChatMessage> = if let Some(parent_id) = input.parent_node_id {
            self.store
                .context_chain(parent_id)
                .await?
                .into_iter()
                .map(|entry| to_chat_message(entry.role, entry.content))
                .collect()
        } else {
            input.messages[..input.messages.len() - 1]
                .iter()
                .map(|m| to_chat_message(m.role.parse().unwrap_or(Role::User), m.content.clone()))
                .collect()
        };
        let ancestors = self.trim_to_budget(ancestors);

        let raw_context = match self.vector_index.query(&sanitized_content, 10).await {
            Ok(text) => text,
            Err(e) => {
                let reason = DegradeReason::VectorQueryFailed(e.to_string());
                tracing::warn!(error = %reason, "proceeding with empty context");
                String::new()
            }
        };
        let candidates: Vec<String> = raw_context
            .split("---")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let verified = self.causal_filter.verify_mechanisms(&sanitized_content, &candidates);

        let context_block = if verified.is_empty() {
            String::new()
        } else {
            format!("\n\nVerified Causal Context:\n{}\n", verified.join("\n---\n"))
        };
        let system_text = format!("{}{}{}", self.system_persona, context_block, GUARDRAILS);

        let mut messages = Vec::with_capacity(ancestors.len() + 2);
        messages.push(ChatMessage::system(system_text));
        messages.extend(ancestors);
        messages.push(ChatMessage::user(sanitized_content));

        let llm = Arc::clone(&self.llm);
        let temperature = self.temperature;
        let store = Arc::clone(&self.store);
        let tokenizer = Arc::clone(&self.tokenizer);
        let coarse_grainer = self.coarse_grainer.clone();

        let token_stream = async_stream::stream! {
            let mut full_response = String::new();

            match llm.chat_stream(&messages, temperature).await {
                Ok(mut stream) => {
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(token) => {
                                full_response.push_str(&token);
                                yield token;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "llm transport error mid-stream, truncating");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    if message.to_lowercase().contains("system message") {
                        let fallback_messages = fold_system_into_first_user(&messages);
                        match llm.chat_stream(&fallback_messages, temperature).await {
                            Ok(mut stream) => {
                                while let Some(item) = stream.next().await {
                                    match item {
                                        Ok(token) => {
                                            full_response.push_str(&token);
                                            yield token;
                                        }
                                        Err(e) => {
                                            tracing::warn!(error = %e, "llm transport error mid-stream on fallback, truncating");
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "llm fallback call failed before any token");
                                yield format!("\n[Error: {e}]");
                            }
                        }
                    } else {
                        tracing::error!(error = %e, "llm call failed before any token");
                        yield format!("\n[Error: {e}]");
                    }
                }
            }

            if !full_response.is_empty() {
                let tokens = tokenizer.count(&full_response) as i64;
                match store
                    .create_node_with_id(assistant_node_id, session_id, Some(user_node_id), Role::Assistant, full_response.clone(), tokens)
                    .await
                {
                    Ok(_) => coarse_grainer.schedule(assistant_node_id),
                    Err(e) => tracing::error!(error = %e, %assistant_node_id, "failed to persist assistant node; the stream to the caller already completed, this is a data-loss event"),
                }
            }
        };

        Ok(TurnResponse {
            handles: TurnHandles {
                session_id,
                user_node_id,
                assistant_node_id,
            },
            tokens: Box::pin(token_stream),
        })
    }

    /// Drops ancestors from the oldest end until the remaining total fits
    /// `max_context_tokens`, per spec.md §6's advisory budget.
    fn trim_to_budget(&self, mut ancestors: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let mut total: usize = ancestors.iter().map(|m| self.tokenizer.count(&m.content)).sum();
        while total > self.max_context_tokens && !ancestors.is_empty() {
            let removed = ancestors.remove(0);
            total = total.saturating_sub(self.tokenizer.count(&removed.content));
        }
        ancestors
    }
}

fn to_chat_message(role: Role, content: String) -> ChatMessage {
    match role {
        Role::System => ChatMessage::system(content),
        Role::Assistant => ChatMessage::assistant(content),
        Role::User => ChatMessage::user(content),
    }
}

/// Folds the system message into the first user message, matching
/// `chat.py`'s retry branch: prefixes an existing first user message, or
/// inserts a synthetic one if none exists.
fn fold_system_into_first_user(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let Some(system) = messages.iter().find(|m| m.role == ChatRole::System) else {
        return messages.to_vec();
    };
    let mut rest: Vec<ChatMessage> = messages.iter().filter(|m| m.role != ChatRole::System).cloned().collect();

    match rest.first_mut() {
        Some(first) if first.role == ChatRole::User => {
            first.content = format!("System Instructions: {}\n\nUser Query: {}", system.content, first.content);
        }
        _ => rest.insert(0, ChatMessage::user(format!("System Instructions: {}", system.content))),
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causal::CausalGraph;
    use crate::embedder::HashEmbedder;
    use crate::llm::MockLlm;
    use crate::security::DefaultSecurity;
    use crate::summarizer::MockSummarizer;
    use crate::tokenizer::SimpleTokenizer;
    use std::sync::RwLock;

    fn orchestrator(llm: Arc<dyn Llm>) -> Orchestrator {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tree.sqlite3");
        std::mem::forget(dir);
        let embedder = Arc::new(HashEmbedder::new(16));
        let store = Arc::new(TreeStore::new(db_path.clone(), embedder.clone()));
        store.init_db().unwrap();

        let vector_dir = tempfile::tempdir().unwrap();
        let vector_db = vector_dir.path().join("vector.sqlite3");
        std::mem::forget(vector_dir);
        let vector_index = Arc::new(VectorIndex::new(vector_db, embedder).unwrap());

        let graph = Arc::new(RwLock::new(Arc::new(CausalGraph::new())));
        let causal_filter = Arc::new(CausalFilter::new(graph));

        let coarse_grainer = CoarseGrainer::spawn(Arc::clone(&store), Arc::new(MockSummarizer), 0.40, "test-model".to_string());

        Orchestrator::new(
            store,
            vector_index,
            causal_filter,
            llm,
            coarse_grainer,
            Arc::new(DefaultSecurity),
            Arc::new(SimpleTokenizer),
            "You are a helpful assistant.".to_string(),
            0.7,
            4000,
            0.8,
        )
    }

    #[tokio::test]
    async fn handle_turn_persists_user_and_assistant_nodes() {
        let orch = orchestrator(Arc::new(MockLlm::new(vec!["hello".to_string(), " there".to_string()])));
        let input = TurnInput {
            session_id: None,
            parent_node_id: None,
            messages: vec![IncomingMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
        };

        let response = orch.handle_turn(input).await.unwrap();
        let handles = response.handles;
        let mut out = String::new();
        let mut stream = response.tokens;
        while let Some(tok) = stream.next().await {
            out.push_str(&tok);
        }
        assert_eq!(out, "hello there");

        // allow the stream's tail (persistence) to complete; the loop above
        // already awaited every yielded token, and the post-loop persistence
        // code runs before the stream is exhausted by async-stream's desugaring.
        let assistant = orch.store.get_node(handles.assistant_node_id).await.unwrap();
        assert!(assistant.is_some());
        assert_eq!(assistant.unwrap().content, "hello there");
    }

    #[tokio::test]
    async fn handle_turn_rejects_sql_injection() {
        let orch = orchestrator(Arc::new(MockLlm::new(vec!["x".to_string()])));
        let input = TurnInput {
            session_id: None,
            parent_node_id: None,
            messages: vec![IncomingMessage {
                role: "user".to_string(),
                content: "'; DROP TABLE users; --".to_string(),
            }],
        };
        let err = orch.handle_turn(input).await.unwrap_err();
        assert!(matches!(err, EngineError::InputRejected(_)));
    }

    #[tokio::test]
    async fn handle_turn_does_not_persist_assistant_node_on_empty_response() {
        let orch = orchestrator(Arc::new(MockLlm::new(vec![])));
        let input = TurnInput {
            session_id: None,
            parent_node_id: None,
            messages: vec![IncomingMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
        };
        let response = orch.handle_turn(input).await.unwrap();
        let handles = response.handles;
        let mut stream = response.tokens;
        while stream.next().await.is_some() {}

        let assistant = orch.store.get_node(handles.assistant_node_id).await.unwrap();
        assert!(assistant.is_none());
    }

    /// Always fails before yielding any token, never rejecting the system
    /// role — exercises the plain `LlmTransportError`-before-any-token path
    /// rather than the system-role-rejection retry.
    struct AlwaysFailingLlm;

    #[async_trait::async_trait]
    impl Llm for AlwaysFailingLlm {
        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<String>>> {
            anyhow::bail!("upstream LLM provider unreachable")
        }
    }

    #[tokio::test]
    async fn handle_turn_yields_error_sentence_and_does_not_persist_when_llm_fails_before_any_token() {
        let orch = orchestrator(Arc::new(AlwaysFailingLlm));
        let input = TurnInput {
            session_id: None,
            parent_node_id: None,
            messages: vec![IncomingMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
        };
        let response = orch.handle_turn(input).await.unwrap();
        let handles = response.handles;
        let mut out = String::new();
        let mut stream = response.tokens;
        while let Some(tok) = stream.next().await {
            out.push_str(&tok);
        }

        assert!(out.contains("[Error:"));
        assert!(out.contains("upstream LLM provider unreachable"));

        let assistant = orch.store.get_node(handles.assistant_node_id).await.unwrap();
        assert!(assistant.is_none());
    }

    #[test]
    fn folds_system_message_into_existing_first_user_message() {
        let messages = vec![
            ChatMessage::system("be nice"),
            ChatMessage::user("hello"),
        ];
        let folded = fold_system_into_first_user(&messages);
        assert_eq!(folded.len(), 1);
        assert!(folded[0].content.contains("System Instructions: be nice"));
        assert!(folded[0].content.contains("User Query: hello"));
    }
}
