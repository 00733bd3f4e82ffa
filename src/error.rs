//! Error taxonomy for the context engine.
//!
//! Internal code propagates `anyhow::Result` with `.context(...)` chaining,
//! the way the rest of the crate does; `EngineError` is the set of named,
//! caller-visible failure modes that the orchestrator and HTTP layer need to
//! branch on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Named failure modes a caller (or the HTTP layer) may need to branch on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("input rejected: {0}")]
    InputRejected(String),

    #[error("parent node {0} not found")]
    ParentNotFound(uuid::Uuid),

    #[error("parent node {parent} belongs to session {parent_session}, not {session}")]
    SessionMismatch {
        parent: uuid::Uuid,
        parent_session: uuid::Uuid,
        session: uuid::Uuid,
    },

    #[error("cycle detected while walking ancestors of {0}")]
    CycleDetected(uuid::Uuid),

    #[error("language model rejected the system role: {0}")]
    LlmSystemRoleRejected(String),

    #[error("language model transport error: {0}")]
    LlmTransportError(String),

    #[error("persistence error: {0}")]
    PersistenceError(#[from] anyhow::Error),
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::InputRejected(_) => StatusCode::BAD_REQUEST,
            EngineError::ParentNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::SessionMismatch { .. } => StatusCode::CONFLICT,
            EngineError::CycleDetected(_) => StatusCode::CONFLICT,
            EngineError::LlmSystemRoleRejected(_) => StatusCode::BAD_GATEWAY,
            EngineError::LlmTransportError(_) => StatusCode::BAD_GATEWAY,
            EngineError::PersistenceError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Degrade-path signals that never reach the HTTP boundary; callers log and
/// continue per spec.md §7's propagation policy. Kept as a distinct type so
/// call sites can match on *why* a degrade happened instead of stringly
/// checking log messages.
#[derive(Debug, thiserror::Error)]
pub enum DegradeReason {
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("vector query failed: {0}")]
    VectorQueryFailed(String),

    #[error("causal graph missing or NER unavailable: {0}")]
    CausalGraphMissing(String),

    #[error("summarizer failed: {0}")]
    SummarizerFailed(String),
}
