//! HTTP surface: the Turn API plus a supplemented document-ingestion
//! endpoint reaching `VectorIndex` directly.
//!
//! Router shape (`Router<AppState>`, one `router()` per concern) follows
//! `gateway/streaming.rs` and `api/knowledge.rs`; the Turn API's
//! streaming `text/plain` body with `X-Session-ID`/`X-User-Node-ID`/
//! `X-Assistant-Node-ID` headers set before the body starts is grounded
//! in `original_source/app/routers/chat.py`'s `StreamingResponse` call.
//! The upload endpoint's multipart parsing follows `api/knowledge.rs`'s
//! `upload_document`, narrowed to already-extracted UTF-8 text: no
//! PDF/DOCX/XLSX extraction exists anywhere in this crate's dependency
//! stack, so that extraction step is out of scope here (SPEC_FULL.md §4.6).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use futures::StreamExt;
use uuid::Uuid;

use crate::error::EngineError;
use crate::orchestrator::{Orchestrator, TurnInput};
use crate::vector::VectorIndex;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub vector_index: Arc<VectorIndex>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/turns", post(create_turn))
        .route("/v1/documents", post(upload_document))
        .route("/v1/documents/{doc_id}", delete(remove_document))
}

async fn create_turn(State(state): State<AppState>, Json(input): Json<TurnInput>) -> Response {
    let turn = match state.orchestrator.handle_turn(input).await {
        Ok(turn) => turn,
        Err(e) => return e.into_response(),
    };

    let handles = turn.handles;
    let body = Body::from_stream(turn.tokens.map(Ok::<_, std::io::Error>));

    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain; charset=utf-8"));
    insert_uuid_header(&mut response, "x-session-id", handles.session_id);
    insert_uuid_header(&mut response, "x-user-node-id", handles.user_node_id);
    insert_uuid_header(&mut response, "x-assistant-node-id", handles.assistant_node_id);
    response
}

fn insert_uuid_header(response: &mut Response, name: &'static str, value: Uuid) {
    if let Ok(header_value) = HeaderValue::from_str(&value.to_string()) {
        response.headers_mut().insert(name, header_value);
    }
}

#[derive(serde::Serialize)]
struct UploadResponse {
    doc_id: String,
    chunks_indexed: usize,
}

/// Accepts `multipart/form-data` with a `doc_id` text field and a `file`
/// field containing UTF-8 text; mints a random `doc_id` when the field is
/// absent, matching the original's optional-id upload behavior.
async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, String)> {
    let mut doc_id: Option<String> = None;
    let mut filename = String::from("document.txt");
    let mut text: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("doc_id") => {
                doc_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid doc_id field: {e}")))?,
                );
            }
            Some("file") => {
                filename = field.file_name().unwrap_or("document.txt").to_string();
                text = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| (StatusCode::BAD_REQUEST, format!("file must be UTF-8 text: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let text = text.ok_or_else(|| (StatusCode::BAD_REQUEST, "no file field provided".to_string()))?;
    let doc_id = doc_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let chunks_indexed = state
        .vector_index
        .add_document(&doc_id, &filename, &text)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("indexing failed: {e}")))?;

    Ok(Json(UploadResponse { doc_id, chunks_indexed }))
}

async fn remove_document(State(state): State<AppState>, Path(doc_id): Path<String>) -> Result<StatusCode, EngineError> {
    state
        .vector_index
        .delete_document(&doc_id)
        .await
        .map_err(EngineError::PersistenceError)?;
    Ok(StatusCode::NO_CONTENT)
}
