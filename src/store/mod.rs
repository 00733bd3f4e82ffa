//! TreeStore: conversation-tree (node/session) persistence.
//!
//! Repository pattern grounded in `database/context_settings.rs`: the store
//! holds only a `db_path`; every operation clones the path, moves it into
//! `tokio::task::spawn_blocking`, and opens a fresh `rusqlite::Connection`
//! inside the blocking closure rather than holding a connection open across
//! an `.await`. Schema is grounded in
//! `original_source/app/database.py`'s `Session`/`Message` tables —
//! `node_id` (not the surrogate row id) is the externally meaningful UUID.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::embedder::{cosine_similarity, Embedder};
use crate::error::{DegradeReason, EngineError};
use crate::tfidf::tfidf_cosine_similarity;

fn open_conn(path: &std::path::Path) -> Result<Connection> {
    let conn = Connection::open(path).context("opening tree store database")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("enabling foreign key enforcement")?;
    Ok(conn)
}

/// Role of a conversation-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => anyhow::bail!("unknown role: {other}"),
        }
    }
}

/// A persisted conversation-tree node.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: Uuid,
    pub session_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub role: Role,
    pub content: String,
    pub summary: Option<String>,
    pub tokens: i64,
    pub similarity_to_parent: f32,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// The text context assembly must use: `summary` when present,
    /// otherwise `content` (spec.md §3 invariant).
    pub fn context_text(&self) -> &str {
        self.summary.as_deref().unwrap_or(&self.content)
    }
}

/// A single entry in an ancestor chain, as returned by `context_chain`.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub name: Option<String>,
}

/// SQLite-backed persistence for sessions and conversation-tree nodes.
pub struct TreeStore {
    db_path: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl TreeStore {
    pub fn new(db_path: PathBuf, embedder: Arc<dyn Embedder>) -> Self {
        Self { db_path, embedder }
    }

    /// Create the backing tables if absent. Safe to call repeatedly.
    pub fn init_db(&self) -> Result<()> {
        let conn = open_conn(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                name TEXT
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tokens INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                node_id TEXT NOT NULL UNIQUE,
                parent_id TEXT,
                summary TEXT,
                similarity_to_parent REAL NOT NULL DEFAULT 0.0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
            CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_id);",
        )
        .context("creating tree store schema")?;
        Ok(())
    }

    pub async fn create_session(&self, name: Option<String>) -> Result<Session> {
        let db_path = self.db_path.clone();
        let session_id = Uuid::new_v4();
        let created_at = Utc::now();
        let name_clone = name.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_conn(&db_path)?;
            conn.execute(
                "INSERT INTO sessions (id, created_at, name) VALUES (?1, ?2, ?3)",
                params![session_id.to_string(), created_at.to_rfc3339(), name_clone],
            )
            .context("inserting session")?;
            Ok(())
        })
        .await
        .context("task join error")??;

        Ok(Session {
            session_id,
            created_at,
            name,
        })
    }

    /// Assigns a fresh `node_id`; computes `similarity_to_parent` against
    /// the parent's content when a parent is given; persists atomically
    /// inside a single blocking closure so readers never observe a
    /// half-initialized node.
    pub async fn create_node(
        &self,
        session_id: Uuid,
        parent_id: Option<Uuid>,
        role: Role,
        content: String,
        tokens: i64,
    ) -> Result<Uuid, EngineError> {
        self.create_node_with_id(Uuid::new_v4(), session_id, parent_id, role, content, tokens)
            .await
    }

    /// Same as [`TreeStore::create_node`] but persists under a caller-chosen
    /// `node_id`, so the orchestrator can pre-mint the assistant node's id
    /// (surfaced in response headers before the stream completes, per
    /// spec.md §4.6 step 3) and have the eventually-persisted node carry
    /// that same id.
    pub async fn create_node_with_id(
        &self,
        node_id: Uuid,
        session_id: Uuid,
        parent_id: Option<Uuid>,
        role: Role,
        content: String,
        tokens: i64,
    ) -> Result<Uuid, EngineError> {
        let created_at = Utc::now();

        let parent_content = if let Some(parent_id) = parent_id {
            let parent = self.get_node(parent_id).await.map_err(EngineError::PersistenceError)?;
            let parent = parent.ok_or(EngineError::ParentNotFound(parent_id))?;
            if parent.session_id != session_id {
                return Err(EngineError::SessionMismatch {
                    parent: parent_id,
                    parent_session: parent.session_id,
                    session: session_id,
                });
            }
            // spec.md §3: similarity is cosine between the node's content
            // and the parent's *content*, not the parent's summary.
            Some(parent.content.clone())
        } else {
            None
        };

        let similarity = if let Some(parent_text) = &parent_content {
            match self.embedder.embed(&content).await {
                Ok(child_vec) => match self.embedder.embed(parent_text).await {
                    Ok(parent_vec) => cosine_similarity(&child_vec, &parent_vec),
                    Err(e) => {
                        let reason = DegradeReason::EmbeddingUnavailable(e.to_string());
                        tracing::warn!(error = %reason, "falling back to tf-idf similarity");
                        tfidf_cosine_similarity(&content, parent_text)
                    }
                },
                Err(e) => {
                    let reason = DegradeReason::EmbeddingUnavailable(e.to_string());
                    tracing::warn!(error = %reason, "falling back to tf-idf similarity");
                    tfidf_cosine_similarity(&content, parent_text)
                }
            }
        } else {
            0.0
        };

        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_conn(&db_path)?;
            conn.execute(
                "INSERT INTO messages
                 (session_id, role, content, tokens, timestamp, node_id, parent_id, summary, similarity_to_parent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8)",
                params![
                    session_id.to_string(),
                    role.as_str(),
                    content,
                    tokens,
                    created_at.to_rfc3339(),
                    node_id.to_string(),
                    parent_id.map(|p| p.to_string()),
                    similarity,
                ],
            )
            .context("inserting node")?;
            Ok(())
        })
        .await
        .context("task join error")
        .map_err(EngineError::PersistenceError)?
        .map_err(EngineError::PersistenceError)?;

        Ok(node_id)
    }

    pub async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_conn(&db_path)?;
            fetch_node(&conn, node_id)
        })
        .await
        .context("task join error")?
    }

    /// Idempotent: a second call with the same summary is a no-op;
    /// overwriting a different existing summary is permitted but logged.
    pub async fn set_summary(&self, node_id: Uuid, summary: String) -> Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_conn(&db_path)?;
            let existing: Option<String> = conn
                .query_row(
                    "SELECT summary FROM messages WHERE node_id = ?1",
                    params![node_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .context("reading existing summary")?
                .flatten();

            if existing.as_deref() == Some(summary.as_str()) {
                return Ok(());
            }
            if existing.is_some() {
                tracing::info!(%node_id, "overwriting existing summary");
            }

            conn.execute(
                "UPDATE messages SET summary = ?1 WHERE node_id = ?2",
                params![summary, node_id.to_string()],
            )
            .context("writing summary")?;
            Ok(())
        })
        .await
        .context("task join error")?
    }

    /// Walks parent pointers from `leaf_id` to the root, yielding `summary`
    /// when present else `content`, root-first. Detects cycles via a
    /// visited-id set (spec.md §9).
    pub async fn context_chain(&self, leaf_id: Uuid) -> Result<Vec<ChainEntry>, EngineError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ChainEntry>, EngineError> {
            let conn = open_conn(&db_path).map_err(EngineError::PersistenceError)?;

            let mut chain = Vec::new();
            let mut visited = HashSet::new();
            let mut current = Some(leaf_id);

            while let Some(id) = current {
                if !visited.insert(id) {
                    return Err(EngineError::CycleDetected(leaf_id));
                }
                let node = fetch_node(&conn, id)
                    .map_err(EngineError::PersistenceError)?
                    .ok_or(EngineError::ParentNotFound(id))?;
                chain.push(ChainEntry {
                    role: node.role,
                    content: node.context_text().to_string(),
                });
                current = node.parent_id;
            }

            chain.reverse();
            Ok(chain)
        })
        .await
        .context("task join error")
        .map_err(EngineError::PersistenceError)?
    }

    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_conn(&db_path)?;
            conn.execute(
                "DELETE FROM sessions WHERE id = ?1",
                params![session_id.to_string()],
            )
            .context("deleting session")?;
            Ok(())
        })
        .await
        .context("task join error")?
    }
}

fn fetch_node(conn: &Connection, node_id: Uuid) -> Result<Option<Node>> {
    conn.query_row(
        "SELECT session_id, role, content, tokens, timestamp, node_id, parent_id, summary, similarity_to_parent
         FROM messages WHERE node_id = ?1",
        params![node_id.to_string()],
        |row| {
            let session_id: String = row.get(0)?;
            let role: String = row.get(1)?;
            let timestamp: String = row.get(4)?;
            let parent_id: Option<String> = row.get(6)?;

            Ok(Node {
                node_id,
                session_id: session_id.parse().unwrap_or_default(),
                parent_id: parent_id.and_then(|p| p.parse().ok()),
                role: role.parse().unwrap_or(Role::User),
                content: row.get(2)?,
                summary: row.get(7)?,
                tokens: row.get(3)?,
                similarity_to_parent: row.get(8)?,
                created_at: timestamp.parse().unwrap_or_else(|_| Utc::now()),
            })
        },
    )
    .optional()
    .context("querying node")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use async_trait::async_trait;

    fn store() -> TreeStore {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tree.sqlite3");
        // leak the tempdir so the file outlives this function's scope
        std::mem::forget(dir);
        let store = TreeStore::new(db_path, Arc::new(HashEmbedder::new(16)));
        store.init_db().unwrap();
        store
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            anyhow::bail!("embedding service unreachable")
        }
        async fn embed_batch(&self, _texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("embedding service unreachable")
        }
        fn dimension(&self) -> usize {
            16
        }
    }

    #[tokio::test]
    async fn root_node_has_zero_similarity() {
        let store = store();
        let session = store.create_session(None).await.unwrap();
        let id = store
            .create_node(session.session_id, None, Role::User, "hi".to_string(), 1)
            .await
            .unwrap();
        let node = store.get_node(id).await.unwrap().unwrap();
        assert_eq!(node.similarity_to_parent, 0.0);
        assert!(node.parent_id.is_none());
    }

    #[tokio::test]
    async fn child_inherits_session_and_parent_link() {
        let store = store();
        let session = store.create_session(None).await.unwrap();
        let root = store
            .create_node(session.session_id, None, Role::User, "hi".to_string(), 1)
            .await
            .unwrap();
        let child = store
            .create_node(session.session_id, Some(root), Role::Assistant, "hello!".to_string(), 2)
            .await
            .unwrap();

        let node = store.get_node(child).await.unwrap().unwrap();
        assert_eq!(node.parent_id, Some(root));
        assert_eq!(node.session_id, session.session_id);
    }

    #[tokio::test]
    async fn create_node_rejects_missing_parent() {
        let store = store();
        let session = store.create_session(None).await.unwrap();
        let err = store
            .create_node(session.session_id, Some(Uuid::new_v4()), Role::User, "hi".to_string(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ParentNotFound(_)));
    }

    #[tokio::test]
    async fn create_node_rejects_cross_session_parent() {
        let store = store();
        let s1 = store.create_session(None).await.unwrap();
        let s2 = store.create_session(None).await.unwrap();
        let root = store
            .create_node(s1.session_id, None, Role::User, "hi".to_string(), 1)
            .await
            .unwrap();

        let err = store
            .create_node(s2.session_id, Some(root), Role::User, "hi".to_string(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionMismatch { .. }));
    }

    #[tokio::test]
    async fn context_chain_is_root_first_and_uses_summary_over_content() {
        let store = store();
        let session = store.create_session(None).await.unwrap();
        let root = store
            .create_node(session.session_id, None, Role::User, "root".to_string(), 1)
            .await
            .unwrap();
        let child = store
            .create_node(session.session_id, Some(root), Role::Assistant, "child".to_string(), 1)
            .await
            .unwrap();
        store.set_summary(root, "summarized root".to_string()).await.unwrap();

        let chain = store.context_chain(child).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].content, "summarized root");
        assert_eq!(chain[1].content, "child");
    }

    #[tokio::test]
    async fn set_summary_is_idempotent() {
        let store = store();
        let session = store.create_session(None).await.unwrap();
        let root = store
            .create_node(session.session_id, None, Role::User, "root".to_string(), 1)
            .await
            .unwrap();
        store.set_summary(root, "s".to_string()).await.unwrap();
        store.set_summary(root, "s".to_string()).await.unwrap();
        let node = store.get_node(root).await.unwrap().unwrap();
        assert_eq!(node.summary.as_deref(), Some("s"));
    }

    #[tokio::test]
    async fn create_node_falls_back_to_tfidf_when_embedding_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tree.sqlite3");
        std::mem::forget(dir);
        let store = TreeStore::new(db_path, Arc::new(FailingEmbedder));
        store.init_db().unwrap();

        let session = store.create_session(None).await.unwrap();
        let root = store
            .create_node(session.session_id, None, Role::User, "the quick brown fox".to_string(), 1)
            .await
            .unwrap();
        let child = store
            .create_node(
                session.session_id,
                Some(root),
                Role::Assistant,
                "the quick brown fox".to_string(),
                1,
            )
            .await
            .unwrap();

        let node = store.get_node(child).await.unwrap().unwrap();
        assert!((node.similarity_to_parent - 1.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn delete_session_cascades_to_nodes() {
        let store = store();
        let session = store.create_session(None).await.unwrap();
        let root = store
            .create_node(session.session_id, None, Role::User, "root".to_string(), 1)
            .await
            .unwrap();
        store.delete_session(session.session_id).await.unwrap();
        let node = store.get_node(root).await.unwrap();
        assert!(node.is_none());
    }
}
