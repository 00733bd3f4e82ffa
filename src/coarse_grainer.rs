//! CoarseGrainer: asynchronous, fire-and-forget summarization of
//! newly-created nodes whose similarity to their parent crosses λ.
//!
//! The literal prompt is copied from
//! `original_source/app/services/state_manager.py::_coarse_grain_node`.
//! Scheduling uses a bounded drop-oldest queue rather than a
//! `tokio::sync::mpsc` channel, since mpsc has no way for the queue owner
//! to evict its oldest entry on overflow; the `Mutex<VecDeque>` +
//! `Notify` pair is the same family of tokio primitive the teacher reaches
//! for elsewhere (`gateway/streaming.rs`'s broadcast channel) generalized
//! to the drop-oldest policy spec.md §9 calls for.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::error::DegradeReason;
use crate::store::TreeStore;
use crate::summarizer::Summarizer;

const QUEUE_CAPACITY: usize = 256;
const SUMMARIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the literal summarization prompt from parent and child content.
fn build_prompt(parent_content: &str, child_content: &str) -> String {
    format!(
        "Summarize the following interaction into a single concise state for long-term memory:\n\n\
         Parent: {parent_content}\n\n\
         Child: {child_content}\n\n\
         Summary:"
    )
}

/// Owns the bounded work queue and spawns the consumer loop. Cheaply
/// cloneable: `schedule` just pushes a node id and notifies the consumer.
#[derive(Clone)]
pub struct CoarseGrainer {
    queue: Arc<Mutex<VecDeque<Uuid>>>,
    notify: Arc<tokio::sync::Notify>,
}

impl CoarseGrainer {
    /// Spawns the background consumer task. `store` and `summarizer` are
    /// the background task's own handles, never shared with the
    /// foreground request path.
    pub fn spawn(store: Arc<TreeStore>, summarizer: Arc<dyn Summarizer>, similarity_threshold: f32, model: String) -> Self {
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)));
        let notify = Arc::new(tokio::sync::Notify::new());

        let grainer = Self {
            queue: Arc::clone(&queue),
            notify: Arc::clone(&notify),
        };

        tokio::spawn(async move {
            loop {
                notify.notified().await;
                loop {
                    let next = queue.lock().expect("coarse-grain queue mutex poisoned").pop_front();
                    let Some(node_id) = next else { break };
                    process_node(&store, summarizer.as_ref(), similarity_threshold, &model, node_id).await;
                }
            }
        });

        grainer
    }

    /// Enqueues `node_id` for a coarse-graining check. Fire-and-forget:
    /// never awaited by the caller. Drops the oldest queued id when the
    /// queue is at capacity, per spec.md §9's bounded-queue requirement.
    pub fn schedule(&self, node_id: Uuid) {
        let mut queue = self.queue.lock().expect("coarse-grain queue mutex poisoned");
        if queue.len() >= QUEUE_CAPACITY {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(node_id = %dropped, "coarse-grain queue full, dropping oldest entry");
            }
        }
        queue.push_back(node_id);
        drop(queue);
        self.notify.notify_one();
    }
}

async fn process_node(
    store: &TreeStore,
    summarizer: &(dyn Summarizer + '_),
    similarity_threshold: f32,
    model: &str,
    node_id: Uuid,
) {
    let node = match store.get_node(node_id).await {
        Ok(Some(n)) => n,
        Ok(None) => {
            tracing::warn!(%node_id, "coarse-grain target node not found, skipping");
            return;
        }
        Err(e) => {
            tracing::warn!(%node_id, error = %e, "failed to fetch coarse-grain target node");
            return;
        }
    };

    if node.summary.is_some() {
        return;
    }
    if node.similarity_to_parent <= similarity_threshold {
        return;
    }
    let Some(parent_id) = node.parent_id else {
        return;
    };

    let parent = match store.get_node(parent_id).await {
        Ok(Some(p)) => p,
        Ok(None) => {
            tracing::warn!(%node_id, %parent_id, "coarse-grain parent node not found, skipping");
            return;
        }
        Err(e) => {
            tracing::warn!(%node_id, error = %e, "failed to fetch coarse-grain parent node");
            return;
        }
    };

    let prompt = build_prompt(parent.context_text(), &node.content);

    let summary = match tokio::time::timeout(SUMMARIZE_TIMEOUT, summarizer.summarize(&prompt, model)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            let reason = DegradeReason::SummarizerFailed(e.to_string());
            tracing::warn!(%node_id, error = %reason, "leaving node unchanged");
            return;
        }
        Err(_) => {
            let reason = DegradeReason::SummarizerFailed("timed out after 30s".to_string());
            tracing::warn!(%node_id, error = %reason, "leaving node unchanged");
            return;
        }
    };

    if let Err(e) = store.set_summary(node_id, summary).await {
        tracing::warn!(%node_id, error = %e, "failed to persist coarse-grained summary");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use crate::store::Role;
    use crate::summarizer::MockSummarizer;

    fn store() -> Arc<TreeStore> {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tree.sqlite3");
        std::mem::forget(dir);
        let store = TreeStore::new(db_path, Arc::new(HashEmbedder::new(16)));
        store.init_db().unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn schedules_and_writes_summary_above_threshold() {
        let store = store();
        let session = store.create_session(None).await.unwrap();
        let root = store
            .create_node(session.session_id, None, Role::User, "hello there".to_string(), 1)
            .await
            .unwrap();
        // identical content to parent maximizes cosine similarity with HashEmbedder
        let child = store
            .create_node(session.session_id, Some(root), Role::Assistant, "hello there".to_string(), 1)
            .await
            .unwrap();

        let grainer = CoarseGrainer::spawn(Arc::clone(&store), Arc::new(MockSummarizer), 0.40, "test-model".to_string());
        grainer.schedule(child);

        let mut summarized = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let node = store.get_node(child).await.unwrap().unwrap();
            if node.summary.is_some() {
                summarized = node.summary;
                break;
            }
        }
        assert!(summarized.is_some());
    }

    #[tokio::test]
    async fn is_a_no_op_when_summary_already_present() {
        let store = store();
        let session = store.create_session(None).await.unwrap();
        let root = store
            .create_node(session.session_id, None, Role::User, "hello there".to_string(), 1)
            .await
            .unwrap();
        let child = store
            .create_node(session.session_id, Some(root), Role::Assistant, "hello there".to_string(), 1)
            .await
            .unwrap();
        store.set_summary(child, "already summarized".to_string()).await.unwrap();

        process_node(&store, &MockSummarizer, 0.40, "test-model", child).await;

        let node = store.get_node(child).await.unwrap().unwrap();
        assert_eq!(node.summary.as_deref(), Some("already summarized"));
    }

    #[tokio::test]
    async fn queue_drops_oldest_entry_when_full() {
        let store = store();
        let grainer = CoarseGrainer::spawn(store, Arc::new(MockSummarizer), 0.40, "test-model".to_string());
        for _ in 0..(QUEUE_CAPACITY + 10) {
            grainer.schedule(Uuid::new_v4());
        }
        // draining proceeds via the consumer loop; this just asserts schedule()
        // never panics or blocks when the queue is saturated.
    }
}
