//! CausalFilter: reranks retrieved context chunks by causal-path
//! verification against the shared causal knowledge graph.
//!
//! Grounded in `causal_service.py::verify_mechanisms` — confirmed as the
//! live implementation since it's what `chat.py` actually imports, not the
//! superseded, unused `causal_filter.py::CausalFilter` whose different
//! (return-all) fallback is dead code in the original.

use std::sync::{Arc, RwLock};

use super::ner::extract_entities;
use super::CausalGraph;
use crate::error::DegradeReason;

/// Reranks context chunks against a hot-swappable shared graph, read by
/// cloning the `Arc` under the lock and dropping the lock before use so a
/// rebuild never blocks an in-flight verification.
pub struct CausalFilter {
    graph: Arc<RwLock<Arc<CausalGraph>>>,
}

impl CausalFilter {
    pub fn new(graph: Arc<RwLock<Arc<CausalGraph>>>) -> Self {
        Self { graph }
    }

    /// Reranks `context_chunks` by causal relevance to `query`, returning
    /// at most 3. Falls back to the first 3 chunks in input order when the
    /// query yields no entities, matching `verify_mechanisms`'s
    /// `if not query_entities: return context_chunks[:3]`.
    pub fn verify_mechanisms(&self, query: &str, context_chunks: &[String]) -> Vec<String> {
        let query_entities = extract_entities(query);
        if query_entities.is_empty() {
            let reason = DegradeReason::CausalGraphMissing("query yielded no entities".to_string());
            tracing::warn!(error = %reason, "bypassing causal filter, keeping first 3 chunks in input order");
            return context_chunks.iter().take(3).cloned().collect();
        }

        let graph = Arc::clone(&self.graph.read().expect("causal graph lock poisoned"));
        if graph.node_count() == 0 {
            let reason = DegradeReason::CausalGraphMissing("causal graph is empty".to_string());
            tracing::warn!(error = %reason, "bypassing causal filter, keeping first 3 chunks in input order");
            return context_chunks.iter().take(3).cloned().collect();
        }

        let mut scored: Vec<(&String, f32)> = context_chunks
            .iter()
            .map(|chunk| {
                let chunk_entities = extract_entities(chunk);
                let mut score = 0.0f32;
                for q in &query_entities {
                    for c in &chunk_entities {
                        if graph.contains_node(q) && graph.contains_node(c) && graph.has_path_either(q, c) {
                            score += 1.0;
                        }
                    }
                }
                (chunk, score)
            })
            .collect();

        // `sort_by` is stable, preserving input order among score ties,
        // matching Python's `list.sort(key=..., reverse=True)`.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        scored.into_iter().take(3).map(|(chunk, _)| chunk.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn falls_back_to_first_three_when_query_has_no_entities() {
        let graph = Arc::new(RwLock::new(Arc::new(CausalGraph::new())));
        let filter = CausalFilter::new(graph);
        let input = chunks(&["a", "b", "c", "d"]);
        let result = filter.verify_mechanisms("the and of", &input);
        assert_eq!(result, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn ranks_causally_connected_chunks_above_unconnected_ones() {
        let mut g = CausalGraph::new();
        g.add_causal_link("smoking", "lung damage", "causes", None);
        let graph = Arc::new(RwLock::new(Arc::new(g)));
        let filter = CausalFilter::new(graph);

        let input = chunks(&[
            "unrelated chunk about gardening",
            "lung damage from smoking is well documented",
        ]);
        let result = filter.verify_mechanisms("smoking", &input);
        assert_eq!(result[0], "lung damage from smoking is well documented");
    }

    #[test]
    fn ties_preserve_input_order() {
        let graph = Arc::new(RwLock::new(Arc::new(CausalGraph::new())));
        let filter = CausalFilter::new(graph);
        let input = chunks(&["first chunk", "second chunk", "third chunk"]);
        let result = filter.verify_mechanisms("smoking", &input);
        assert_eq!(result, input);
    }
}
