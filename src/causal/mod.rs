//! Causal knowledge graph: a directed graph over lowercased entity
//! strings, connected by causal-verb edges, with a node-link JSON format
//! compatible with what `causal_service.py`'s `load_graph()`/`save_graph()`
//! produce/consume via networkx's `node_link_data`/`node_link_graph`.

pub mod builder;
pub mod filter;
pub mod ner;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

/// Edge payload: the causal verb phrase that licensed the link, and the
/// source document id when known (set by the offline builder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeLabel {
    pub mechanism: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_doc: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeEntry {
    id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LinkEntry {
    source: String,
    target: String,
    mechanism: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_doc: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeLinkData {
    directed: bool,
    multigraph: bool,
    graph: serde_json::Value,
    nodes: Vec<NodeEntry>,
    links: Vec<LinkEntry>,
}

/// Directed graph of causal entity relationships, keyed by entity text
/// rather than petgraph's internal node indices.
#[derive(Debug, Default)]
pub struct CausalGraph {
    graph: DiGraph<String, EdgeLabel>,
    index: HashMap<String, NodeIndex>,
}

impl CausalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn node_index(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            idx
        } else {
            let idx = self.graph.add_node(name.to_string());
            self.index.insert(name.to_string(), idx);
            idx
        }
    }

    /// Adds a directed `cause -> effect` edge, lowercasing both endpoints
    /// to match `add_causal_link`'s `cause.lower()`/`effect.lower()`.
    pub fn add_causal_link(&mut self, cause: &str, effect: &str, mechanism: &str, source_doc: Option<&str>) {
        let cause = cause.to_lowercase();
        let effect = effect.to_lowercase();
        let c = self.node_index(&cause);
        let e = self.node_index(&effect);
        self.graph.add_edge(
            c,
            e,
            EdgeLabel {
                mechanism: mechanism.to_string(),
                source_doc: source_doc.map(str::to_string),
            },
        );
    }

    /// True if a causal path connects `a` and `b` in either direction,
    /// matching `causal_service.py`'s
    /// `nx.has_path(g, a, b) or nx.has_path(g, b, a)`.
    pub fn has_path_either(&self, a: &str, b: &str) -> bool {
        let (Some(&ia), Some(&ib)) = (self.index.get(a), self.index.get(b)) else {
            return false;
        };
        has_path_connecting(&self.graph, ia, ib, None) || has_path_connecting(&self.graph, ib, ia, None)
    }

    /// Loads the graph from `path`'s node-link JSON, or returns an empty
    /// graph if the file is absent or fails to parse (matching the
    /// original's "no graph found -> initialize empty" behavior, extended
    /// to a corrupt-file degrade rather than propagating a parse error).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no causal graph found, initializing empty");
            return Ok(Self::new());
        }

        let contents = std::fs::read_to_string(path).context("reading causal graph file")?;
        let data: NodeLinkData = match serde_json::from_str(&contents) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "causal graph file unreadable, initializing empty");
                return Ok(Self::new());
            }
        };

        let mut g = Self::new();
        for node in &data.nodes {
            g.node_index(&node.id);
        }
        for link in data.links {
            let c = g.node_index(&link.source);
            let e = g.node_index(&link.target);
            g.graph.add_edge(
                c,
                e,
                EdgeLabel {
                    mechanism: link.mechanism,
                    source_doc: link.source_doc,
                },
            );
        }
        tracing::info!(nodes = g.node_count(), "loaded causal graph");
        Ok(g)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating causal graph directory")?;
        }

        let nodes = self
            .graph
            .node_indices()
            .map(|idx| NodeEntry {
                id: self.graph[idx].clone(),
            })
            .collect();
        let links = self
            .graph
            .edge_indices()
            .map(|idx| {
                let (a, b) = self
                    .graph
                    .edge_endpoints(idx)
                    .expect("edge index came from this graph's own edge_indices");
                let label = &self.graph[idx];
                LinkEntry {
                    source: self.graph[a].clone(),
                    target: self.graph[b].clone(),
                    mechanism: label.mechanism.clone(),
                    source_doc: label.source_doc.clone(),
                }
            })
            .collect();

        let data = NodeLinkData {
            directed: true,
            multigraph: false,
            graph: serde_json::json!({}),
            nodes,
            links,
        };
        let json = serde_json::to_vec(&data).context("serializing causal graph")?;
        std::fs::write(path, json).context("writing causal graph file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_path_either_matches_transitive_forward_and_backward() {
        let mut g = CausalGraph::new();
        g.add_causal_link("smoking", "lung damage", "causes", None);
        g.add_causal_link("lung damage", "shortness of breath", "causes", None);

        assert!(g.has_path_either("smoking", "shortness of breath"));
        assert!(g.has_path_either("shortness of breath", "smoking"));
        assert!(!g.has_path_either("smoking", "unrelated thing"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");

        let mut g = CausalGraph::new();
        g.add_causal_link("Rainfall", "Flooding", "causes", Some("doc-1"));
        g.save(&path).unwrap();

        let loaded = CausalGraph::load(&path).unwrap();
        assert_eq!(loaded.node_count(), 2);
        assert!(loaded.has_path_either("rainfall", "flooding"));
    }

    #[test]
    fn load_missing_file_yields_empty_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let g = CausalGraph::load(&path).unwrap();
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn load_corrupt_file_degrades_to_empty_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, "not json").unwrap();
        let g = CausalGraph::load(&path).unwrap();
        assert_eq!(g.node_count(), 0);
    }
}
