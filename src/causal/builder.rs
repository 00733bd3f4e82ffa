//! Offline causal-graph construction from document text.
//!
//! Grounded verbatim in `build_causal_graph.py`: the same ten-verb-phrase
//! causal lexicon, 50000-char processing windows, per-sentence verb
//! substring split into `(cause, effect)` halves, entity extraction with
//! fallback to the last token of the cause / first token of the effect,
//! and the `len(c) > 2 and len(e) > 2` filter.

use super::ner::extract_entities;
use super::CausalGraph;

const CHUNK_SIZE: usize = 50_000;

const CAUSAL_VERBS: &[&str] = &[
    "lead to",
    "leads to",
    "caused",
    "causes",
    "resulted in",
    "results in",
    "triggered",
    "triggers",
    "produced",
    "produces",
];

fn floor_char_boundary(text: &str, idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    let mut idx = idx;
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn split_sentences(text: &str) -> Vec<&str> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Entity spans for one half of a causal sentence, falling back to a
/// single boundary token when no entity-like span is found, mirroring
/// `[ent.text for ent in nlp(text).ents] or [text.split()[-1]]` (cause) /
/// `or [text.split()[0]]` (effect).
fn entities_or_fallback<'a>(text: &'a str, fallback: impl Fn(&'a str) -> Option<&'a str>) -> Vec<String> {
    let ents = extract_entities(text);
    if !ents.is_empty() {
        return ents;
    }
    fallback(text).map(|w| vec![w.to_string()]).unwrap_or_default()
}

/// Scans `documents` (pairs of `(source_doc_id, content)`) for causal verb
/// phrases and adds `cause -> effect` edges to `graph`, processing each
/// document in `CHUNK_SIZE`-char windows to bound memory the way the
/// original's `range(0, len(text), chunk_size)` loop does.
pub fn build_causal_graph<'a>(graph: &mut CausalGraph, documents: impl IntoIterator<Item = (&'a str, &'a str)>) {
    for (doc_id, text) in documents {
        if text.is_empty() {
            continue;
        }

        let mut window_start = 0usize;
        while window_start < text.len() {
            let window_end = (window_start + CHUNK_SIZE).min(text.len());
            let start = floor_char_boundary(text, window_start);
            let end = floor_char_boundary(text, window_end);
            if start < end {
                process_window(graph, &text[start..end], doc_id);
            }
            window_start = window_end;
        }
    }
}

fn process_window(graph: &mut CausalGraph, window: &str, doc_id: &str) {
    for sentence in split_sentences(window) {
        let lower = sentence.to_lowercase();
        for verb in CAUSAL_VERBS {
            if !lower.contains(verb) {
                continue;
            }
            let parts: Vec<&str> = lower.split(verb).collect();
            if parts.len() != 2 {
                continue;
            }
            let cause_text = parts[0].trim();
            let effect_text = parts[1].trim();
            if cause_text.is_empty() || effect_text.is_empty() {
                continue;
            }

            let causes = entities_or_fallback(cause_text, |t| t.split_whitespace().last());
            let effects = entities_or_fallback(effect_text, |t| t.split_whitespace().next());

            for c in &causes {
                for e in &effects {
                    if c.len() > 2 && e.len() > 2 {
                        graph.add_causal_link(c, e, verb, Some(doc_id));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_causal_link_from_verb_phrase() {
        let mut g = CausalGraph::new();
        build_causal_graph(&mut g, [("doc-1", "Heavy rainfall causes severe flooding downstream.")]);
        assert!(g.has_path_either("rainfall", "flooding") || g.has_path_either("rainfall", "severe flooding"));
    }

    #[test]
    fn skips_sentences_with_repeated_verb_occurrences() {
        let mut g = CausalGraph::new();
        // "causes" appears twice, so split() yields 3 parts and no link is added.
        build_causal_graph(&mut g, [("doc-1", "A causes B and B causes C.")]);
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn short_entity_fragments_are_filtered_out() {
        let mut g = CausalGraph::new();
        build_causal_graph(&mut g, [("doc-1", "It causes it.")]);
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn empty_document_is_skipped() {
        let mut g = CausalGraph::new();
        build_causal_graph(&mut g, [("doc-1", "")]);
        assert_eq!(g.node_count(), 0);
    }
}
