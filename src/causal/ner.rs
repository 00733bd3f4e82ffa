//! Heuristic entity extraction: the nearest Rust-without-spaCy proxy for
//! `causal_service.py::_extract_entities`'s
//! `[ent.text for ent in doc.ents] + [token.lemma_ for token in doc if
//! token.pos_ in ("NOUN", "PROPN")]`. No lemmatizer is present anywhere in
//! the pack, so surface form stands in for lemma — a documented degraded
//! mode, not a faithful NER reimplementation.

use std::collections::HashSet;
use std::sync::LazyLock;

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "the", "a", "an", "and", "or", "but", "if", "then", "else", "of", "to", "in", "on", "for",
        "with", "as", "by", "at", "from", "this", "that", "these", "those", "is", "are", "was",
        "were", "be", "been", "being", "it", "its", "he", "she", "they", "them", "his", "her",
        "their", "which", "who", "what", "when", "where", "why", "how", "not", "no", "so", "than",
        "too", "very", "can", "will", "just", "also", "into", "over", "about",
    ]
    .into_iter()
    .collect()
});

fn is_titlecase_word(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => chars.all(|c| c.is_lowercase() || c.is_numeric()),
        _ => false,
    }
}

/// Contiguous runs of Title-Case tokens, the proxy for named entities
/// (`doc.ents`).
fn proper_noun_runs(text: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for word in text.split_whitespace() {
        let trimmed = word.trim_matches(|c: char| !c.is_alphanumeric());
        if trimmed.len() > 1 && is_titlecase_word(trimmed) {
            current.push(trimmed);
        } else if !current.is_empty() {
            runs.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        runs.push(current.join(" "));
    }
    runs
}

/// Stopword-filtered alphabetic tokens of length > 2: the proxy for
/// `token.pos_ in ("NOUN", "PROPN")` lemmas.
fn noun_like_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && w.chars().all(char::is_alphabetic))
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(w.as_str()))
        .collect()
}

/// Extracts a deduplicated, lowercased list of candidate entity strings
/// from `text`, matching `_extract_entities`'s `ents ∪ NOUN/PROPN lemmas`
/// contract.
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for entity in proper_noun_runs(text).into_iter().map(|e| e.to_lowercase()) {
        if seen.insert(entity.clone()) {
            out.push(entity);
        }
    }
    for token in noun_like_tokens(text) {
        if seen.insert(token.clone()) {
            out.push(token);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_proper_noun_run_and_noun_like_tokens() {
        let entities = extract_entities("Rising Sea Levels threaten coastal cities");
        assert!(entities.contains(&"rising sea levels".to_string()));
        assert!(entities.contains(&"threaten".to_string()));
        assert!(entities.contains(&"coastal".to_string()));
        assert!(entities.contains(&"cities".to_string()));
    }

    #[test]
    fn stopwords_are_excluded() {
        let entities = extract_entities("this and that");
        assert!(entities.is_empty());
    }

    #[test]
    fn short_tokens_are_excluded() {
        let entities = extract_entities("ab cd ef");
        assert!(entities.is_empty());
    }
}
