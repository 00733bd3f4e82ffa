//! Text-only TF-IDF cosine similarity, used only as the degraded-mode
//! fallback for `similarity_to_parent` when the embedding service is
//! unavailable (spec.md §9's Open Question). Grounded in
//! `original_source/app/services/state_manager.py`'s
//! `_calculate_basic_similarity` (scikit-learn `TfidfVectorizer` +
//! `cosine_similarity` over exactly two documents).

use std::collections::HashMap;

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn term_frequencies(tokens: &[String]) -> HashMap<&str, f64> {
    let mut counts: HashMap<&str, f64> = HashMap::new();
    for t in tokens {
        *counts.entry(t.as_str()).or_insert(0.0) += 1.0;
    }
    let total = tokens.len().max(1) as f64;
    for v in counts.values_mut() {
        *v /= total;
    }
    counts
}

/// Cosine similarity between the TF-IDF vectors of two short texts, with
/// IDF computed over just the two-document corpus `{a, b}` (the same
/// degenerate-but-workable corpus the original's per-call
/// `TfidfVectorizer.fit_transform([parent, child])` uses). Returns 0.0 for
/// empty input, matching the original's exception-returns-0.0 behavior.
pub fn tfidf_cosine_similarity(a: &str, b: &str) -> f32 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let tf_a = term_frequencies(&tokens_a);
    let tf_b = term_frequencies(&tokens_b);

    let mut vocab: Vec<&str> = tf_a.keys().chain(tf_b.keys()).copied().collect();
    vocab.sort_unstable();
    vocab.dedup();

    let idf = |term: &str| -> f64 {
        let df = usize::from(tf_a.contains_key(term)) + usize::from(tf_b.contains_key(term));
        (1.0 + 2.0 / df as f64).ln() + 1.0
    };

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for term in &vocab {
        let weight = idf(term);
        let va = tf_a.get(term).copied().unwrap_or(0.0) * weight;
        let vb = tf_b.get(term).copied().unwrap_or(0.0) * weight;
        dot += va * vb;
        norm_a += va * va;
        norm_b += vb * vb;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    ((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_has_similarity_one() {
        let s = tfidf_cosine_similarity("the quick brown fox", "the quick brown fox");
        assert!((s - 1.0).abs() < 1e-4);
    }

    #[test]
    fn disjoint_vocabularies_have_similarity_zero() {
        let s = tfidf_cosine_similarity("apples and oranges", "quantum mechanics lecture");
        assert_eq!(s, 0.0);
    }

    #[test]
    fn empty_text_returns_zero() {
        assert_eq!(tfidf_cosine_similarity("", "something"), 0.0);
    }
}
