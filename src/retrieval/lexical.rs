//! In-memory TF-IDF index.
//!
//! Chunks are added through [`LexicalIndexBuilder`], which counts terms per
//! chunk and document frequency across the corpus. [`LexicalIndexBuilder::finish`]
//! fixes the idf table once:
//!
//! ```text
//! idf(t) = ln((N + 1) / (df(t) + 1)) + 1
//! ```
//!
//! and weights every chunk term as `count(t) * idf(t)`. Queries are scored
//! against that snapshot with cosine similarity; query terms that never
//! appeared in the corpus carry no weight.

use std::collections::HashMap;

use crate::chunk::tokenize;

use super::RankedChunk;

/// Inverse document frequency for a term seen in `df` of `n` chunks.
pub fn idf(n: usize, df: usize) -> f64 {
    ((n as f64 + 1.0) / (df as f64 + 1.0)).ln() + 1.0
}

#[derive(Debug)]
struct LexicalChunk {
    source_id: String,
    text: String,
    weights: HashMap<String, f64>,
    norm: f64,
}

/// Immutable TF-IDF index.
#[derive(Debug, Default)]
pub struct LexicalIndex {
    chunks: Vec<LexicalChunk>,
    idf: HashMap<String, f64>,
}

impl LexicalIndex {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn idf_of(&self, term: &str) -> Option<f64> {
        self.idf.get(term).copied()
    }

    /// Score every chunk against `query`.
    ///
    /// Returns hits with a positive score in chunk order; thresholding and
    /// ordering are left to [`rank_hits`](super::rank_hits).
    pub fn score(&self, query: &str) -> Vec<RankedChunk> {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for term in tokenize(query) {
            if self.idf.contains_key(&term) {
                *counts.entry(term).or_insert(0.0) += 1.0;
            }
        }
        if counts.is_empty() {
            return Vec::new();
        }

        let query_weights: Vec<(String, f64)> = counts
            .into_iter()
            .map(|(term, count)| {
                let weight = count * self.idf[&term];
                (term, weight)
            })
            .collect();
        let query_norm = query_weights
            .iter()
            .map(|(_, w)| w * w)
            .sum::<f64>()
            .sqrt();
        if query_norm == 0.0 {
            return Vec::new();
        }

        self.chunks
            .iter()
            .filter(|chunk| chunk.norm > 0.0)
            .filter_map(|chunk| {
                let dot: f64 = query_weights
                    .iter()
                    .filter_map(|(term, w)| chunk.weights.get(term).map(|cw| w * cw))
                    .sum();
                if dot <= 0.0 {
                    return None;
                }
                Some(RankedChunk {
                    source_id: chunk.source_id.clone(),
                    text: chunk.text.clone(),
                    score: dot / (query_norm * chunk.norm),
                })
            })
            .collect()
    }
}

/// Accumulates chunks before the idf table is fixed.
#[derive(Debug, Default)]
pub struct LexicalIndexBuilder {
    pending: Vec<(String, String, HashMap<String, usize>)>,
    document_frequency: HashMap<String, usize>,
}

impl LexicalIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&mut self, source_id: &str, text: String) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for term in tokenize(&text) {
            *counts.entry(term).or_insert(0) += 1;
        }
        for term in counts.keys() {
            *self.document_frequency.entry(term.clone()).or_insert(0) += 1;
        }
        self.pending.push((source_id.to_string(), text, counts));
    }

    pub fn chunk_count(&self) -> usize {
        self.pending.len()
    }

    pub fn finish(self) -> LexicalIndex {
        let n = self.pending.len();
        let idf_table: HashMap<String, f64> = self
            .document_frequency
            .into_iter()
            .map(|(term, df)| (term, idf(n, df)))
            .collect();

        let chunks = self
            .pending
            .into_iter()
            .map(|(source_id, text, counts)| {
                let weights: HashMap<String, f64> = counts
                    .into_iter()
                    .map(|(term, count)| {
                        let weight = count as f64 * idf_table[&term];
                        (term, weight)
                    })
                    .collect();
                let norm = weights.values().map(|w| w * w).sum::<f64>().sqrt();
                LexicalChunk {
                    source_id,
                    text,
                    weights,
                    norm,
                }
            })
            .collect();

        LexicalIndex {
            chunks,
            idf: idf_table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::rank_hits;

    fn build(chunks: &[(&str, &str)]) -> LexicalIndex {
        let mut builder = LexicalIndexBuilder::new();
        for (source, text) in chunks {
            builder.add_chunk(source, text.to_string());
        }
        builder.finish()
    }

    #[test]
    fn idf_decreases_with_document_frequency() {
        assert!(idf(10, 1) > idf(10, 2));
        assert!(idf(10, 2) > idf(10, 9));
        assert!((idf(1, 1) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn exact_terms_score_one() {
        let index = build(&[("a.txt", "rate limiting")]);
        let hits = index.score("Rate LIMITING");
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn document_frequency_counts_once_per_chunk() {
        let index = build(&[("a", "alpha alpha alpha"), ("b", "beta")]);
        // N = 2, df(alpha) = 1
        assert!((index.idf_of("alpha").unwrap() - idf(2, 1)).abs() < 1e-12);
    }

    #[test]
    fn unseen_terms_are_dropped() {
        let index = build(&[("a", "alpha beta")]);
        assert!(index.score("gamma delta").is_empty());
        let with_unseen = index.score("alpha gamma");
        let without = index.score("alpha");
        assert!((with_unseen[0].score - without[0].score).abs() < 1e-12);
    }

    #[test]
    fn short_and_empty_queries_score_nothing() {
        let index = build(&[("a", "alpha beta")]);
        assert!(index.score("").is_empty());
        assert!(index.score("a b c !").is_empty());
    }

    #[test]
    fn rarer_terms_rank_higher() {
        let index = build(&[
            ("common1", "shared words here"),
            ("common2", "shared words there"),
            ("rare", "shared unique"),
        ]);
        let ranked = rank_hits(index.score("unique shared"), 0.0, 3);
        assert_eq!(ranked[0].source_id, "rare");
    }

    #[test]
    fn threshold_filters_weak_matches() {
        let index = build(&[("a", "alpha beta gamma delta epsilon zeta eta theta")]);
        let hits = index.score("alpha");
        assert!(hits[0].score < 0.5);
        assert!(rank_hits(hits, 0.5, 5).is_empty());
    }

    #[test]
    fn empty_index_scores_nothing() {
        let index = LexicalIndexBuilder::new().finish();
        assert!(index.is_empty());
        assert!(index.score("anything").is_empty());
    }
}
