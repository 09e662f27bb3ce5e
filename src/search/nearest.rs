//! Cosine similarity, bounded top-k accumulation, and vector aggregation.

use serde::{Deserialize, Serialize};

/// One scored search result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Entity key of the result.
    pub key: String,
    /// Similarity score, higher is closer.
    pub score: f32,
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 when either vector has zero norm or the lengths differ, so
/// degenerate embeddings rank last instead of poisoning the result set.
pub fn cos_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Bounded accumulator keeping the k highest-scoring results seen.
///
/// Eviction uses strict greater-than, so on score ties the incumbent wins
/// and results stay stable across runs with the same scan order.
#[derive(Debug)]
pub struct TopK {
    k: usize,
    items: Vec<Connection>,
}

impl TopK {
    /// Accumulator keeping at most `k` results.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            items: Vec::with_capacity(k.min(64)),
        }
    }

    /// Offers one candidate.
    pub fn push(&mut self, candidate: Connection) {
        if self.k == 0 {
            return;
        }
        if self.items.len() < self.k {
            self.items.push(candidate);
            return;
        }
        let (min_idx, min_score) = self
            .items
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.score))
            .fold((0, f32::INFINITY), |acc, cur| {
                if cur.1 < acc.1 {
                    cur
                } else {
                    acc
                }
            });
        if candidate.score > min_score {
            self.items[min_idx] = candidate;
        }
    }

    /// Consumes the accumulator, returning results ordered by descending
    /// score (insertion order preserved on ties).
    pub fn into_sorted(mut self) -> Vec<Connection> {
        self.items
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        self.items
    }

    /// Number of results accumulated so far.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Per-dimension median of a set of vectors.
///
/// Used as a stand-in source vector when a note has embedded blocks but no
/// source-level embedding. Returns `None` for an empty set. Dimensions are
/// taken from the longest vector; shorter vectors simply contribute fewer
/// samples to the tail dimensions.
pub fn median_vec(vecs: &[&[f32]]) -> Option<Vec<f32>> {
    let dims = vecs.iter().map(|v| v.len()).max()?;
    if dims == 0 {
        return None;
    }
    let mut out = Vec::with_capacity(dims);
    let mut column = Vec::with_capacity(vecs.len());
    for d in 0..dims {
        column.clear();
        for v in vecs {
            if let Some(x) = v.get(d) {
                column.push(*x);
            }
        }
        column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = column.len() / 2;
        let median = if column.len() % 2 == 1 {
            column[mid]
        } else {
            (column[mid - 1] + column[mid]) / 2.0
        };
        out.push(median);
    }
    Some(out)
}
