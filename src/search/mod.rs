//! Nearest-neighbor search over stored embeddings.

mod filter;
mod nearest;

pub use filter::{QueryFilter, DEFAULT_LIMIT};
pub use nearest::{cos_sim, median_vec, Connection, TopK};

use crate::entity::EntityStore;

/// Scans all embedded entities and returns the `filter.limit` nearest to
/// `query`, passing the filter, ordered by descending similarity.
pub fn nearest(
    store: &EntityStore,
    model_key: &str,
    query: &[f32],
    filter: &QueryFilter,
) -> Vec<Connection> {
    let mut acc = TopK::new(filter.limit);
    for entity in store.iter() {
        if entity.flags().deleted || !filter.matches(entity.key()) {
            continue;
        }
        if let Some(vec) = entity.vec(model_key) {
            acc.push(Connection {
                key: entity.key().to_string(),
                score: cos_sim(query, vec),
            });
        }
    }
    acc.into_sorted()
}
