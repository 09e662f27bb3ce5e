//! Embedding model seam and batch pipeline.
//!
//! The crate never talks to a model vendor directly; callers hand in an
//! [`EmbedModel`] implementation and the pipeline feeds it batches sized to
//! the model's own limits.

mod pipeline;

pub use pipeline::{embed_jobs, round_vec, truncate_to_budget, EmbedJob, TRUNCATION_MARKER};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// One embedded input as returned by the model.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbedOutput {
    /// The embedding vector, `dims()` long.
    pub vec: Vec<f32>,
    /// Tokens the model consumed for this input.
    pub tokens: u32,
}

/// An embedding model adapter.
///
/// Implementations wrap whatever actually produces vectors (a local model,
/// a remote API). All limits are the model's own; the pipeline respects
/// them rather than configuring its own.
#[async_trait]
pub trait EmbedModel: Send + Sync {
    /// Stable identifier; embedding records are stored under this key.
    fn model_key(&self) -> &str;

    /// Output vector dimensionality.
    fn dims(&self) -> usize;

    /// Maximum tokens per input.
    fn max_tokens(&self) -> u32;

    /// Preferred inputs per batch call.
    fn batch_size(&self) -> usize;

    /// Counts tokens for a candidate input without embedding it.
    fn count_tokens(&self, text: &str) -> u32;

    /// Embeds a batch of inputs, one output per input, in order.
    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<EmbedOutput>>;
}

/// Shared handle to the active model.
///
/// Passed explicitly to the operations that need it; there is no global
/// model registry.
#[derive(Clone)]
pub struct ModelContext {
    /// The active embedding model.
    pub model: Arc<dyn EmbedModel>,
}

impl ModelContext {
    /// Wraps a model in a context handle.
    pub fn new(model: Arc<dyn EmbedModel>) -> Self {
        Self { model }
    }

    /// The active model's key.
    pub fn model_key(&self) -> &str {
        self.model.model_key()
    }
}
