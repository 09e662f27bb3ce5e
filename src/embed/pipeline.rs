//! Batch embedding helpers: token-budget truncation, batch execution with
//! per-item fallback, and vector rounding.

use tracing::{debug, warn};

use super::{EmbedModel, EmbedOutput};
use crate::error::Result;
use crate::types::EmbeddingRecord;

/// One queued embedding unit: an entity key and its resolved input text.
#[derive(Clone, Debug)]
pub struct EmbedJob {
    /// Entity key the resulting record belongs to.
    pub key: String,
    /// Input text (breadcrumbs plus content).
    pub input: String,
}

/// Rounds vector components to 8 decimal places.
///
/// Keeps persisted fragments stable across runs regardless of float noise
/// in the model output.
pub fn round_vec(vec: Vec<f32>) -> Vec<f32> {
    vec.into_iter()
        .map(|x| (x as f64 * 1e8).round() as f32 / 1e8)
        .collect()
}

/// Suffix appended to every truncated input so the model sees the cut.
pub const TRUNCATION_MARKER: &str = "...";

/// Shrinks `text` until the model's token count fits its budget.
///
/// An input already within budget passes through untouched. An oversized
/// one has its character count cut by the ratio `budget / measured`,
/// scaled down a further 10% so the loop converges instead of oscillating
/// around the boundary, and carries [`TRUNCATION_MARKER`] as a suffix
/// (counted in the re-measure). Returns the fitted text and its final
/// token count.
pub fn truncate_to_budget(model: &dyn EmbedModel, text: &str) -> (String, u32) {
    let budget = model.max_tokens();
    let measured = model.count_tokens(text);
    if measured <= budget {
        return (text.to_string(), measured);
    }
    let mut body: Vec<char> = text.chars().collect();
    let mut measured = measured;
    loop {
        let keep = ((budget as f64 / measured as f64) * 0.9 * body.len() as f64) as usize;
        // Guarantee forward progress even when the ratio rounds to no-op.
        body.truncate(keep.min(body.len().saturating_sub(1)));
        if body.is_empty() {
            return (String::new(), model.count_tokens(""));
        }
        let candidate: String = body.iter().collect::<String>() + TRUNCATION_MARKER;
        measured = model.count_tokens(&candidate);
        debug!(measured, budget, kept = body.len(), "truncating oversized embed input");
        if measured <= budget {
            return (candidate, measured);
        }
    }
}

/// Embeds a set of jobs, returning one record per job in order.
///
/// The whole set goes to the model as one batch first; if that call fails,
/// each input is retried alone so one bad input cannot sink its batchmates.
/// A job that still fails gets an empty-vector record carrying the error,
/// which keeps it out of the retry queue until its content changes.
pub async fn embed_jobs(
    model: &dyn EmbedModel,
    jobs: &[EmbedJob],
) -> Vec<(String, EmbeddingRecord)> {
    let mut fitted: Vec<String> = Vec::with_capacity(jobs.len());
    for job in jobs {
        let (text, _) = truncate_to_budget(model, &job.input);
        fitted.push(text);
    }

    let outputs = match model.embed_batch(&fitted).await {
        Ok(outputs) if outputs.len() == jobs.len() => {
            outputs.into_iter().map(Ok).collect::<Vec<_>>()
        }
        Ok(outputs) => {
            warn!(
                expected = jobs.len(),
                got = outputs.len(),
                "model returned wrong batch size, retrying items singly"
            );
            embed_singly(model, &fitted).await
        }
        Err(e) => {
            warn!(error = %e, batch = jobs.len(), "batch embed failed, retrying items singly");
            embed_singly(model, &fitted).await
        }
    };

    jobs.iter()
        .zip(outputs)
        .map(|(job, outcome)| {
            let record = match outcome {
                Ok(out) => EmbeddingRecord::new(round_vec(out.vec), out.tokens),
                Err(e) => {
                    warn!(key = %job.key, error = %e, "embedding failed");
                    EmbeddingRecord::failed(e.to_string())
                }
            };
            (job.key.clone(), record)
        })
        .collect()
}

async fn embed_singly(
    model: &dyn EmbedModel,
    inputs: &[String],
) -> Vec<Result<EmbedOutput>> {
    let mut results = Vec::with_capacity(inputs.len());
    for input in inputs {
        let single = std::slice::from_ref(input);
        let outcome = match model.embed_batch(single).await {
            Ok(mut outputs) if outputs.len() == 1 => Ok(outputs.remove(0)),
            Ok(_) => Err(crate::error::NoteMeshError::model(
                "model returned wrong output count for single input",
            )),
            Err(e) => Err(e),
        };
        results.push(outcome);
    }
    results
}
