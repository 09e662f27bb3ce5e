//! Progress notification seam.
//!
//! Long-running operations report through a [`NoticeSink`] so embedding
//! progress can surface in whatever UI hosts the index. The default sink
//! drops everything.

/// A progress event emitted by long-running operations.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    /// Embedding progress after a batch lands.
    EmbedProgress {
        /// Entities embedded so far this run.
        done: usize,
        /// Entities queued at the start of the run.
        total: usize,
        /// Observed embedding throughput.
        tokens_per_sec: f64,
    },
    /// An embedding run finished.
    EmbedComplete {
        /// Entities embedded during the run.
        total: usize,
    },
    /// The run stopped early at a batch boundary after a pause request.
    EmbedPaused {
        /// Entities embedded before the pause took effect.
        done: usize,
        /// Entities queued at the start of the run.
        total: usize,
    },
}

/// Receives progress events.
pub trait NoticeSink: Send + Sync {
    /// Handles one event. Implementations must not block.
    fn notify(&self, notice: Notice);
}

/// Sink that discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotices;

impl NoticeSink for NullNotices {
    fn notify(&self, _notice: Notice) {}
}
