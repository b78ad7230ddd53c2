//! Progress-callback trait for per-stage pipeline events.
//!
//! Inject an [`Arc<dyn StageProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to observe a
//! run as it moves through its stages. Several runs may share one callback,
//! so every event carries the upload's filename.
//!
//! # Example
//!
//! ```rust
//! use receipt_ledger::{PipelineConfig, StageProgressCallback};
//! use std::sync::Arc;
//!
//! struct Log;
//!
//! impl StageProgressCallback for Log {
//!     fn on_stage_complete(&self, file: &str, stage: &str, _index: usize, _total: usize, elapsed_ms: u64) {
//!         eprintln!("{file}: {stage} done in {elapsed_ms}ms");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(Log) as Arc<dyn StageProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the orchestrator as a run moves through its stages.
///
/// All methods default to no-ops. Implementations must be `Send + Sync`
/// because concurrent runs report through the same callback.
pub trait StageProgressCallback: Send + Sync {
    /// Called once before the first stage.
    fn on_run_start(&self, file: &str, total_stages: usize) {
        let _ = (file, total_stages);
    }

    /// Called before a stage is invoked (once per attempt).
    ///
    /// `index` is 1-based.
    fn on_stage_start(&self, file: &str, stage: &str, index: usize, total: usize) {
        let _ = (file, stage, index, total);
    }

    /// Called after a stage's outputs were accepted into the context.
    fn on_stage_complete(
        &self,
        file: &str,
        stage: &str,
        index: usize,
        total: usize,
        elapsed_ms: u64,
    ) {
        let _ = (file, stage, index, total, elapsed_ms);
    }

    /// Called when a stage fails for good (retries exhausted or not retryable).
    fn on_stage_error(&self, file: &str, stage: &str, index: usize, total: usize, error: &str) {
        let _ = (file, stage, index, total, error);
    }

    /// Called once after the run finished or aborted.
    fn on_run_complete(&self, file: &str, success: bool) {
        let _ = (file, success);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl StageProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn StageProgressCallback>;
