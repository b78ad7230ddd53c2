//! Pipeline orchestration: fixed stage sequence, contracts, retry, cancellation.
//!
//! ## Contracts
//!
//! Every [`Stage`] declares the context keys it reads and writes.
//! [`Pipeline::new`] checks the wiring once, before any run: each input must
//! be produced by an earlier stage, no key may be produced twice, and the
//! final context must hold every field of [`PipelineOutput`]. At run time a
//! stage sees only its declared inputs and must return exactly its declared
//! outputs. Any breach is a [`ReceiptError::ContractViolation`].
//!
//! ## Failure policy
//!
//! A failed stage aborts the run and the partial context is dropped. Errors
//! for which [`ReceiptError::is_retryable`] holds are re-attempted with
//! exponential backoff up to [`RetryPolicy::max_retries`] times; everything
//! else fails immediately.
//!
//! ## Cancellation
//!
//! The [`CancellationToken`] is checked before each stage and during retry
//! backoff, and is handed to stages that wait internally (account polling).

use crate::assistant::{AssistantBackend, ChatAssistant};
use crate::config::PipelineConfig;
use crate::context::{ContextKey, ContextValue, ContextView, PipelineContext};
use crate::error::ReceiptError;
use crate::pipeline::account::AccountClassifier;
use crate::pipeline::encode::ImageNormalizer;
use crate::pipeline::extract::ReceiptExtractor;
use crate::pipeline::infer::CategoryInferrer;
use crate::pipeline::llm::{models_from_config, ChatModel};
use crate::pipeline::render::{PageRasterizer, PdfiumRasterizer};
use crate::pipeline::search::{CategorySearcher, SearchEngine};
use crate::progress::ProgressCallback;
use crate::record::{PipelineOutput, RawUpload};
use crate::retry::{sleep_or_cancel, RetryPolicy};
use crate::stages::{
    AccountStage, ClassifyStage, ExtractStage, InferStage, NormalizeStage, SearchStage,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Keys the final context must contain for [`PipelineContext::into_output`].
const FINAL_KEYS: &[ContextKey] = &[
    ContextKey::FileKind,
    ContextKey::Receipt,
    ContextKey::Snippets,
    ContextKey::Category,
    ContextKey::Account,
];

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Keys this stage reads.
    fn inputs(&self) -> &'static [ContextKey];

    /// Keys this stage writes, each exactly once.
    fn outputs(&self) -> &'static [ContextKey];

    async fn run(
        &self,
        view: ContextView<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContextValue>, ReceiptError>;
}

/// A failed run, with the stage that failed.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: String,
    pub error: ReceiptError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage '{}' failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for StageFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Collaborators the standard pipeline is assembled from.
#[derive(Clone)]
pub struct PipelineComponents {
    pub vision: Arc<dyn ChatModel>,
    pub text: Arc<dyn ChatModel>,
    pub search: Arc<dyn SearchEngine>,
    pub assistant: Arc<dyn AssistantBackend>,
    pub rasterizer: Arc<dyn PageRasterizer>,
}

/// A validated, reusable stage sequence. Cheap to share behind `Arc`.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    retry: RetryPolicy,
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("retry", &self.retry)
            .finish()
    }
}

impl Pipeline {
    /// Validate the wiring of `stages` and build a pipeline.
    pub fn new(stages: Vec<Arc<dyn Stage>>, retry: RetryPolicy) -> Result<Self, ReceiptError> {
        validate(&stages)?;
        Ok(Self {
            stages,
            retry,
            progress: None,
        })
    }

    /// The six-stage receipt pipeline over `components`.
    pub fn standard(
        components: PipelineComponents,
        config: &PipelineConfig,
    ) -> Result<Self, ReceiptError> {
        let mut extractor = ReceiptExtractor::new(components.vision)
            .with_strict_totals(config.strict_totals);
        if let Some(ref prompt) = config.system_prompt {
            extractor = extractor.with_system_prompt(prompt.clone());
        }

        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(ClassifyStage),
            Arc::new(NormalizeStage(ImageNormalizer::new(
                components.rasterizer,
                config.jpeg_quality,
            ))),
            Arc::new(ExtractStage(extractor)),
            Arc::new(SearchStage(CategorySearcher::new(
                components.search,
                config.max_search_results,
            ))),
            Arc::new(InferStage(CategoryInferrer::new(components.text))),
            Arc::new(AccountStage(AccountClassifier::new(
                components.assistant,
                config.thread_policy.clone(),
                config.poll.clone(),
            ))),
        ];

        let mut pipeline = Self::new(stages, config.retry_policy())?;
        pipeline.progress = config.progress_callback.clone();
        Ok(pipeline)
    }

    /// The standard pipeline with models resolved from `config`, a pdfium
    /// rasterizer, and, unless `assistant` is given, an in-process
    /// [`ChatAssistant`] over the text model.
    pub fn from_config(
        config: &PipelineConfig,
        search: Arc<dyn SearchEngine>,
        assistant: Option<Arc<dyn AssistantBackend>>,
    ) -> Result<Self, ReceiptError> {
        let (vision, text) = models_from_config(config)?;
        let assistant: Arc<dyn AssistantBackend> = match assistant {
            Some(backend) => backend,
            None => Arc::new(ChatAssistant::new(Arc::clone(&text))),
        };
        let components = PipelineComponents {
            vision,
            text,
            search,
            assistant,
            rasterizer: Arc::new(PdfiumRasterizer::new(None, config.max_rendered_pixels)),
        };
        Self::standard(components, config)
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage and collect the result.
    pub async fn run(
        &self,
        upload: RawUpload,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput, ReceiptError> {
        self.run_detailed(upload, cancel)
            .await
            .map_err(|failure| failure.error)
    }

    /// Like [`Pipeline::run`] but reports which stage failed.
    pub async fn run_detailed(
        &self,
        upload: RawUpload,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput, StageFailure> {
        self.run_to_context(upload, cancel)
            .await?
            .into_output()
            .map_err(|error| StageFailure {
                stage: "pipeline".into(),
                error,
            })
    }

    /// Run every stage and return the raw context.
    pub async fn run_to_context(
        &self,
        upload: RawUpload,
        cancel: &CancellationToken,
    ) -> Result<PipelineContext, StageFailure> {
        let file = upload.filename.clone();
        let total = self.stages.len();
        let run_start = Instant::now();
        let mut ctx = PipelineContext::new(upload);

        if let Some(cb) = &self.progress {
            cb.on_run_start(&file, total);
        }

        for (i, stage) in self.stages.iter().enumerate() {
            let index = i + 1;
            let fail = |error: ReceiptError| {
                if let Some(cb) = &self.progress {
                    cb.on_stage_error(&file, stage.name(), index, total, &error.to_string());
                    cb.on_run_complete(&file, false);
                }
                StageFailure {
                    stage: stage.name().to_string(),
                    error,
                }
            };

            if cancel.is_cancelled() {
                return Err(fail(ReceiptError::Cancelled {
                    stage: stage.name().into(),
                }));
            }

            let stage_start = Instant::now();
            let values = match self
                .run_stage(stage.as_ref(), &ctx, &file, index, total, cancel)
                .await
            {
                Ok(values) => values,
                Err(e) => {
                    warn!("{}: stage '{}' failed: {}", file, stage.name(), e);
                    return Err(fail(e));
                }
            };

            if let Err(e) = accept(&mut ctx, stage.as_ref(), values) {
                return Err(fail(e));
            }

            let elapsed_ms = stage_start.elapsed().as_millis() as u64;
            info!("{}: stage '{}' done in {}ms", file, stage.name(), elapsed_ms);
            if let Some(cb) = &self.progress {
                cb.on_stage_complete(&file, stage.name(), index, total, elapsed_ms);
            }
        }

        info!(
            "{}: pipeline complete in {}ms",
            file,
            run_start.elapsed().as_millis()
        );
        if let Some(cb) = &self.progress {
            cb.on_run_complete(&file, true);
        }
        Ok(ctx)
    }

    /// Invoke one stage, retrying transient failures.
    async fn run_stage(
        &self,
        stage: &dyn Stage,
        ctx: &PipelineContext,
        file: &str,
        index: usize,
        total: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContextValue>, ReceiptError> {
        let mut attempt = 0u32;
        loop {
            if let Some(cb) = &self.progress {
                cb.on_stage_start(file, stage.name(), index, total);
            }

            let view = ctx.view(stage.name(), stage.inputs());
            match stage.run(view, cancel).await {
                Ok(values) => return Ok(values),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff.delay(attempt);
                    attempt += 1;
                    warn!(
                        "{}: stage '{}' retry {}/{} after {:?}: {}",
                        file,
                        stage.name(),
                        attempt,
                        self.retry.max_retries,
                        delay,
                        e
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(ReceiptError::Cancelled {
                            stage: stage.name().into(),
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Check a stage's returned values against its declared outputs, then
/// write them.
fn accept(
    ctx: &mut PipelineContext,
    stage: &dyn Stage,
    values: Vec<ContextValue>,
) -> Result<(), ReceiptError> {
    let declared: BTreeSet<ContextKey> = stage.outputs().iter().copied().collect();
    let mut produced = BTreeSet::new();
    for value in &values {
        let key = value.key();
        if !declared.contains(&key) {
            return Err(ReceiptError::contract(
                stage.name(),
                format!("wrote undeclared output '{key}'"),
            ));
        }
        if !produced.insert(key) {
            return Err(ReceiptError::contract(
                stage.name(),
                format!("wrote output '{key}' more than once"),
            ));
        }
    }
    if let Some(missing) = declared.difference(&produced).next() {
        return Err(ReceiptError::contract(
            stage.name(),
            format!("did not produce declared output '{missing}'"),
        ));
    }

    for value in values {
        ctx.insert(stage.name(), value)?;
    }
    Ok(())
}

/// Static wiring check, run once when a pipeline is built.
fn validate(stages: &[Arc<dyn Stage>]) -> Result<(), ReceiptError> {
    let mut available: BTreeSet<ContextKey> = BTreeSet::from([ContextKey::Upload]);

    for stage in stages {
        for input in stage.inputs() {
            if !available.contains(input) {
                return Err(ReceiptError::contract(
                    stage.name(),
                    format!("input '{input}' is not produced by any earlier stage"),
                ));
            }
        }
        if stage.outputs().is_empty() {
            return Err(ReceiptError::contract(stage.name(), "declares no outputs"));
        }
        for output in stage.outputs() {
            if !available.insert(*output) {
                return Err(ReceiptError::contract(
                    stage.name(),
                    format!("output '{output}' is already produced earlier"),
                ));
            }
        }
    }

    if let Some(missing) = FINAL_KEYS.iter().find(|k| !available.contains(*k)) {
        return Err(ReceiptError::contract(
            "pipeline",
            format!("no stage produces '{missing}'"),
        ));
    }
    Ok(())
}
