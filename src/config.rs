//! Configuration types for receipt processing.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. Secrets are deliberately absent: the HTTP
//! collaborators in [`crate::clients`] receive their tokens directly, so a
//! config can be logged or cloned across runs without leaking anything.

use crate::error::ReceiptError;
use crate::progress::ProgressCallback;
use crate::retry::{Backoff, RetryPolicy};
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default model for receipt extraction. Must accept image input.
pub const DEFAULT_VISION_MODEL: &str = "gpt-4o";

/// Default model for category inference and the in-process assistant.
pub const DEFAULT_TEXT_MODEL: &str = "gpt-4o";

/// Configuration for receipt processing.
///
/// # Example
/// ```rust
/// use receipt_ledger::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .vision_model("gpt-4o")
///     .max_search_results(5)
///     .classification_timeout_secs(60)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    /// If None along with the pre-built providers, auto-detected from env.
    pub provider_name: Option<String>,

    /// Model used by the Structured Extractor. Default: [`DEFAULT_VISION_MODEL`].
    pub vision_model: String,

    /// Model used by the Category Inferrer. Default: [`DEFAULT_TEXT_MODEL`].
    pub text_model: String,

    /// Pre-constructed provider for the extractor. Takes precedence over `provider_name`.
    pub vision_provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed provider for text calls. Takes precedence over `provider_name`.
    pub text_provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    ///
    /// Receipt transcription and category labelling both want the most
    /// likely answer, not a creative one.
    pub temperature: f32,

    /// Maximum tokens per model completion. Default: 1024.
    pub max_tokens: usize,

    /// Per-model-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Retries for transient stage failures. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Upper bound on search snippets. Range 1–10. Default: 10.
    pub max_search_results: usize,

    /// Longest edge of the rasterised PDF page in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// JPEG quality of the rasterised PDF page. Range 1–100. Default: 85.
    pub jpeg_quality: u8,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Account Classifier polling schedule.
    pub poll: PollPolicy,

    /// Whether classification turns share one assistant thread.
    pub thread_policy: ThreadPolicy,

    /// Custom extraction system instruction. If None, uses the built-in one.
    pub system_prompt: Option<String>,

    /// Fail extraction when line items do not add up to the total. Default: false.
    pub strict_totals: bool,

    /// Stage progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provider_name: None,
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            vision_provider: None,
            text_provider: None,
            temperature: 0.0,
            max_tokens: 1024,
            api_timeout_secs: 60,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_search_results: 10,
            max_rendered_pixels: 2000,
            jpeg_quality: 85,
            download_timeout_secs: 120,
            poll: PollPolicy::default(),
            thread_policy: ThreadPolicy::default(),
            system_prompt: None,
            strict_totals: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("provider_name", &self.provider_name)
            .field("vision_model", &self.vision_model)
            .field("text_model", &self.text_model)
            .field(
                "vision_provider",
                &self.vision_provider.as_ref().map(|_| "<dyn LLMProvider>"),
            )
            .field(
                "text_provider",
                &self.text_provider.as_ref().map(|_| "<dyn LLMProvider>"),
            )
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("max_search_results", &self.max_search_results)
            .field("poll", &self.poll)
            .field("thread_policy", &self.thread_policy)
            .field("strict_totals", &self.strict_totals)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_backoff_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn vision_model(mut self, model: impl Into<String>) -> Self {
        self.config.vision_model = model.into();
        self
    }

    pub fn text_model(mut self, model: impl Into<String>) -> Self {
        self.config.text_model = model.into();
        self
    }

    pub fn vision_provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.vision_provider = Some(provider);
        self
    }

    pub fn text_provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.text_provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_search_results(mut self, n: usize) -> Self {
        self.config.max_search_results = n.clamp(1, 10);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn poll(mut self, poll: PollPolicy) -> Self {
        self.config.poll = poll;
        self
    }

    pub fn classification_timeout_secs(mut self, secs: u64) -> Self {
        self.config.poll.deadline = Duration::from_secs(secs);
        self
    }

    pub fn thread_policy(mut self, policy: ThreadPolicy) -> Self {
        self.config.thread_policy = policy;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn strict_totals(mut self, v: bool) -> Self {
        self.config.strict_totals = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ReceiptError> {
        let c = &self.config;
        if c.vision_model.trim().is_empty() || c.text_model.trim().is_empty() {
            return Err(ReceiptError::InvalidConfig(
                "Model names must not be empty".into(),
            ));
        }
        if c.max_search_results == 0 || c.max_search_results > 10 {
            return Err(ReceiptError::InvalidConfig(format!(
                "max_search_results must be 1–10, got {}",
                c.max_search_results
            )));
        }
        if c.poll.deadline.is_zero() {
            return Err(ReceiptError::InvalidConfig(
                "Classification deadline must be > 0".into(),
            ));
        }
        if c.poll.initial_interval > c.poll.max_interval {
            return Err(ReceiptError::InvalidConfig(format!(
                "Poll interval {:?} exceeds its cap {:?}",
                c.poll.initial_interval, c.poll.max_interval
            )));
        }
        if let ThreadPolicy::Shared(ref id) = c.thread_policy {
            if id.trim().is_empty() {
                return Err(ReceiptError::InvalidConfig(
                    "Shared thread id must not be empty".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Where account-classification turns are appended.
///
/// A hosted assistant thread accumulates every turn ever sent to it. Sharing
/// one across runs keeps the assistant's earlier decisions in view but means
/// concurrent runs must take turns; an isolated thread per run has no such
/// coupling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ThreadPolicy {
    /// Create a fresh thread for every classification. (default)
    #[default]
    PerRun,
    /// Reuse one long-lived thread, serialised behind a mutex.
    Shared(String),
}

/// Polling schedule for asynchronous classification jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// First wait after the job is submitted. Default: 500 ms.
    pub initial_interval: Duration,
    /// Longest single wait between polls. Default: 5 s.
    pub max_interval: Duration,
    /// Total time allowed before the job is abandoned. Default: 120 s.
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(120),
        }
    }
}

impl PollPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_interval, self.max_interval)
    }
}
