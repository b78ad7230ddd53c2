//! # receipt-ledger
//!
//! Turn a shared receipt (photo or PDF) into a booked expense record using
//! Vision Language Models, web search and a conversational assistant.
//!
//! ## Pipeline Overview
//!
//! ```text
//! receipt file
//!  │
//!  ├─ 1. Classify   PDF or image, by byte signature
//!  ├─ 2. Normalize  one base64 frame (pdfium renders page 1 of a PDF)
//!  ├─ 3. Extract    vision model → {상호명, 날짜, 항목, 총액}
//!  ├─ 4. Search     merchant + items → web snippets
//!  ├─ 5. Infer      snippets → business category (카페, 식당, 교통 …)
//!  └─ 6. Account    assistant run → 회의비 / 식비 / 교통비 + justification
//! ```
//!
//! Every stage declares the context keys it reads and writes; the
//! [`Pipeline`] validates that wiring once and enforces it on every run.
//! After a successful run, [`ReceiptProcessor`] uploads the file, writes the
//! record and posts notifications.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use receipt_ledger::clients::GoogleSearch;
//! use receipt_ledger::{Pipeline, PipelineConfig, RawUpload};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::default();
//!     let search = Arc::new(GoogleSearch::new("api-key", "engine-id")?);
//!     let pipeline = Pipeline::from_config(&config, search, None)?;
//!
//!     let upload = RawUpload::new(std::fs::read("receipt.jpg")?, "receipt.jpg");
//!     let output = pipeline.run(upload, &CancellationToken::new()).await?;
//!     println!("{} → {}", output.receipt.merchant, output.account.label.ledger_name());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `receipt-ledger` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! receipt-ledger = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod assistant;
pub mod clients;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod record;
pub mod retry;
pub mod stages;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use assistant::{AssistantBackend, ChatAssistant, JobStatus};
pub use config::{PipelineConfig, PipelineConfigBuilder, PollPolicy, ThreadPolicy};
pub use context::{ContextKey, ContextValue, ContextView, PipelineContext};
pub use error::{ErrorKind, ReceiptError};
pub use orchestrator::{Pipeline, PipelineComponents, Stage, StageFailure};
pub use process::{ProcessOutcome, ReceiptProcessor};
pub use progress::{NoopProgressCallback, ProgressCallback, StageProgressCallback};
pub use record::{
    AccountClassification, AccountLabel, BusinessCategory, FileKind, LineItem, NormalizedImage,
    PipelineOutput, RawUpload, ReceiptRecord, SearchSnippetSet,
};
pub use retry::RetryPolicy;
