//! Error types for the receipt-ledger library.
//!
//! Every fallible operation returns [`ReceiptError`]. A receipt run is
//! all-or-nothing: any stage failure aborts the remaining stages and nothing
//! is persisted, so there is no separate non-fatal error type.
//!
//! Variants are grouped by the stage that raises them. [`ReceiptError::kind`]
//! collapses them onto the coarse [`ErrorKind`] taxonomy used for
//! user-visible failure messages, and [`ReceiptError::is_retryable`] tells the
//! orchestrator which failures are worth another attempt.

use crate::record::FileKind;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the receipt-ledger library.
#[derive(Debug, Error)]
pub enum ReceiptError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Receipt file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection and token.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The upload contained no bytes at all.
    #[error("Uploaded file '{name}' is empty")]
    EmptyUpload { name: String },

    // ── Decode errors ─────────────────────────────────────────────────────
    /// The PDF renderer or image codec could not produce a frame.
    #[error("Could not decode {kind} upload: {detail}")]
    DecodeFailed { kind: FileKind, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Extraction errors ─────────────────────────────────────────────────
    /// The vision model call itself failed (network, auth, quota, timeout).
    #[error("Vision model call failed: {detail}")]
    ExtractionUpstream { detail: String },

    /// The model response contained no `{…}` region at all.
    #[error("No JSON object found in model response: {preview:?}")]
    NoJsonObject { preview: String },

    /// A `{…}` region was found but none of the candidates parsed.
    #[error("Model response contained malformed JSON: {detail}")]
    MalformedJson { detail: String },

    /// A required receipt field was absent from the recovered JSON.
    #[error("Receipt field '{field}' is missing from the model response")]
    MissingField { field: String },

    /// A receipt field was present but had an unusable value.
    #[error("Receipt field '{field}' is invalid: {detail}")]
    InvalidField { field: String, detail: String },

    // ── Search / inference errors ─────────────────────────────────────────
    /// The external search call failed. Zero results is not an error.
    #[error("Search request failed: {detail}")]
    SearchFailed { detail: String },

    /// The category inference model call failed.
    #[error("Category inference failed: {detail}")]
    InferenceFailed { detail: String },

    // ── Classification errors ─────────────────────────────────────────────
    /// A call to the assistant backend failed.
    #[error("Assistant request failed: {detail}")]
    ClassificationUpstream { detail: String },

    /// The reasoning job finished in a terminal non-success state.
    #[error("Classification job ended as {status}: {detail}")]
    ClassificationJobFailed { status: String, detail: String },

    /// The reasoning job did not finish before the polling deadline.
    #[error("Classification job did not finish within {elapsed_ms}ms")]
    ClassificationTimeout { elapsed_ms: u64 },

    /// The assistant answered with a label outside the closed account set.
    #[error("Assistant returned an unknown account label: {label:?}")]
    InvalidAccountLabel { label: String },

    // ── Orchestration errors ──────────────────────────────────────────────
    /// Pipeline wiring bug: a stage read or wrote a key it did not declare,
    /// or its declared inputs cannot be produced by earlier stages.
    #[error("Stage contract violated by '{stage}': {detail}")]
    ContractViolation { stage: String, detail: String },

    /// The run was cancelled before `stage` completed.
    #[error("Receipt processing cancelled during '{stage}'")]
    Cancelled { stage: String },

    // ── Collaborator errors ───────────────────────────────────────────────
    /// Object storage rejected the upload.
    #[error("Failed to upload '{name}': {reason}")]
    UploadFailed { name: String, reason: String },

    /// The record store rejected the new record.
    #[error("Failed to persist receipt record: {reason}")]
    PersistFailed { reason: String },

    /// The notification channel rejected a message.
    #[error("Failed to post notification: {reason}")]
    NotifyFailed { reason: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error taxonomy shared by every stage and collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Input,
    Decode,
    Extraction,
    Search,
    Inference,
    Classification,
    ContractViolation,
    Cancelled,
    Upload,
    Persist,
    Notify,
    Config,
    Internal,
}

impl ReceiptError {
    /// Which part of the taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        use ReceiptError::*;
        match self {
            FileNotFound { .. }
            | PermissionDenied { .. }
            | InvalidInput { .. }
            | DownloadFailed { .. }
            | DownloadTimeout { .. }
            | EmptyUpload { .. } => ErrorKind::Input,
            DecodeFailed { .. } | PdfiumBindingFailed(_) => ErrorKind::Decode,
            ExtractionUpstream { .. }
            | NoJsonObject { .. }
            | MalformedJson { .. }
            | MissingField { .. }
            | InvalidField { .. } => ErrorKind::Extraction,
            SearchFailed { .. } => ErrorKind::Search,
            InferenceFailed { .. } => ErrorKind::Inference,
            ClassificationUpstream { .. }
            | ClassificationJobFailed { .. }
            | ClassificationTimeout { .. }
            | InvalidAccountLabel { .. } => ErrorKind::Classification,
            ContractViolation { .. } => ErrorKind::ContractViolation,
            Cancelled { .. } => ErrorKind::Cancelled,
            UploadFailed { .. } => ErrorKind::Upload,
            PersistFailed { .. } => ErrorKind::Persist,
            NotifyFailed { .. } => ErrorKind::Notify,
            ProviderNotConfigured { .. } | InvalidConfig(_) => ErrorKind::Config,
            Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator may re-run the failing stage.
    ///
    /// Only single upstream calls are transient. Malformed or incomplete
    /// model output is a property of the answer, not the transport, and a
    /// terminal job state or an exhausted deadline has already waited long
    /// enough.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReceiptError::ExtractionUpstream { .. }
                | ReceiptError::SearchFailed { .. }
                | ReceiptError::InferenceFailed { .. }
                | ReceiptError::ClassificationUpstream { .. }
        )
    }

    pub(crate) fn contract(stage: &str, detail: impl Into<String>) -> Self {
        ReceiptError::ContractViolation {
            stage: stage.to_string(),
            detail: detail.into(),
        }
    }
}
