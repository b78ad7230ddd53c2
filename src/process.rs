//! Handling one shared receipt end to end.
//!
//! ```text
//! input ──▶ pipeline (6 stages) ──▶ upload ──▶ persist ──▶ notify
//! ```
//!
//! The pipeline decides everything; this layer only moves the file and the
//! result to the collaborators. A record is written only after every stage
//! succeeded, and a failure notification names the step that broke.
//! Notification problems are logged and never change the outcome.

use crate::clients::{Notifier, ObjectStore, RecordStore};
use crate::error::ReceiptError;
use crate::orchestrator::{Pipeline, StageFailure};
use crate::pipeline::input::{self, ResolvedInput};
use crate::record::{format_amount, PipelineOutput};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Step names used in [`StageFailure`] for work outside the pipeline.
pub const INPUT_STEP: &str = "input";
pub const UPLOAD_STEP: &str = "upload";
pub const PERSIST_STEP: &str = "persist";

pub const SAVED_MESSAGE: &str = "데이터가 성공적으로 Notion에 저장되었습니다.";
pub const DOWNLOAD_FAILED_MESSAGE: &str = "파일 다운로드에 실패했습니다.";

/// Result of a fully handled receipt.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub file_name: String,
    pub output: PipelineOutput,
    /// `None` on a dry run.
    pub file_url: Option<String>,
    /// `None` on a dry run.
    pub record_id: Option<String>,
}

#[derive(Clone)]
struct Persistence {
    storage: Arc<dyn ObjectStore>,
    records: Arc<dyn RecordStore>,
}

/// Runs the pipeline for one receipt and hands the result on.
///
/// Without [`ReceiptProcessor::with_persistence`] the processor is a dry
/// run: nothing is uploaded or written.
#[derive(Clone)]
pub struct ReceiptProcessor {
    pipeline: Arc<Pipeline>,
    persistence: Option<Persistence>,
    notifier: Option<Arc<dyn Notifier>>,
    download_token: Option<String>,
    download_timeout_secs: u64,
}

impl ReceiptProcessor {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            persistence: None,
            notifier: None,
            download_token: None,
            download_timeout_secs: 120,
        }
    }

    pub fn with_persistence(
        mut self,
        storage: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        self.persistence = Some(Persistence { storage, records });
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Bearer token for downloading private file URLs.
    pub fn with_download_token(mut self, token: Option<String>) -> Self {
        self.download_token = token;
        self
    }

    pub fn with_download_timeout_secs(mut self, secs: u64) -> Self {
        self.download_timeout_secs = secs.max(1);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.persistence.is_none()
    }

    /// Resolve `input` (path or URL) and process it.
    pub async fn process_input(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, StageFailure> {
        let resolved = match input::resolve_input(
            input,
            self.download_token.as_deref(),
            self.download_timeout_secs,
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(error) => {
                if input::is_url(input) {
                    self.notify(DOWNLOAD_FAILED_MESSAGE).await;
                }
                return Err(StageFailure {
                    stage: INPUT_STEP.to_string(),
                    error,
                });
            }
        };

        if resolved.was_downloaded() {
            self.notify(&format!(
                "파일 '{}'을 성공적으로 다운로드했습니다.",
                resolved.file_name()
            ))
            .await;
        }

        self.process_file(&resolved, cancel).await
    }

    /// Process a receipt already on disk.
    pub async fn process_file(
        &self,
        resolved: &ResolvedInput,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, StageFailure> {
        let file_name = resolved.file_name();
        let result = self.handle(resolved, &file_name, cancel).await;

        match &result {
            Ok(outcome) => {
                if !self.is_dry_run() {
                    self.notify(SAVED_MESSAGE).await;
                    self.notify(&classification_summary(&outcome.output)).await;
                }
            }
            Err(failure) => {
                warn!("'{}' failed at {}: {}", file_name, failure.stage, failure.error);
                self.notify(&failure_message(&file_name, failure)).await;
            }
        }
        result
    }

    async fn handle(
        &self,
        resolved: &ResolvedInput,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, StageFailure> {
        let at = |stage: &str| {
            let stage = stage.to_string();
            move |error: ReceiptError| StageFailure { stage, error }
        };

        let upload = resolved.read_upload().await.map_err(at(INPUT_STEP))?;
        let output = self.pipeline.run_detailed(upload, cancel).await?;

        let Some(persistence) = &self.persistence else {
            info!("Dry run: '{}' processed, nothing stored", file_name);
            return Ok(ProcessOutcome {
                file_name: file_name.to_string(),
                output,
                file_url: None,
                record_id: None,
            });
        };

        if cancel.is_cancelled() {
            return Err(at(UPLOAD_STEP)(ReceiptError::Cancelled {
                stage: UPLOAD_STEP.into(),
            }));
        }

        let file_url = persistence
            .storage
            .upload(resolved.path(), file_name)
            .await
            .map_err(at(UPLOAD_STEP))?;
        let record_id = persistence
            .records
            .create_record(&output, &file_url)
            .await
            .map_err(at(PERSIST_STEP))?;

        info!("'{}' stored as record {}", file_name, record_id);
        Ok(ProcessOutcome {
            file_name: file_name.to_string(),
            output,
            file_url: Some(file_url),
            record_id: Some(record_id),
        })
    }

    async fn notify(&self, text: &str) {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.post(text).await {
                warn!("Notification dropped: {}", e);
            }
        }
    }
}

/// Korean name of a pipeline stage or processing step.
pub fn step_label(stage: &str) -> &str {
    match stage {
        "classify" => "파일 분류",
        "normalize" => "이미지 변환",
        "extract" => "영수증 정보 추출",
        "search" => "업종 검색",
        "infer" => "업종 판단",
        "account" => "비목 분류",
        INPUT_STEP => "파일 읽기",
        UPLOAD_STEP => "파일 업로드",
        PERSIST_STEP => "Notion 저장",
        other => other,
    }
}

pub fn failure_message(file_name: &str, failure: &StageFailure) -> String {
    format!(
        "영수증 '{}' 처리에 실패했습니다.\n실패 단계: {} ({})\n사유: {}",
        file_name,
        step_label(&failure.stage),
        failure.stage,
        failure.error
    )
}

/// The classification posted after a successful save.
pub fn classification_summary(output: &PipelineOutput) -> String {
    format!(
        "비목: {}\n근거: {}\n상호명: {} / 업종: {} / 총액: {}원",
        output.account.label.ledger_name(),
        output.account.justification,
        output.receipt.merchant,
        output.category,
        format_amount(output.receipt.total)
    )
}
