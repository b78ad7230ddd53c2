//! Account classification through an assistant thread.
//!
//! One classification is a small job state machine:
//!
//! ```text
//! SUBMITTED ──poll──▶ RUNNING ──▶ COMPLETED | FAILED | EXPIRED
//! ```
//!
//! The turn is appended to a thread, a run is started and its status is
//! polled with exponential backoff until it is terminal, the deadline passes,
//! or the run is cancelled. Only a COMPLETED run's answer is read back, and
//! only a label from the closed account set is accepted.
//!
//! With [`ThreadPolicy::PerRun`] each classification gets a fresh thread, so
//! concurrent runs cannot read each other's answers. With
//! [`ThreadPolicy::Shared`] the append→run→poll→read sequence holds a lock for
//! the whole exchange.

use crate::assistant::{AssistantBackend, JobStatus};
use crate::config::{PollPolicy, ThreadPolicy};
use crate::error::ReceiptError;
use crate::pipeline::recover::{recover_object, strip_fences};
use crate::prompts::account_prompt;
use crate::record::{AccountClassification, AccountLabel, BusinessCategory, ReceiptRecord};
use crate::retry::sleep_or_cancel;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stage name reported in cancellation errors.
pub const STAGE: &str = "account";

const LABEL_KEYS: &[&str] = &["판단", "label", "account"];
const REASON_KEYS: &[&str] = &["근거", "justification", "reason"];

/// The Account Classifier.
pub struct AccountClassifier {
    backend: Arc<dyn AssistantBackend>,
    threads: ThreadPolicy,
    poll: PollPolicy,
    shared_lock: tokio::sync::Mutex<()>,
}

impl AccountClassifier {
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        threads: ThreadPolicy,
        poll: PollPolicy,
    ) -> Self {
        Self {
            backend,
            threads,
            poll,
            shared_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn classify(
        &self,
        record: &ReceiptRecord,
        category: &BusinessCategory,
        cancel: &CancellationToken,
    ) -> Result<AccountClassification, ReceiptError> {
        let prompt = account_prompt(record, category.as_str());

        let answer = match &self.threads {
            ThreadPolicy::PerRun => {
                let thread = self.backend.create_thread().await?;
                let result = self.exchange(&thread, &prompt, cancel).await;
                if let Err(e) = self.backend.delete_thread(&thread).await {
                    warn!("Could not delete assistant thread {}: {}", thread, e);
                }
                result?
            }
            ThreadPolicy::Shared(thread) => {
                let _guard = tokio::select! {
                    guard = self.shared_lock.lock() => guard,
                    _ = cancel.cancelled() => {
                        return Err(ReceiptError::Cancelled { stage: STAGE.into() });
                    }
                };
                self.exchange(thread, &prompt, cancel).await?
            }
        };

        parse_classification(&answer)
    }

    /// Append the turn, run it, and wait for the answer.
    async fn exchange(
        &self,
        thread: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ReceiptError> {
        self.backend.append_user_message(thread, prompt).await?;
        let run = self.backend.start_run(thread).await?;
        debug!("Classification run {} started on {}", run, thread);

        match self.await_completion(thread, &run, cancel).await {
            Ok(()) => {}
            // A terminal run needs no cancel; anything else may still be active.
            Err(e @ ReceiptError::ClassificationJobFailed { .. }) => return Err(e),
            Err(e) => {
                self.abandon(thread, &run).await;
                return Err(e);
            }
        }

        self.backend
            .latest_assistant_message(thread, &run)
            .await?
            .ok_or_else(|| ReceiptError::ClassificationJobFailed {
                status: JobStatus::Completed.to_string(),
                detail: "run produced no assistant message".into(),
            })
    }

    /// Poll `run` until it completes. Leaves cancelling the run to the caller.
    async fn await_completion(
        &self,
        thread: &str,
        run: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReceiptError> {
        let start = Instant::now();
        let backoff = self.poll.backoff();
        let mut attempt = 0u32;

        loop {
            match self.backend.run_status(thread, run).await? {
                JobStatus::Completed => break,
                status @ (JobStatus::Failed(_) | JobStatus::Expired) => {
                    let detail = match &status {
                        JobStatus::Failed(d) => d.clone(),
                        _ => "run expired before completing".to_string(),
                    };
                    return Err(ReceiptError::ClassificationJobFailed {
                        status: status.to_string(),
                        detail,
                    });
                }
                JobStatus::Submitted | JobStatus::Running => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= self.poll.deadline {
                return Err(ReceiptError::ClassificationTimeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }

            let wait = backoff.delay(attempt).min(self.poll.deadline - elapsed);
            if !sleep_or_cancel(wait, cancel).await {
                return Err(ReceiptError::Cancelled { stage: STAGE.into() });
            }
            attempt += 1;
        }

        debug!(
            "Classification run {} completed after {} polls in {:?}",
            run,
            attempt + 1,
            start.elapsed()
        );
        Ok(())
    }

    async fn abandon(&self, thread: &str, run: &str) {
        if let Err(e) = self.backend.cancel_run(thread, run).await {
            warn!("Could not cancel classification run {}: {}", run, e);
        }
    }
}

/// Turn an assistant answer into a validated classification.
///
/// The expected answer is `{"판단": label, "근거": justification}`. Answers
/// without JSON are accepted only when they name exactly one label.
pub fn parse_classification(answer: &str) -> Result<AccountClassification, ReceiptError> {
    let text = strip_fences(answer);

    if let Ok(obj) = recover_object(text) {
        let raw_label = LABEL_KEYS.iter().find_map(|k| obj.get(*k));
        if let Some(raw) = raw_label {
            let raw = value_text(raw);
            let label = AccountLabel::parse(&raw)
                .ok_or(ReceiptError::InvalidAccountLabel { label: raw })?;
            let justification = REASON_KEYS
                .iter()
                .find_map(|k| obj.get(*k))
                .map(value_text)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| text.to_string());
            return Ok(AccountClassification {
                label,
                justification,
            });
        }
    }

    match AccountLabel::mentioned_in(text).as_slice() {
        [label] => Ok(AccountClassification {
            label: *label,
            justification: text.to_string(),
        }),
        _ => Err(ReceiptError::InvalidAccountLabel {
            label: text.chars().take(80).collect(),
        }),
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}
