//! Conversational assistant backends used by the Account Classifier.
//!
//! An assistant works on threads: messages are appended to a thread, a run
//! (an asynchronous reasoning job) is started against it, and the run's
//! status is polled until it reaches a terminal state. Two backends exist:
//!
//! * [`crate::clients::openai_assistants::OpenAiAssistants`], the hosted
//!   OpenAI Assistants API
//! * [`ChatAssistant`], in-process threads whose runs are a single
//!   [`ChatModel`] call on a background task

use crate::error::ReceiptError;
use crate::pipeline::llm::ChatModel;
use crate::prompts::ASSISTANT_INSTRUCTIONS;
use async_trait::async_trait;
use edgequake_llm::ChatMessage;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

/// Status of an assistant run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed(String),
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed(_) | JobStatus::Expired
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Submitted => f.write_str("submitted"),
            JobStatus::Running => f.write_str("running"),
            JobStatus::Completed => f.write_str("completed"),
            JobStatus::Failed(_) => f.write_str("failed"),
            JobStatus::Expired => f.write_str("expired"),
        }
    }
}

/// Thread/run operations the Account Classifier needs.
///
/// Every call is a single attempt. Transport failures should be reported as
/// [`ReceiptError::ClassificationUpstream`].
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn create_thread(&self) -> Result<String, ReceiptError>;

    async fn append_user_message(&self, thread_id: &str, content: &str) -> Result<(), ReceiptError>;

    /// Start a run over the thread's messages; returns the run id.
    async fn start_run(&self, thread_id: &str) -> Result<String, ReceiptError>;

    async fn run_status(&self, thread_id: &str, run_id: &str) -> Result<JobStatus, ReceiptError>;

    /// Text of the newest assistant message produced by `run_id`.
    async fn latest_assistant_message(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Option<String>, ReceiptError>;

    /// Best-effort cancellation of an unfinished run.
    async fn cancel_run(&self, _thread_id: &str, _run_id: &str) -> Result<(), ReceiptError> {
        Ok(())
    }

    /// Best-effort cleanup of a per-run thread.
    async fn delete_thread(&self, _thread_id: &str) -> Result<(), ReceiptError> {
        Ok(())
    }
}

// ── In-process backend ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum RunOutcome {
    Running,
    Completed(String),
    Failed(String),
    Cancelled,
}

#[derive(Default)]
struct ThreadState {
    messages: Vec<ChatMessage>,
    runs: HashMap<String, RunOutcome>,
}

#[derive(Default)]
struct State {
    threads: HashMap<String, ThreadState>,
    tasks: HashMap<String, JoinHandle<()>>,
}

/// [`AssistantBackend`] that keeps threads in memory and answers each run
/// with one call to a [`ChatModel`].
///
/// The whole thread history goes into every call, so a shared thread sees
/// its earlier classifications just like a hosted assistant would.
pub struct ChatAssistant {
    model: Arc<dyn ChatModel>,
    instructions: String,
    state: Arc<Mutex<State>>,
    next_id: AtomicU64,
}

impl ChatAssistant {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            instructions: ASSISTANT_INSTRUCTIONS.to_string(),
            state: Arc::new(Mutex::new(State::default())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Number of live threads.
    pub fn thread_count(&self) -> usize {
        lock(&self.state).threads.len()
    }

    fn next(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unknown_thread(thread_id: &str) -> ReceiptError {
    ReceiptError::ClassificationUpstream {
        detail: format!("no such thread '{thread_id}'"),
    }
}

#[async_trait]
impl AssistantBackend for ChatAssistant {
    async fn create_thread(&self) -> Result<String, ReceiptError> {
        let id = self.next("thread");
        lock(&self.state)
            .threads
            .insert(id.clone(), ThreadState::default());
        Ok(id)
    }

    async fn append_user_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> Result<(), ReceiptError> {
        let mut state = lock(&self.state);
        let thread = state
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| unknown_thread(thread_id))?;
        thread.messages.push(ChatMessage::user(content));
        Ok(())
    }

    async fn start_run(&self, thread_id: &str) -> Result<String, ReceiptError> {
        let run_id = self.next("run");
        let mut state = lock(&self.state);
        let thread = state
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| unknown_thread(thread_id))?;

        let mut messages = Vec::with_capacity(thread.messages.len() + 1);
        messages.push(ChatMessage::system(&self.instructions));
        messages.extend(thread.messages.iter().cloned());
        thread.runs.insert(run_id.clone(), RunOutcome::Running);

        let model = Arc::clone(&self.model);
        let shared = Arc::clone(&self.state);
        let (tid, rid) = (thread_id.to_string(), run_id.clone());
        let handle = tokio::spawn(async move {
            let outcome = match model.chat(&messages).await {
                Ok(text) => RunOutcome::Completed(text),
                Err(e) => RunOutcome::Failed(e.to_string()),
            };
            let mut state = lock(&shared);
            state.tasks.remove(&rid);
            if let Some(thread) = state.threads.get_mut(&tid) {
                if let RunOutcome::Completed(ref text) = outcome {
                    thread.messages.push(ChatMessage::assistant(text.as_str()));
                }
                if matches!(thread.runs.get(&rid), Some(RunOutcome::Running)) {
                    thread.runs.insert(rid, outcome);
                }
            }
        });
        state.tasks.insert(run_id.clone(), handle);
        debug!("Started in-process run {} on {}", run_id, thread_id);
        Ok(run_id)
    }

    async fn run_status(&self, thread_id: &str, run_id: &str) -> Result<JobStatus, ReceiptError> {
        let state = lock(&self.state);
        let thread = state
            .threads
            .get(thread_id)
            .ok_or_else(|| unknown_thread(thread_id))?;
        match thread.runs.get(run_id) {
            Some(RunOutcome::Running) => Ok(JobStatus::Running),
            Some(RunOutcome::Completed(_)) => Ok(JobStatus::Completed),
            Some(RunOutcome::Failed(detail)) => Ok(JobStatus::Failed(detail.clone())),
            Some(RunOutcome::Cancelled) => Ok(JobStatus::Failed("cancelled".into())),
            None => Err(ReceiptError::ClassificationUpstream {
                detail: format!("no such run '{run_id}'"),
            }),
        }
    }

    async fn latest_assistant_message(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Option<String>, ReceiptError> {
        let state = lock(&self.state);
        let thread = state
            .threads
            .get(thread_id)
            .ok_or_else(|| unknown_thread(thread_id))?;
        Ok(match thread.runs.get(run_id) {
            Some(RunOutcome::Completed(text)) => Some(text.clone()),
            _ => None,
        })
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ReceiptError> {
        let mut state = lock(&self.state);
        if let Some(handle) = state.tasks.remove(run_id) {
            handle.abort();
        }
        if let Some(thread) = state.threads.get_mut(thread_id) {
            if matches!(thread.runs.get(run_id), Some(RunOutcome::Running)) {
                thread.runs.insert(run_id.to_string(), RunOutcome::Cancelled);
            }
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), ReceiptError> {
        let mut state = lock(&self.state);
        if let Some(thread) = state.threads.remove(thread_id) {
            for run_id in thread.runs.keys() {
                if let Some(handle) = state.tasks.remove(run_id) {
                    handle.abort();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::ModelCallError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Echoes how many user turns it was shown.
    struct Counter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for Counter {
        fn model_name(&self) -> &str {
            "counter"
        }
        async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ModelCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("seen {}", messages.len()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl ChatModel for Hanging {
        fn model_name(&self) -> &str {
            "hanging"
        }
        async fn chat(&self, _m: &[ChatMessage]) -> Result<String, ModelCallError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    async fn wait_terminal(a: &ChatAssistant, thread: &str, run: &str) -> JobStatus {
        for _ in 0..200 {
            let s = a.run_status(thread, run).await.unwrap();
            if s.is_terminal() {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run never finished");
    }

    #[tokio::test]
    async fn run_completes_and_history_grows() {
        let a = ChatAssistant::new(Arc::new(Counter {
            calls: AtomicUsize::new(0),
        }));
        let t = a.create_thread().await.unwrap();

        a.append_user_message(&t, "first").await.unwrap();
        let r1 = a.start_run(&t).await.unwrap();
        assert_eq!(wait_terminal(&a, &t, &r1).await, JobStatus::Completed);
        // system + 1 user
        assert_eq!(
            a.latest_assistant_message(&t, &r1).await.unwrap().as_deref(),
            Some("seen 2")
        );

        a.append_user_message(&t, "second").await.unwrap();
        let r2 = a.start_run(&t).await.unwrap();
        wait_terminal(&a, &t, &r2).await;
        // system + user + assistant + user
        assert_eq!(
            a.latest_assistant_message(&t, &r2).await.unwrap().as_deref(),
            Some("seen 4")
        );
    }

    #[tokio::test]
    async fn cancel_marks_run_failed() {
        let a = ChatAssistant::new(Arc::new(Hanging));
        let t = a.create_thread().await.unwrap();
        a.append_user_message(&t, "x").await.unwrap();
        let r = a.start_run(&t).await.unwrap();
        assert_eq!(a.run_status(&t, &r).await.unwrap(), JobStatus::Running);
        a.cancel_run(&t, &r).await.unwrap();
        assert!(matches!(
            a.run_status(&t, &r).await.unwrap(),
            JobStatus::Failed(_)
        ));
        assert_eq!(a.latest_assistant_message(&t, &r).await.unwrap(), None);
    }

    #[tokio::test]
    async fn threads_are_isolated_and_deletable() {
        let a = ChatAssistant::new(Arc::new(Counter {
            calls: AtomicUsize::new(0),
        }));
        let t1 = a.create_thread().await.unwrap();
        let t2 = a.create_thread().await.unwrap();
        assert_ne!(t1, t2);
        assert_eq!(a.thread_count(), 2);
        a.delete_thread(&t1).await.unwrap();
        assert_eq!(a.thread_count(), 1);
        assert!(a.append_user_message(&t1, "x").await.is_err());
    }
}
