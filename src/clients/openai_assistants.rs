//! Hosted OpenAI Assistants (threads, messages, runs) as an
//! [`AssistantBackend`].
//!
//! Messages are read back filtered by the run that produced them, so two
//! runs on a shared thread never pick up each other's answer.

use super::{describe_send_error, http_client, read_json, trim_base, DEFAULT_HTTP_TIMEOUT};
use crate::assistant::{AssistantBackend, JobStatus};
use crate::error::ReceiptError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::debug;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
const BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

#[derive(Clone)]
pub struct OpenAiAssistants {
    http: Client,
    api_key: String,
    assistant_id: String,
    base_url: String,
}

impl fmt::Debug for OpenAiAssistants {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiAssistants")
            .field("api_key", &"[REDACTED]")
            .field("assistant_id", &self.assistant_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    content: Vec<Value>,
}

impl Message {
    /// Concatenated text parts; image and file parts are skipped.
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| part.pointer("/text/value").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl OpenAiAssistants {
    pub fn new(
        api_key: impl Into<String>,
        assistant_id: impl Into<String>,
    ) -> Result<Self, ReceiptError> {
        Ok(Self {
            http: http_client(DEFAULT_HTTP_TIMEOUT)?,
            api_key: api_key.into(),
            assistant_id: assistant_id.into(),
            base_url: OPENAI_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = trim_base(base_url);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.api_key).header(BETA_HEADER.0, BETA_HEADER.1)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: RequestBuilder,
    ) -> Result<T, ReceiptError> {
        let response = self
            .authed(req)
            .send()
            .await
            .map_err(|e| ReceiptError::ClassificationUpstream {
                detail: describe_send_error(e),
            })?;
        read_json(response)
            .await
            .map_err(|detail| ReceiptError::ClassificationUpstream { detail })
    }
}

/// Map the API's run status onto [`JobStatus`].
fn map_status(run: RunObject) -> JobStatus {
    match run.status.as_str() {
        "queued" => JobStatus::Submitted,
        "in_progress" | "requires_action" | "cancelling" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "expired" => JobStatus::Expired,
        other => {
            let detail = match run.last_error {
                Some(err) if !err.message.is_empty() => format!("{}: {}", err.code, err.message),
                _ => other.to_string(),
            };
            JobStatus::Failed(detail)
        }
    }
}

#[async_trait]
impl AssistantBackend for OpenAiAssistants {
    async fn create_thread(&self) -> Result<String, ReceiptError> {
        let created: Created = self
            .send(self.http.post(self.url("threads")).json(&json!({})))
            .await?;
        debug!("Created assistant thread {}", created.id);
        Ok(created.id)
    }

    async fn append_user_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> Result<(), ReceiptError> {
        let _: Value = self
            .send(
                self.http
                    .post(self.url(&format!("threads/{}/messages", thread_id)))
                    .json(&json!({ "role": "user", "content": content })),
            )
            .await?;
        Ok(())
    }

    async fn start_run(&self, thread_id: &str) -> Result<String, ReceiptError> {
        let created: Created = self
            .send(
                self.http
                    .post(self.url(&format!("threads/{}/runs", thread_id)))
                    .json(&json!({ "assistant_id": self.assistant_id })),
            )
            .await?;
        debug!("Started run {} on thread {}", created.id, thread_id);
        Ok(created.id)
    }

    async fn run_status(&self, thread_id: &str, run_id: &str) -> Result<JobStatus, ReceiptError> {
        let run: RunObject = self
            .send(
                self.http
                    .get(self.url(&format!("threads/{}/runs/{}", thread_id, run_id))),
            )
            .await?;
        Ok(map_status(run))
    }

    async fn latest_assistant_message(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Option<String>, ReceiptError> {
        let list: MessageList = self
            .send(
                self.http
                    .get(self.url(&format!("threads/{}/messages", thread_id)))
                    .query(&[("order", "desc"), ("limit", "20"), ("run_id", run_id)]),
            )
            .await?;
        Ok(list
            .data
            .iter()
            .filter(|m| m.role == "assistant" && m.run_id.as_deref() == Some(run_id))
            .map(Message::text)
            .find(|text| !text.trim().is_empty()))
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ReceiptError> {
        let _: Value = self
            .send(
                self.http
                    .post(self.url(&format!("threads/{}/runs/{}/cancel", thread_id, run_id))),
            )
            .await?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), ReceiptError> {
        let _: Value = self
            .send(self.http.delete(self.url(&format!("threads/{}", thread_id))))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: &str) -> RunObject {
        RunObject {
            status: status.to_string(),
            last_error: None,
        }
    }

    #[test]
    fn statuses_map_onto_job_states() {
        assert_eq!(map_status(run("queued")), JobStatus::Submitted);
        assert_eq!(map_status(run("in_progress")), JobStatus::Running);
        assert_eq!(map_status(run("requires_action")), JobStatus::Running);
        assert_eq!(map_status(run("completed")), JobStatus::Completed);
        assert_eq!(map_status(run("expired")), JobStatus::Expired);
        assert_eq!(
            map_status(run("cancelled")),
            JobStatus::Failed("cancelled".into())
        );
        assert_eq!(
            map_status(run("incomplete")),
            JobStatus::Failed("incomplete".into())
        );
    }

    #[test]
    fn failed_run_carries_last_error() {
        let failed: RunObject = serde_json::from_str(
            r#"{"status":"failed",
                "last_error":{"code":"rate_limit_exceeded","message":"slow down"}}"#,
        )
        .unwrap();
        assert_eq!(
            map_status(failed),
            JobStatus::Failed("rate_limit_exceeded: slow down".into())
        );
    }

    #[test]
    fn message_text_joins_text_parts() {
        let m: Message = serde_json::from_str(
            r#"{"role":"assistant","run_id":"run_1","content":[
                {"type":"text","text":{"value":"{\"판단\":\"식비\",","annotations":[]}},
                {"type":"image_file","image_file":{"file_id":"f"}},
                {"type":"text","text":{"value":"\"근거\":\"카페\"}","annotations":[]}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(m.text(), "{\"판단\":\"식비\",\n\"근거\":\"카페\"}");
    }

    #[test]
    fn debug_hides_api_key() {
        let client = OpenAiAssistants::new("sk-secret", "asst_1").unwrap();
        let shown = format!("{:?}", client);
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("asst_1"));
    }
}
