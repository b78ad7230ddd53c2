//! HTTP collaborators around the pipeline.
//!
//! The pipeline itself only depends on the [`SearchEngine`] and
//! [`AssistantBackend`] seams; storing the file, persisting the record and
//! posting notifications happen afterwards in [`crate::process`] through the
//! [`ObjectStore`], [`RecordStore`] and [`Notifier`] traits defined here.
//!
//! Every client takes its secrets as constructor arguments, hides them in
//! `Debug`, and accepts a base URL override so tests can point it at a local
//! mock server.
//!
//! [`SearchEngine`]: crate::pipeline::search::SearchEngine
//! [`AssistantBackend`]: crate::assistant::AssistantBackend

pub mod google;
pub mod notion;
pub mod openai_assistants;
pub mod slack;
pub mod storage;

use crate::error::ReceiptError;
use crate::record::PipelineOutput;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;

pub use google::GoogleSearch;
pub use notion::NotionRecordStore;
pub use openai_assistants::OpenAiAssistants;
pub use slack::SlackNotifier;
pub use storage::HttpObjectStore;

/// Default timeout for collaborator HTTP calls.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Durable storage for the original receipt file.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `path` as `dest_name`; returns its public URL.
    async fn upload(&self, path: &Path, dest_name: &str) -> Result<String, ReceiptError>;
}

/// The ledger the finished record is written to.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create one record from a successful run; returns the store's id.
    async fn create_record(
        &self,
        output: &PipelineOutput,
        file_url: &str,
    ) -> Result<String, ReceiptError>;
}

/// Outbound chat channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post(&self, text: &str) -> Result<(), ReceiptError>;
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client, ReceiptError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ReceiptError::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// Decode a success body or describe the failure as `HTTP <code>: <body>`.
///
/// Callers wrap the message in the variant for their own stage.
pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, String> {
    let status = response.status();

    if status.is_success() {
        response
            .json()
            .await
            .map_err(|e| format!("unexpected response body: {}", e))
    } else {
        let error_body = response.text().await.unwrap_or_default();
        Err(format!("HTTP {}: {}", status.as_u16(), truncate(&error_body, 300)))
    }
}

pub(crate) fn describe_send_error(e: reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    }
}

pub(crate) fn trim_base(base_url: impl Into<String>) -> String {
    base_url.into().trim_end_matches('/').to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push('…');
        cut
    }
}
