//! Slack `chat.postMessage` as the [`Notifier`].

use super::{describe_send_error, http_client, read_json, trim_base, Notifier, DEFAULT_HTTP_TIMEOUT};
use crate::error::ReceiptError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use tracing::debug;

pub const SLACK_BASE_URL: &str = "https://slack.com";

#[derive(Clone)]
pub struct SlackNotifier {
    http: Client,
    bot_token: String,
    channel: String,
    base_url: String,
}

impl fmt::Debug for SlackNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackNotifier")
            .field("bot_token", &"[REDACTED]")
            .field("channel", &self.channel)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Slack answers HTTP 200 even for failures; `ok` tells the truth.
#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackNotifier {
    pub fn new(
        bot_token: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, ReceiptError> {
        Ok(Self {
            http: http_client(DEFAULT_HTTP_TIMEOUT)?,
            bot_token: bot_token.into(),
            channel: channel.into(),
            base_url: SLACK_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = trim_base(base_url);
        self
    }

    pub fn bot_token(&self) -> &str {
        &self.bot_token
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn post(&self, text: &str) -> Result<(), ReceiptError> {
        let response = self
            .http
            .post(format!("{}/api/chat.postMessage", self.base_url))
            .bearer_auth(&self.bot_token)
            .json(&json!({ "channel": self.channel, "text": text }))
            .send()
            .await
            .map_err(|e| ReceiptError::NotifyFailed {
                reason: describe_send_error(e),
            })?;

        let body: SlackResponse = read_json(response)
            .await
            .map_err(|reason| ReceiptError::NotifyFailed { reason })?;
        if !body.ok {
            return Err(ReceiptError::NotifyFailed {
                reason: body.error.unwrap_or_else(|| "unknown_error".to_string()),
            });
        }
        debug!("Posted {} chars to {}", text.chars().count(), self.channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_token() {
        let slack = SlackNotifier::new("xoxb-secret", "C123").unwrap();
        let shown = format!("{:?}", slack);
        assert!(!shown.contains("xoxb-secret"));
        assert!(shown.contains("C123"));
    }

    #[test]
    fn error_response_parses() {
        let body: SlackResponse =
            serde_json::from_str(r#"{"ok":false,"error":"channel_not_found"}"#).unwrap();
        assert!(!body.ok);
        assert_eq!(body.error.as_deref(), Some("channel_not_found"));
    }
}
