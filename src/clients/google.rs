//! Google Custom Search JSON API as a [`SearchEngine`].

use super::{describe_send_error, http_client, read_json, trim_base, DEFAULT_HTTP_TIMEOUT};
use crate::error::ReceiptError;
use crate::pipeline::search::{SearchEngine, SearchHit};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use tracing::debug;

pub const GOOGLE_SEARCH_BASE_URL: &str = "https://www.googleapis.com";

/// The API's hard page size.
const MAX_PAGE: usize = 10;

#[derive(Clone)]
pub struct GoogleSearch {
    http: Client,
    api_key: String,
    engine_id: String,
    base_url: String,
}

impl fmt::Debug for GoogleSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleSearch")
            .field("api_key", &"[REDACTED]")
            .field("engine_id", &self.engine_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    // Absent when the query has no results.
    #[serde(default)]
    items: Vec<SearchHit>,
}

impl GoogleSearch {
    pub fn new(
        api_key: impl Into<String>,
        engine_id: impl Into<String>,
    ) -> Result<Self, ReceiptError> {
        Ok(Self {
            http: http_client(DEFAULT_HTTP_TIMEOUT)?,
            api_key: api_key.into(),
            engine_id: engine_id.into(),
            base_url: GOOGLE_SEARCH_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = trim_base(base_url);
        self
    }
}

#[async_trait]
impl SearchEngine for GoogleSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, ReceiptError> {
        let num = max_results.clamp(1, MAX_PAGE).to_string();
        let url = format!("{}/customsearch/v1", self.base_url);

        let response = self
            .http
            .get(&url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", query),
                ("num", num.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ReceiptError::SearchFailed {
                detail: describe_send_error(e),
            })?;

        let body: SearchResponse = read_json(response)
            .await
            .map_err(|detail| ReceiptError::SearchFailed { detail })?;

        debug!("Custom Search returned {} items for {:?}", body.items.len(), query);
        Ok(body.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_api_key() {
        let client = GoogleSearch::new("secret-key", "cx-1").unwrap();
        let shown = format!("{:?}", client);
        assert!(!shown.contains("secret-key"));
        assert!(shown.contains("[REDACTED]"));
        assert!(shown.contains("cx-1"));
    }

    #[test]
    fn missing_items_is_zero_results() {
        let body: SearchResponse =
            serde_json::from_str(r#"{"kind":"customsearch#search"}"#).unwrap();
        assert!(body.items.is_empty());
    }

    #[test]
    fn items_without_snippet_parse() {
        let body: SearchResponse = serde_json::from_str(
            r#"{"items":[{"title":"Cafe X","link":"https://x"},{"title":"b","snippet":"coffee"}]}"#,
        )
        .unwrap();
        assert_eq!(body.items.len(), 2);
        assert_eq!(body.items[0].snippet, None);
        assert_eq!(body.items[1].snippet.as_deref(), Some("coffee"));
    }
}
