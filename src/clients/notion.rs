//! Notion database as the [`RecordStore`].
//!
//! One page per receipt. The database is expected to have these properties:
//!
//! | Property | Type |
//! |----------|------|
//! | 상호명 | title |
//! | 날짜 | date |
//! | 총액 | number |
//! | 업종 | rich text |
//! | 비목 | rich text |
//! | 영수증 | files |
//!
//! Line items become bulleted blocks in the page body.

use super::{
    describe_send_error, http_client, read_json, trim_base, RecordStore, DEFAULT_HTTP_TIMEOUT,
};
use crate::error::ReceiptError;
use crate::record::{format_amount, PipelineOutput};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::info;

pub const NOTION_BASE_URL: &str = "https://api.notion.com";
pub const NOTION_VERSION: &str = "2022-06-28";

#[derive(Clone)]
pub struct NotionRecordStore {
    http: Client,
    api_key: String,
    database_id: String,
    base_url: String,
}

impl fmt::Debug for NotionRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionRecordStore")
            .field("api_key", &"[REDACTED]")
            .field("database_id", &self.database_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CreatedPage {
    id: String,
}

impl NotionRecordStore {
    pub fn new(
        api_key: impl Into<String>,
        database_id: impl Into<String>,
    ) -> Result<Self, ReceiptError> {
        Ok(Self {
            http: http_client(DEFAULT_HTTP_TIMEOUT)?,
            api_key: api_key.into(),
            database_id: database_id.into(),
            base_url: NOTION_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = trim_base(base_url);
        self
    }

    /// Request body for `POST /v1/pages`.
    pub fn page_body(&self, output: &PipelineOutput, file_url: &str) -> Value {
        let receipt = &output.receipt;
        let file_name = file_url.rsplit('/').next().unwrap_or(file_url);
        let date = if is_iso_date(&receipt.date) {
            json!({ "start": receipt.date })
        } else {
            Value::Null
        };

        let children: Vec<Value> = receipt
            .items
            .iter()
            .map(|item| {
                json!({
                    "object": "block",
                    "type": "bulleted_list_item",
                    "bulleted_list_item": {
                        "rich_text": [{
                            "type": "text",
                            "text": {
                                "content": format!("{}: {}원", item.name, format_amount(item.price))
                            }
                        }]
                    }
                })
            })
            .collect();

        json!({
            "parent": { "database_id": self.database_id },
            "properties": {
                "상호명": { "title": [{ "text": { "content": receipt.merchant } }] },
                "날짜": { "date": date },
                "총액": { "number": receipt.total },
                "업종": { "rich_text": [{ "text": { "content": output.category.as_str() } }] },
                "비목": {
                    "rich_text": [{ "text": { "content": output.account.label.ledger_name() } }]
                },
                "영수증": {
                    "files": [{
                        "type": "external",
                        "name": file_name,
                        "external": { "url": file_url }
                    }]
                }
            },
            "children": children
        })
    }
}

/// Notion rejects anything but ISO dates in a date property.
fn is_iso_date(date: &str) -> bool {
    let b = date.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

#[async_trait]
impl RecordStore for NotionRecordStore {
    async fn create_record(
        &self,
        output: &PipelineOutput,
        file_url: &str,
    ) -> Result<String, ReceiptError> {
        let response = self
            .http
            .post(format!("{}/v1/pages", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Notion-Version", NOTION_VERSION)
            .json(&self.page_body(output, file_url))
            .send()
            .await
            .map_err(|e| ReceiptError::PersistFailed {
                reason: describe_send_error(e),
            })?;

        let page: CreatedPage = read_json(response)
            .await
            .map_err(|reason| ReceiptError::PersistFailed { reason })?;
        info!("Created Notion page {} for '{}'", page.id, output.receipt.merchant);
        Ok(page.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        AccountClassification, AccountLabel, BusinessCategory, FileKind, LineItem, ReceiptRecord,
        SearchSnippetSet,
    };

    fn output() -> PipelineOutput {
        PipelineOutput {
            file_kind: FileKind::Image,
            receipt: ReceiptRecord {
                merchant: "Cafe X".into(),
                date: "2024-01-01".into(),
                items: vec![LineItem {
                    name: "Latte".into(),
                    price: 4500.0,
                }],
                total: 4500.0,
            },
            snippets: SearchSnippetSet::default(),
            category: BusinessCategory::new("카페").unwrap(),
            account: AccountClassification {
                label: AccountLabel::MealExpense,
                justification: "카페 음료".into(),
            },
        }
    }

    #[test]
    fn page_body_carries_every_property() {
        let store = NotionRecordStore::new("secret", "db-1").unwrap();
        let body = store.page_body(&output(), "https://bucket/receipts/%EC%98%81.jpg");

        assert_eq!(body["parent"]["database_id"], "db-1");
        let props = &body["properties"];
        assert_eq!(props["상호명"]["title"][0]["text"]["content"], "Cafe X");
        assert_eq!(props["날짜"]["date"]["start"], "2024-01-01");
        assert_eq!(props["총액"]["number"], 4500.0);
        assert_eq!(props["업종"]["rich_text"][0]["text"]["content"], "카페");
        assert_eq!(props["비목"]["rich_text"][0]["text"]["content"], "식비");
        assert_eq!(props["영수증"]["files"][0]["name"], "%EC%98%81.jpg");
        assert_eq!(
            props["영수증"]["files"][0]["external"]["url"],
            "https://bucket/receipts/%EC%98%81.jpg"
        );
        assert_eq!(
            body["children"][0]["bulleted_list_item"]["rich_text"][0]["text"]["content"],
            "Latte: 4500원"
        );
    }

    #[test]
    fn non_iso_date_is_sent_empty() {
        let store = NotionRecordStore::new("secret", "db-1").unwrap();
        let mut out = output();
        out.receipt.date = "1월 1일".into();
        let body = store.page_body(&out, "https://bucket/r.jpg");
        assert!(body["properties"]["날짜"]["date"].is_null());
    }

    #[test]
    fn iso_date_check() {
        assert!(is_iso_date("2024-01-01"));
        assert!(!is_iso_date("2024.01.01"));
        assert!(!is_iso_date("2024-1-1"));
        assert!(!is_iso_date(""));
    }
}
