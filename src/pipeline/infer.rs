//! Category inference: snippets → short business-category label.

use crate::error::ReceiptError;
use crate::pipeline::llm::ChatModel;
use crate::prompts::category_prompt;
use crate::record::{BusinessCategory, SearchSnippetSet};
use edgequake_llm::ChatMessage;
use std::sync::Arc;
use tracing::debug;

/// The Category Inferrer.
#[derive(Clone)]
pub struct CategoryInferrer {
    model: Arc<dyn ChatModel>,
}

impl CategoryInferrer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// The label is accepted as long as it is not blank; its shape is the
    /// model's business.
    pub async fn infer(
        &self,
        merchant: &str,
        snippets: &SearchSnippetSet,
    ) -> Result<BusinessCategory, ReceiptError> {
        let messages = vec![ChatMessage::user(category_prompt(merchant, &snippets.joined()))];
        let answer = self
            .model
            .chat(&messages)
            .await
            .map_err(|e| ReceiptError::InferenceFailed {
                detail: e.to_string(),
            })?;

        let label = clean_label(&answer);
        debug!("Category for '{}': {:?} (raw {:?})", merchant, label, answer);
        BusinessCategory::new(label).ok_or_else(|| ReceiptError::InferenceFailed {
            detail: "model returned a blank category".into(),
        })
    }
}

/// Strip the quoting and trailing punctuation models like to add.
pub fn clean_label(answer: &str) -> String {
    let first_line = answer
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let without_prefix = first_line
        .strip_prefix("업종:")
        .or_else(|| first_line.strip_prefix("업종 :"))
        .unwrap_or(first_line);
    without_prefix
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '“' | '”' | '.' | '。'))
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::ModelCallError;
    use async_trait::async_trait;

    struct Fixed(&'static str);

    #[async_trait]
    impl ChatModel for Fixed {
        fn model_name(&self) -> &str {
            "fixed"
        }
        async fn chat(&self, _m: &[ChatMessage]) -> Result<String, ModelCallError> {
            Ok(self.0.to_string())
        }
    }

    struct Down;

    #[async_trait]
    impl ChatModel for Down {
        fn model_name(&self) -> &str {
            "down"
        }
        async fn chat(&self, _m: &[ChatMessage]) -> Result<String, ModelCallError> {
            Err(ModelCallError::Timeout(60))
        }
    }

    #[test]
    fn labels_are_cleaned() {
        assert_eq!(clean_label("\"카페\""), "카페");
        assert_eq!(clean_label("업종: 식당.\n(검색 결과 기준)"), "식당");
        assert_eq!(clean_label("  restaurant  "), "restaurant");
        assert_eq!(clean_label("\n\n"), "");
    }

    #[tokio::test]
    async fn infers_label() {
        let inferrer = CategoryInferrer::new(Arc::new(Fixed("카페")));
        let snippets = SearchSnippetSet::from_ranked(vec![Some("coffee".to_string())], 10);
        let c = inferrer.infer("Cafe X", &snippets).await.unwrap();
        assert_eq!(c.as_str(), "카페");
    }

    #[tokio::test]
    async fn empty_snippets_still_infer() {
        let inferrer = CategoryInferrer::new(Arc::new(Fixed("교통")));
        let c = inferrer.infer("카카오T", &SearchSnippetSet::default()).await.unwrap();
        assert_eq!(c.as_str(), "교통");
    }

    #[tokio::test]
    async fn blank_answer_fails() {
        let inferrer = CategoryInferrer::new(Arc::new(Fixed("\"\"")));
        let err = inferrer
            .infer("Cafe X", &SearchSnippetSet::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiptError::InferenceFailed { .. }));
    }

    #[tokio::test]
    async fn upstream_failure() {
        let inferrer = CategoryInferrer::new(Arc::new(Down));
        let err = inferrer
            .infer("Cafe X", &SearchSnippetSet::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
