//! Category search: merchant + items → ranked web snippets.

use crate::error::ReceiptError;
use crate::record::SearchSnippetSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// A web search backend.
///
/// Zero hits is `Ok(vec![])`; only a failed call is an error, and it should
/// be reported as [`ReceiptError::SearchFailed`] so the orchestrator can
/// retry it.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ReceiptError>;
}

/// Merchant alone, or merchant followed by the comma-joined item names.
pub fn build_query(merchant: &str, items: &[&str]) -> String {
    let names: Vec<&str> = items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let merchant = merchant.trim();
    if names.is_empty() {
        merchant.to_string()
    } else {
        format!("{},{}", merchant, names.join(","))
    }
}

/// The Category Searcher.
#[derive(Clone)]
pub struct CategorySearcher {
    engine: Arc<dyn SearchEngine>,
    max_results: usize,
}

impl CategorySearcher {
    pub fn new(engine: Arc<dyn SearchEngine>, max_results: usize) -> Self {
        Self {
            engine,
            max_results: max_results.clamp(1, 10),
        }
    }

    pub async fn search(
        &self,
        merchant: &str,
        items: &[&str],
    ) -> Result<SearchSnippetSet, ReceiptError> {
        let query = build_query(merchant, items);
        let hits = self.engine.search(&query, self.max_results).await?;
        let total = hits.len();
        let snippets =
            SearchSnippetSet::from_ranked(hits.into_iter().map(|h| h.snippet), self.max_results);
        debug!(
            "Search {:?}: {} hits, {} snippets kept",
            query,
            total,
            snippets.len()
        );
        Ok(snippets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        queries: Mutex<Vec<(String, usize)>>,
        hits: Vec<SearchHit>,
    }

    #[async_trait]
    impl SearchEngine for Recording {
        async fn search(&self, query: &str, max: usize) -> Result<Vec<SearchHit>, ReceiptError> {
            self.queries.lock().unwrap().push((query.to_string(), max));
            Ok(self.hits.clone())
        }
    }

    fn hit(snippet: Option<&str>) -> SearchHit {
        SearchHit {
            title: "t".into(),
            snippet: snippet.map(str::to_string),
            link: None,
        }
    }

    #[test]
    fn queries() {
        assert_eq!(build_query("Cafe X", &["Latte"]), "Cafe X,Latte");
        assert_eq!(build_query("Cafe X", &[]), "Cafe X");
        assert_eq!(build_query("Cafe X", &["Latte", "Scone"]), "Cafe X,Latte,Scone");
        assert_eq!(build_query(" Cafe X ", &[" "]), "Cafe X");
    }

    #[tokio::test]
    async fn zero_results_is_empty_set() {
        let engine = Arc::new(Recording {
            queries: Mutex::new(Vec::new()),
            hits: Vec::new(),
        });
        let set = CategorySearcher::new(engine, 10)
            .search("Cafe X", &[])
            .await
            .unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn drops_hits_without_snippets_in_rank_order() {
        let engine = Arc::new(Recording {
            queries: Mutex::new(Vec::new()),
            hits: vec![hit(Some("coffee shop")), hit(None), hit(Some("bakery cafe"))],
        });
        let searcher = CategorySearcher::new(engine.clone(), 25);
        let set = searcher.search("Cafe X", &["Latte"]).await.unwrap();
        assert_eq!(set.as_slice(), &["coffee shop".to_string(), "bakery cafe".to_string()]);
        assert_eq!(
            engine.queries.lock().unwrap().as_slice(),
            &[("Cafe X,Latte".to_string(), 10)]
        );
    }
}
