//! The six receipt stages, each bound to its declared context keys.
//!
//! A stage reads only through the [`ContextView`] it is given and returns
//! its outputs as values; the orchestrator checks them against
//! [`Stage::outputs`] before they enter the context.

use crate::context::{ContextKey, ContextValue, ContextView};
use crate::error::ReceiptError;
use crate::orchestrator::Stage;
use crate::pipeline::account::{self, AccountClassifier};
use crate::pipeline::detect;
use crate::pipeline::encode::ImageNormalizer;
use crate::pipeline::extract::ReceiptExtractor;
use crate::pipeline::infer::CategoryInferrer;
use crate::pipeline::search::CategorySearcher;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Upload → file kind.
pub struct ClassifyStage;

#[async_trait]
impl Stage for ClassifyStage {
    fn name(&self) -> &'static str {
        "classify"
    }
    fn inputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Upload]
    }
    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::FileKind]
    }
    async fn run(
        &self,
        view: ContextView<'_>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ContextValue>, ReceiptError> {
        let upload = view.upload()?;
        Ok(vec![ContextValue::FileKind(detect::classify(&upload.bytes))])
    }
}

/// Upload + file kind → one base64 frame.
pub struct NormalizeStage(pub ImageNormalizer);

#[async_trait]
impl Stage for NormalizeStage {
    fn name(&self) -> &'static str {
        "normalize"
    }
    fn inputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Upload, ContextKey::FileKind]
    }
    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Image]
    }
    async fn run(
        &self,
        view: ContextView<'_>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ContextValue>, ReceiptError> {
        let upload = view.upload()?;
        let kind = view.file_kind()?;
        let image = self.0.normalize(&upload, kind).await?;
        Ok(vec![ContextValue::Image(image)])
    }
}

/// Frame → receipt record.
pub struct ExtractStage(pub ReceiptExtractor);

#[async_trait]
impl Stage for ExtractStage {
    fn name(&self) -> &'static str {
        "extract"
    }
    fn inputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Image]
    }
    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Receipt]
    }
    async fn run(
        &self,
        view: ContextView<'_>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ContextValue>, ReceiptError> {
        let record = self.0.extract(view.image()?).await?;
        Ok(vec![ContextValue::Receipt(record)])
    }
}

/// Receipt → search snippets.
pub struct SearchStage(pub CategorySearcher);

#[async_trait]
impl Stage for SearchStage {
    fn name(&self) -> &'static str {
        "search"
    }
    fn inputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Receipt]
    }
    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Snippets]
    }
    async fn run(
        &self,
        view: ContextView<'_>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ContextValue>, ReceiptError> {
        let receipt = view.receipt()?;
        let snippets = self
            .0
            .search(&receipt.merchant, &receipt.item_names())
            .await?;
        Ok(vec![ContextValue::Snippets(snippets)])
    }
}

/// Receipt + snippets → business category.
pub struct InferStage(pub CategoryInferrer);

#[async_trait]
impl Stage for InferStage {
    fn name(&self) -> &'static str {
        "infer"
    }
    fn inputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Receipt, ContextKey::Snippets]
    }
    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Category]
    }
    async fn run(
        &self,
        view: ContextView<'_>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ContextValue>, ReceiptError> {
        let receipt = view.receipt()?;
        let category = self.0.infer(&receipt.merchant, view.snippets()?).await?;
        Ok(vec![ContextValue::Category(category)])
    }
}

/// Receipt + category → account classification.
pub struct AccountStage(pub AccountClassifier);

#[async_trait]
impl Stage for AccountStage {
    fn name(&self) -> &'static str {
        account::STAGE
    }
    fn inputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Receipt, ContextKey::Category]
    }
    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Account]
    }
    async fn run(
        &self,
        view: ContextView<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContextValue>, ReceiptError> {
        let account = self
            .0
            .classify(view.receipt()?, view.category()?, cancel)
            .await?;
        Ok(vec![ContextValue::Account(account)])
    }
}
