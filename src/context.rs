//! Write-once key/value state accumulated during one pipeline run.
//!
//! Stages never see the whole [`PipelineContext`]. The orchestrator hands each
//! stage a [`ContextView`] restricted to the keys it declared as inputs, and
//! inserts the values it returns only after checking they match the declared
//! outputs. A key, once written, cannot be overwritten.

use crate::error::ReceiptError;
use crate::record::{
    AccountClassification, BusinessCategory, FileKind, NormalizedImage, PipelineOutput, RawUpload,
    ReceiptRecord, SearchSnippetSet,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Keys a stage may declare as inputs or outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextKey {
    Upload,
    FileKind,
    Image,
    Receipt,
    Snippets,
    Category,
    Account,
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextKey::Upload => "upload",
            ContextKey::FileKind => "file_kind",
            ContextKey::Image => "image",
            ContextKey::Receipt => "receipt",
            ContextKey::Snippets => "snippets",
            ContextKey::Category => "category",
            ContextKey::Account => "account",
        };
        f.write_str(name)
    }
}

/// A value stored under exactly one [`ContextKey`].
#[derive(Debug, Clone)]
pub enum ContextValue {
    Upload(Arc<RawUpload>),
    FileKind(FileKind),
    Image(NormalizedImage),
    Receipt(ReceiptRecord),
    Snippets(SearchSnippetSet),
    Category(BusinessCategory),
    Account(AccountClassification),
}

impl ContextValue {
    pub fn key(&self) -> ContextKey {
        match self {
            ContextValue::Upload(_) => ContextKey::Upload,
            ContextValue::FileKind(_) => ContextKey::FileKind,
            ContextValue::Image(_) => ContextKey::Image,
            ContextValue::Receipt(_) => ContextKey::Receipt,
            ContextValue::Snippets(_) => ContextKey::Snippets,
            ContextValue::Category(_) => ContextKey::Category,
            ContextValue::Account(_) => ContextKey::Account,
        }
    }
}

/// Accumulated state of one run, seeded with the upload.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    entries: BTreeMap<ContextKey, ContextValue>,
}

impl PipelineContext {
    pub fn new(upload: RawUpload) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(ContextKey::Upload, ContextValue::Upload(Arc::new(upload)));
        Self { entries }
    }

    pub fn contains(&self, key: ContextKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = ContextKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn get(&self, key: ContextKey) -> Option<&ContextValue> {
        self.entries.get(&key)
    }

    /// Insert a stage output. Fails if the key was already written.
    pub(crate) fn insert(&mut self, stage: &str, value: ContextValue) -> Result<(), ReceiptError> {
        let key = value.key();
        if self.entries.contains_key(&key) {
            return Err(ReceiptError::contract(
                stage,
                format!("key '{key}' was already written"),
            ));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    /// Read-only view limited to `allowed` keys.
    pub fn view<'a>(&'a self, stage: &'a str, allowed: &'a [ContextKey]) -> ContextView<'a> {
        ContextView {
            context: self,
            stage,
            allowed,
        }
    }

    /// Collect the final result. Every output key must be present.
    pub fn into_output(self) -> Result<PipelineOutput, ReceiptError> {
        const STAGE: &str = "pipeline";
        let mut entries = self.entries;
        let mut take = |key: ContextKey| {
            entries
                .remove(&key)
                .ok_or_else(|| {
                    ReceiptError::contract(STAGE, format!("final context lacks '{key}'"))
                })
        };

        let file_kind = match take(ContextKey::FileKind)? {
            ContextValue::FileKind(k) => k,
            other => return Err(mismatch(STAGE, ContextKey::FileKind, &other)),
        };
        let receipt = match take(ContextKey::Receipt)? {
            ContextValue::Receipt(r) => r,
            other => return Err(mismatch(STAGE, ContextKey::Receipt, &other)),
        };
        let snippets = match take(ContextKey::Snippets)? {
            ContextValue::Snippets(s) => s,
            other => return Err(mismatch(STAGE, ContextKey::Snippets, &other)),
        };
        let category = match take(ContextKey::Category)? {
            ContextValue::Category(c) => c,
            other => return Err(mismatch(STAGE, ContextKey::Category, &other)),
        };
        let account = match take(ContextKey::Account)? {
            ContextValue::Account(a) => a,
            other => return Err(mismatch(STAGE, ContextKey::Account, &other)),
        };

        Ok(PipelineOutput {
            file_kind,
            receipt,
            snippets,
            category,
            account,
        })
    }
}

fn mismatch(stage: &str, key: ContextKey, value: &ContextValue) -> ReceiptError {
    ReceiptError::contract(
        stage,
        format!("key '{key}' holds a '{}' value", value.key()),
    )
}

/// The slice of context a single stage is allowed to read.
pub struct ContextView<'a> {
    context: &'a PipelineContext,
    stage: &'a str,
    allowed: &'a [ContextKey],
}

impl<'a> ContextView<'a> {
    pub fn stage(&self) -> &str {
        self.stage
    }

    fn get(&self, key: ContextKey) -> Result<&'a ContextValue, ReceiptError> {
        if !self.allowed.contains(&key) {
            return Err(ReceiptError::contract(
                self.stage,
                format!("read undeclared input '{key}'"),
            ));
        }
        self.context.entries.get(&key).ok_or_else(|| {
            ReceiptError::contract(self.stage, format!("input '{key}' has not been produced"))
        })
    }

    pub fn upload(&self) -> Result<Arc<RawUpload>, ReceiptError> {
        match self.get(ContextKey::Upload)? {
            ContextValue::Upload(u) => Ok(Arc::clone(u)),
            other => Err(mismatch(self.stage, ContextKey::Upload, other)),
        }
    }

    pub fn file_kind(&self) -> Result<FileKind, ReceiptError> {
        match self.get(ContextKey::FileKind)? {
            ContextValue::FileKind(k) => Ok(*k),
            other => Err(mismatch(self.stage, ContextKey::FileKind, other)),
        }
    }

    pub fn image(&self) -> Result<&'a NormalizedImage, ReceiptError> {
        match self.get(ContextKey::Image)? {
            ContextValue::Image(i) => Ok(i),
            other => Err(mismatch(self.stage, ContextKey::Image, other)),
        }
    }

    pub fn receipt(&self) -> Result<&'a ReceiptRecord, ReceiptError> {
        match self.get(ContextKey::Receipt)? {
            ContextValue::Receipt(r) => Ok(r),
            other => Err(mismatch(self.stage, ContextKey::Receipt, other)),
        }
    }

    pub fn snippets(&self) -> Result<&'a SearchSnippetSet, ReceiptError> {
        match self.get(ContextKey::Snippets)? {
            ContextValue::Snippets(s) => Ok(s),
            other => Err(mismatch(self.stage, ContextKey::Snippets, other)),
        }
    }

    pub fn category(&self) -> Result<&'a BusinessCategory, ReceiptError> {
        match self.get(ContextKey::Category)? {
            ContextValue::Category(c) => Ok(c),
            other => Err(mismatch(self.stage, ContextKey::Category, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ctx() -> PipelineContext {
        PipelineContext::new(RawUpload::new(b"%PDF-1.7".to_vec(), "r.pdf"))
    }

    #[test]
    fn seeded_with_upload() {
        let c = ctx();
        assert!(c.contains(ContextKey::Upload));
        assert_eq!(c.keys().count(), 1);
    }

    #[test]
    fn keys_are_write_once() {
        let mut c = ctx();
        c.insert("classify", ContextValue::FileKind(FileKind::Pdf))
            .unwrap();
        let err = c
            .insert("classify", ContextValue::FileKind(FileKind::Image))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        match c.get(ContextKey::FileKind) {
            Some(ContextValue::FileKind(FileKind::Pdf)) => {}
            other => panic!("value was overwritten: {other:?}"),
        }
    }

    #[test]
    fn view_rejects_undeclared_reads() {
        let mut c = ctx();
        c.insert("classify", ContextValue::FileKind(FileKind::Pdf))
            .unwrap();
        let view = c.view("normalize", &[ContextKey::Upload]);
        assert!(view.upload().is_ok());
        let err = view.file_kind().unwrap_err();
        assert!(err.to_string().contains("undeclared"), "got: {err}");
    }

    #[test]
    fn view_rejects_missing_inputs() {
        let c = ctx();
        let view = c.view("extract", &[ContextKey::Image]);
        let err = view.image().unwrap_err();
        assert!(err.to_string().contains("not been produced"), "got: {err}");
    }

    #[test]
    fn incomplete_context_has_no_output() {
        let err = ctx().into_output().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
    }
}
