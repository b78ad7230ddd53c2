//! Data contract passed between pipeline stages.
//!
//! Every type here lives for exactly one pipeline run. Nothing is cached and
//! nothing is persisted by the core; persistence happens in
//! [`crate::process`] once the whole run has succeeded.

use edgequake_llm::ImageData;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw bytes of a shared file plus the name it was shared under.
#[derive(Clone)]
pub struct RawUpload {
    pub bytes: Vec<u8>,
    pub filename: String,
}

impl RawUpload {
    pub fn new(bytes: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            bytes,
            filename: filename.into(),
        }
    }
}

impl fmt::Debug for RawUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawUpload")
            .field("filename", &self.filename)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// What an upload turned out to be, judged by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Image,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Pdf => f.write_str("pdf"),
            FileKind::Image => f.write_str("image"),
        }
    }
}

/// A single base64-encoded frame ready for a vision model.
///
/// PDFs are rasterised and re-encoded as JPEG; raster uploads keep their
/// original bytes and MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub data: String,
    pub mime_type: String,
    pub source: FileKind,
}

impl NormalizedImage {
    /// Wrap the frame for a multimodal chat message.
    pub fn to_image_data(&self) -> ImageData {
        ImageData::new(self.data.clone(), self.mime_type.clone()).with_detail("high")
    }
}

/// One purchased line on a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub price: f64,
}

/// Structured fields extracted from a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub merchant: String,
    /// `YYYY-MM-DD`.
    pub date: String,
    pub items: Vec<LineItem>,
    pub total: f64,
}

impl ReceiptRecord {
    pub fn item_names(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.name.as_str()).collect()
    }

    pub fn items_sum(&self) -> f64 {
        self.items.iter().map(|i| i.price).sum()
    }

    /// `false` when items are listed and their prices do not add up to the
    /// total within `tolerance`. An empty item list is always consistent.
    pub fn totals_consistent(&self, tolerance: f64) -> bool {
        self.items.is_empty() || (self.items_sum() - self.total).abs() <= tolerance
    }
}

/// Ranked text snippets from a web search, bounded and never containing
/// blank entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSnippetSet {
    snippets: Vec<String>,
}

impl SearchSnippetSet {
    /// Keep the first `max` non-blank snippets in rank order.
    pub fn from_ranked<I>(snippets: I, max: usize) -> Self
    where
        I: IntoIterator<Item = Option<String>>,
    {
        let snippets = snippets
            .into_iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .take(max)
            .collect();
        Self { snippets }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.snippets
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    /// Snippets joined one per line, as fed to the category prompt.
    pub fn joined(&self) -> String {
        self.snippets.join("\n")
    }
}

/// Free-text business category such as "카페" or "restaurant".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessCategory(String);

impl BusinessCategory {
    /// Returns `None` for a blank label.
    pub fn new(label: impl Into<String>) -> Option<Self> {
        let label = label.into();
        if label.trim().is_empty() {
            None
        } else {
            Some(Self(label))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of expense accounts, plus the "cannot determine" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountLabel {
    MeetingExpense,
    TransportExpense,
    MealExpense,
    CannotDetermine,
}

impl AccountLabel {
    pub const ALL: [AccountLabel; 4] = [
        AccountLabel::MeetingExpense,
        AccountLabel::TransportExpense,
        AccountLabel::MealExpense,
        AccountLabel::CannotDetermine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountLabel::MeetingExpense => "meeting-expense",
            AccountLabel::TransportExpense => "transport-expense",
            AccountLabel::MealExpense => "meal-expense",
            AccountLabel::CannotDetermine => "cannot-determine",
        }
    }

    /// Name used in the ledger and in assistant prompts.
    pub fn ledger_name(&self) -> &'static str {
        match self {
            AccountLabel::MeetingExpense => "회의비",
            AccountLabel::TransportExpense => "교통비",
            AccountLabel::MealExpense => "식비",
            AccountLabel::CannotDetermine => "판단할 수 없음",
        }
    }

    /// Strict match of a model-produced label against every known spelling.
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned = raw
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.')
            .trim();
        let lowered = cleaned.to_lowercase();
        let compact: String = lowered.chars().filter(|c| !c.is_whitespace()).collect();

        Self::ALL.into_iter().find(|label| {
            let aliases: &[&str] = match label {
                AccountLabel::MeetingExpense => {
                    &["회의비", "meeting-expense", "meeting", "meetingexpense"]
                }
                AccountLabel::TransportExpense => {
                    &["교통비", "transport-expense", "transport", "transportexpense"]
                }
                AccountLabel::MealExpense => &["식비", "meal-expense", "meal", "mealexpense"],
                AccountLabel::CannotDetermine => &[
                    "판단할수없음",
                    "cannot-determine",
                    "cannotdetermine",
                    "unknown",
                ],
            };
            aliases.contains(&lowered.as_str()) || aliases.contains(&compact.as_str())
        })
    }

    /// Every closed-set label whose ledger name appears somewhere in `text`.
    pub(crate) fn mentioned_in(text: &str) -> Vec<Self> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        Self::ALL
            .into_iter()
            .filter(|label| {
                let name: String = label
                    .ledger_name()
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect();
                compact.contains(&name) || text.to_lowercase().contains(label.as_str())
            })
            .collect()
    }
}

impl fmt::Display for AccountLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final bookkeeping decision for one receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountClassification {
    pub label: AccountLabel,
    pub justification: String,
}

/// Everything a successful run produces, handed to the persistence
/// collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub file_kind: FileKind,
    pub receipt: ReceiptRecord,
    pub snippets: SearchSnippetSet,
    pub category: BusinessCategory,
    pub account: AccountClassification,
}

/// Render an amount without a trailing `.0` for whole numbers.
pub fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
