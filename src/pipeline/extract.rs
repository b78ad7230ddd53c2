//! Structured extraction: receipt image → [`ReceiptRecord`].
//!
//! One vision call per attempt. The answer is free text; the JSON object in
//! it is recovered by [`crate::pipeline::recover`] and mapped field by field.
//! Missing fields fail the stage: a record is either complete or absent.

use crate::error::ReceiptError;
use crate::pipeline::llm::ChatModel;
use crate::pipeline::recover::{recover_object, RecoveryFailure};
use crate::prompts::{DEFAULT_SYSTEM_PROMPT, EXTRACTION_INSTRUCTION};
use crate::record::{LineItem, NormalizedImage, ReceiptRecord};
use edgequake_llm::ChatMessage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Allowed gap between the items sum and the printed total.
pub const TOTALS_TOLERANCE: f64 = 1.0;

const MERCHANT: &[&str] = &["상호명", "merchant", "store"];
const DATE: &[&str] = &["날짜", "date"];
const ITEMS: &[&str] = &["항목", "items"];
const TOTAL: &[&str] = &["총액", "total"];
const ITEM_NAME: &[&str] = &["이름", "name"];
const ITEM_PRICE: &[&str] = &["가격", "price"];

/// The Structured Extractor.
pub struct ReceiptExtractor {
    model: Arc<dyn ChatModel>,
    system_prompt: String,
    strict_totals: bool,
}

impl ReceiptExtractor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            strict_totals: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_strict_totals(mut self, strict: bool) -> Self {
        self.strict_totals = strict;
        self
    }

    /// Ask the vision model to read `image` and parse its answer.
    pub async fn extract(&self, image: &NormalizedImage) -> Result<ReceiptRecord, ReceiptError> {
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user_with_images(EXTRACTION_INSTRUCTION, vec![image.to_image_data()]),
        ];

        let text = self
            .model
            .chat(&messages)
            .await
            .map_err(|e| ReceiptError::ExtractionUpstream {
                detail: e.to_string(),
            })?;
        debug!(
            "{}: extraction response {} chars",
            self.model.model_name(),
            text.len()
        );

        let record = parse_receipt(&text)?;
        self.check_totals(&record)?;
        Ok(record)
    }

    fn check_totals(&self, record: &ReceiptRecord) -> Result<(), ReceiptError> {
        if record.totals_consistent(TOTALS_TOLERANCE) {
            return Ok(());
        }
        let detail = format!(
            "items add up to {} but the total is {}",
            record.items_sum(),
            record.total
        );
        if self.strict_totals {
            return Err(ReceiptError::InvalidField {
                field: TOTAL[0].to_string(),
                detail,
            });
        }
        warn!("Receipt from '{}': {}", record.merchant, detail);
        Ok(())
    }
}

/// Parse a model answer into a record without calling any model.
pub fn parse_receipt(text: &str) -> Result<ReceiptRecord, ReceiptError> {
    let obj = recover_object(text).map_err(|failure| match failure {
        RecoveryFailure::NoObject => ReceiptError::NoJsonObject {
            preview: preview(text),
        },
        RecoveryFailure::Malformed(detail) => ReceiptError::MalformedJson { detail },
    })?;

    let merchant = required_string(&obj, MERCHANT)?;
    if merchant.is_empty() {
        return Err(invalid(MERCHANT, "must not be empty"));
    }

    let raw_date = required_string(&obj, DATE)?;
    let date = normalize_date(&raw_date)
        .ok_or_else(|| invalid(DATE, &format!("{raw_date:?} is not a YYYY-MM-DD date")))?;

    let items = match field(&obj, ITEMS) {
        None => return Err(missing(ITEMS[0])),
        Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .enumerate()
            .map(|(i, entry)| parse_item(i, entry))
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => return Err(invalid(ITEMS, &format!("expected a list, got {other}"))),
    };

    let total = match field(&obj, TOTAL) {
        None => return Err(missing(TOTAL[0])),
        Some(v) => parse_amount(v).ok_or_else(|| invalid(TOTAL, &format!("{v} is not an amount")))?,
    };

    Ok(ReceiptRecord {
        merchant,
        date,
        items,
        total,
    })
}

fn parse_item(index: usize, entry: &Value) -> Result<LineItem, ReceiptError> {
    let label = |key: &str| format!("{}[{}].{}", ITEMS[0], index, key);
    let obj = entry.as_object().ok_or_else(|| ReceiptError::InvalidField {
        field: format!("{}[{}]", ITEMS[0], index),
        detail: format!("expected an object, got {entry}"),
    })?;

    let name = match field(obj, ITEM_NAME) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(ReceiptError::InvalidField {
                field: label(ITEM_NAME[0]),
                detail: format!("{other} is not a name"),
            })
        }
        None => return Err(ReceiptError::MissingField { field: label(ITEM_NAME[0]) }),
    };

    let price = match field(obj, ITEM_PRICE) {
        Some(v) => parse_amount(v).ok_or_else(|| ReceiptError::InvalidField {
            field: label(ITEM_PRICE[0]),
            detail: format!("{v} is not an amount"),
        })?,
        None => return Err(ReceiptError::MissingField { field: label(ITEM_PRICE[0]) }),
    };

    Ok(LineItem { name, price })
}

/// Look a field up under its Korean key first, then its English aliases.
fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn required_string(obj: &Map<String, Value>, keys: &[&str]) -> Result<String, ReceiptError> {
    match field(obj, keys) {
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(invalid(keys, &format!("expected text, got {other}"))),
        None => Err(missing(keys[0])),
    }
}

fn missing(field: &str) -> ReceiptError {
    ReceiptError::MissingField {
        field: field.to_string(),
    }
}

fn invalid(keys: &[&str], detail: &str) -> ReceiptError {
    ReceiptError::InvalidField {
        field: keys[0].to_string(),
        detail: detail.to_string(),
    }
}

/// Accept plain numbers and strings such as `"4,500원"` or `"₩ 12,000"`.
pub fn parse_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .trim_end_matches('원')
                .trim_end_matches("KRW")
                .trim_start_matches('₩')
                .chars()
                .filter(|c| !c.is_whitespace() && *c != ',')
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

static RE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})\s*[-./년]\s*(\d{1,2})\s*[-./월]\s*(\d{1,2})").unwrap()
});

/// Normalise `YYYY-MM-DD`, `YYYY.MM.DD`, `YYYY/M/D` and `2024년 1월 5일`
/// (optionally followed by a time) to `YYYY-MM-DD`.
pub fn normalize_date(raw: &str) -> Option<String> {
    let caps = RE_DATE.captures(raw.trim())?;
    let year: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let day: u32 = caps[3].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(format!("{year:04}-{month:02}-{day:02}"))
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    let mut p: String = text.chars().take(MAX).collect();
    if text.chars().count() > MAX {
        p.push('…');
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pipeline::llm::ModelCallError;
    use crate::record::FileKind;
    use async_trait::async_trait;
    use serde_json::json;

    const CAFE_X: &str = concat!(
        r#"prefix {"상호명":"Cafe X","날짜":"2024-01-01","#,
        r#""항목":[{"이름":"Latte","가격":4500}],"총액":4500} suffix"#,
    );

    struct Scripted(Result<String, ModelCallError>);

    #[async_trait]
    impl ChatModel for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn chat(&self, _m: &[ChatMessage]) -> Result<String, ModelCallError> {
            self.0.clone()
        }
    }

    fn image() -> NormalizedImage {
        NormalizedImage {
            data: "aGVsbG8=".into(),
            mime_type: "image/jpeg".into(),
            source: FileKind::Image,
        }
    }

    #[test]
    fn parses_cafe_x() {
        let r = parse_receipt(CAFE_X).unwrap();
        assert_eq!(r.merchant, "Cafe X");
        assert_eq!(r.date, "2024-01-01");
        assert_eq!(
            r.items,
            vec![LineItem {
                name: "Latte".into(),
                price: 4500.0
            }]
        );
        assert_eq!(r.total, 4500.0);
    }

    #[test]
    fn no_object_is_extraction_error() {
        let err = parse_receipt("I cannot read this receipt.").unwrap_err();
        assert!(matches!(err, ReceiptError::NoJsonObject { .. }));
        assert_eq!(err.kind(), ErrorKind::Extraction);
    }

    #[test]
    fn missing_total_fails_fast() {
        let err =
            parse_receipt(r#"{"상호명":"Cafe X","날짜":"2024-01-01","항목":[]}"#).unwrap_err();
        match err {
            ReceiptError::MissingField { field } => assert_eq!(field, "총액"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_items_fails_but_empty_is_fine() {
        let err = parse_receipt(r#"{"상호명":"A","날짜":"2024-01-01","총액":1}"#).unwrap_err();
        assert!(matches!(err, ReceiptError::MissingField { ref field } if field == "항목"));

        let r = parse_receipt(r#"{"상호명":"A","날짜":"2024-01-01","항목":[],"총액":1}"#).unwrap();
        assert!(r.items.is_empty());
    }

    #[test]
    fn item_without_price_fails() {
        let err = parse_receipt(
            r#"{"상호명":"A","날짜":"2024-01-01","항목":[{"이름":"Latte"}],"총액":1}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("항목[0].가격"), "got: {err}");
    }

    #[test]
    fn empty_merchant_is_invalid() {
        let err =
            parse_receipt(r#"{"상호명":"  ","날짜":"2024-01-01","항목":[],"총액":1}"#).unwrap_err();
        assert!(matches!(err, ReceiptError::InvalidField { .. }));
    }

    #[test]
    fn english_aliases_and_string_amounts() {
        let r = parse_receipt(
            concat!(
                r#"{"merchant":"김밥천국","date":"2024.03.05","#,
                r#""items":[{"name":"라면","price":"4,500원"}],"total":"₩4,500"}"#,
            ),
        )
        .unwrap();
        assert_eq!(r.merchant, "김밥천국");
        assert_eq!(r.date, "2024-03-05");
        assert_eq!(r.items[0].price, 4500.0);
        assert_eq!(r.total, 4500.0);
    }

    #[test]
    fn dates_normalise() {
        assert_eq!(normalize_date("2024/1/5").as_deref(), Some("2024-01-05"));
        assert_eq!(normalize_date("2024년 1월 5일").as_deref(), Some("2024-01-05"));
        assert_eq!(normalize_date("2024-01-05 13:45").as_deref(), Some("2024-01-05"));
        assert_eq!(normalize_date("2024-13-05"), None);
        assert_eq!(normalize_date("yesterday"), None);
    }

    #[test]
    fn amounts() {
        assert_eq!(parse_amount(&json!(12.5)), Some(12.5));
        assert_eq!(parse_amount(&json!("12,000 원")), Some(12000.0));
        assert_eq!(parse_amount(&json!("")), None);
        assert_eq!(parse_amount(&json!(null)), None);
        assert_eq!(parse_amount(&json!("free")), None);
    }

    #[tokio::test]
    async fn upstream_failure_is_retryable_extraction_error() {
        let ex = ReceiptExtractor::new(Arc::new(Scripted(Err(ModelCallError::Provider(
            "503".into(),
        )))));
        let err = ex.extract(&image()).await.unwrap_err();
        assert!(matches!(err, ReceiptError::ExtractionUpstream { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn totals_mismatch_warns_or_fails() {
        let text = concat!(
            r#"{"상호명":"A","날짜":"2024-01-01","#,
            r#""항목":[{"이름":"x","가격":100}],"총액":900}"#,
        );
        let lenient = ReceiptExtractor::new(Arc::new(Scripted(Ok(text.into()))));
        assert_eq!(lenient.extract(&image()).await.unwrap().total, 900.0);

        let strict =
            ReceiptExtractor::new(Arc::new(Scripted(Ok(text.into())))).with_strict_totals(true);
        let err = strict.extract(&image()).await.unwrap_err();
        assert!(matches!(err, ReceiptError::InvalidField { ref field, .. } if field == "총액"));
        assert!(!err.is_retryable());
    }
}
