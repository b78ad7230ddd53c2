//! Prompt texts for every model call in the pipeline.
//!
//! All prompt wording lives here so that stage code only assembles messages.
//! The extraction system instruction can be replaced through
//! [`crate::config::PipelineConfig::system_prompt`]; the rest are fixed
//! because the parsers in [`crate::pipeline`] depend on their answer shape.

use crate::record::{AccountLabel, ReceiptRecord};

/// Default system instruction for the Structured Extractor.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an assistant that extracts information from receipt images.";

/// User-turn instruction sent alongside the receipt image.
///
/// The schema keys are the ones [`crate::pipeline::extract::parse_receipt`]
/// looks for first.
pub const EXTRACTION_INSTRUCTION: &str = r#"다음 이미지는 영수증입니다. 이 영수증에서 가게 이름, 날짜, 항목, 총액을 분석하고, 아래의 JSON 형식으로 결과를 반환해 주세요.
JSON 형식:
```json
{
    "상호명": "가게 이름",
    "날짜": "YYYY-MM-DD",
    "항목": [
        {"이름": "상품1", "가격": 상품1 가격},
        {"이름": "상품2", "가격": 상품2 가격}
    ],
    "총액": 총액
}
```
반환할 JSON 형식은 반드시 위의 구조와 일치해야 하며, 가격과 총액은 숫자로만 적어 주세요.
JSON은 ```json 코드 블록 하나에 담고, 불필요한 설명은 포함하지 마세요."#;

/// Prompt asking a text model for a one-word business category.
pub fn category_prompt(merchant: &str, snippets: &str) -> String {
    let results = if snippets.trim().is_empty() {
        "(검색 결과 없음)"
    } else {
        snippets
    };
    format!(
        "다음은 상호명 '{merchant}'에 대한 검색 결과입니다:\n\
{results}\n\
검색 결과를 기반으로 해당 상호의 업종을 추론하세요. 가능한 경우 단답형으로 업종만 답변하세요.\n\
예: \"식당\", \"카페\", \"의류\", \"교통\" 등."
    )
}

/// Standing instructions for the in-process assistant thread.
pub const ASSISTANT_INSTRUCTIONS: &str = "당신은 회사 경비를 분류하는 회계 담당자입니다. \
영수증 정보와 업종을 보고 비목을 판단합니다. 항상 요청받은 JSON 형식으로만 답합니다.";

/// The turn appended to the assistant thread for one classification.
pub fn account_prompt(record: &ReceiptRecord, category: &str) -> String {
    let labels = [
        AccountLabel::MeetingExpense,
        AccountLabel::MealExpense,
        AccountLabel::TransportExpense,
    ]
    .iter()
    .map(|l| l.ledger_name())
    .collect::<Vec<_>>()
    .join(", ");

    let items = if record.items.is_empty() {
        "(항목 없음)".to_string()
    } else {
        record
            .items
            .iter()
            .map(|i| format!("- {}: {}원", i.name, crate::record::format_amount(i.price)))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "영수증 정보:\n\
상호명: {merchant}\n\
날짜: {date}\n\
항목:\n{items}\n\
총액: {total}원\n\
업종: {category}\n\n\
{category}를 제공한 영수증을 바탕으로 판단을 해줘.\n\
{labels} 중의 하나로 판단해 주고, 대답은 \
{{\"판단\": 대답, \"근거\": 판단한 근거}} 형식의 json으로 답해 줘.\n\
세개 카테고리 중의 하나로 판단이 안되면, \"판단\"을 \"{cannot}\"으로 답해줘.",
        merchant = record.merchant,
        date = record.date,
        total = crate::record::format_amount(record.total),
        cannot = AccountLabel::CannotDetermine.ledger_name(),
    )
}
