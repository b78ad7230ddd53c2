//! Recovery of a JSON object from free-form model output.
//!
//! Models are asked for a fenced ```json block, but answers still arrive
//! wrapped in prose, with stray braces in the prose, or with the fence
//! missing. Candidates are tried in this order and the first one that
//! parses as a JSON object wins:
//!
//! 1. the body of each fenced code block
//! 2. every balanced `{…}` region, found by a depth scanner that ignores
//!    braces inside string literals
//! 3. the greedy region from the first `{` to the last `}`
//!
//! Recovery never invents data: if nothing parses, the caller gets a
//! [`RecoveryFailure`] and decides how to report it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Why no object could be recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryFailure {
    /// The text holds no `{…}` region at all.
    NoObject,
    /// Candidate regions exist but none parsed; carries the last parse error.
    Malformed(String),
}

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap());

/// Recover the first JSON object embedded in `text`.
pub fn recover_object(text: &str) -> Result<Map<String, Value>, RecoveryFailure> {
    let mut last_error: Option<String> = None;
    let mut try_parse = |candidate: &str| -> Option<Map<String, Value>> {
        match serde_json::from_str::<Value>(candidate.trim()) {
            Ok(Value::Object(map)) => Some(map),
            Ok(other) => {
                last_error = Some(format!("expected an object, found {}", json_type(&other)));
                None
            }
            Err(e) => {
                last_error = Some(e.to_string());
                None
            }
        }
    };

    for caps in RE_FENCE.captures_iter(text) {
        let body = &caps[1];
        if let Some(map) = try_parse(body) {
            return Ok(map);
        }
        for region in balanced_regions(body) {
            if let Some(map) = try_parse(region) {
                return Ok(map);
            }
        }
    }

    for region in balanced_regions(text) {
        if let Some(map) = try_parse(region) {
            return Ok(map);
        }
    }

    let greedy = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => return Err(RecoveryFailure::NoObject),
    };
    if let Some(map) = try_parse(greedy) {
        return Ok(map);
    }

    Err(RecoveryFailure::Malformed(
        last_error.unwrap_or_else(|| "unparseable object".to_string()),
    ))
}

/// Remove one layer of markdown code fences, if the whole text is fenced.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let after_open = match trimmed.find('\n') {
        Some(i) => &trimmed[i + 1..],
        None => return trimmed.trim_matches('`').trim(),
    };
    after_open
        .trim_end()
        .strip_suffix("```")
        .unwrap_or(after_open)
        .trim()
}

/// Every top-level balanced `{…}` region, in order of appearance.
///
/// Braces inside JSON string literals (including escaped quotes) do not
/// affect depth. An unterminated `{` is treated as prose and scanning resumes
/// just after it, so a stray brace cannot hide a later object.
fn balanced_regions(text: &str) -> Vec<&str> {
    let mut regions = Vec::new();
    let mut from = 0;
    loop {
        let (found, unclosed) = scan_regions(&text[from..]);
        regions.extend(found);
        match unclosed {
            // `{` is one byte, so `s + 1` is a char boundary.
            Some(s) => from += s + 1,
            None => return regions,
        }
    }
}

/// One left-to-right pass. Returns the closed regions and the start of the
/// region still open at the end of `text`, if any.
fn scan_regions(text: &str) -> (Vec<&str>, Option<usize>) {
    let mut regions = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        regions.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    (regions, start)
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
