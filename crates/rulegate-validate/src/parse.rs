use serde_json::Value;
use thiserror::Error;

use rulegate_core::Evidence;

/// The model answered, but not in the required shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON object found")]
    NoJson,
    #[error("invalid JSON: {0}")]
    Malformed(String),
    #[error("`compliant` is missing or not a boolean")]
    MissingVerdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVerdict {
    pub compliant: bool,
    pub evidence: Evidence,
}

/// Parse raw model output into a verdict. Tolerates prose or code fences
/// around the object; anything else is a `ParseError`.
pub fn parse_verdict(raw: &str) -> Result<ParsedVerdict, ParseError> {
    let json_str = extract_json_object(raw).ok_or(ParseError::NoJson)?;

    match serde_json::from_str::<Value>(json_str) {
        Ok(value) => verdict_from_value(&value),
        Err(e) => {
            // Fall back to scanning for any well-formed object that carries a verdict
            scan_objects(json_str)
                .into_iter()
                .find_map(|v| verdict_from_value(&v).ok())
                .ok_or_else(|| ParseError::Malformed(e.to_string()))
        }
    }
}

/// Extract the outermost `{...}` substring from raw output.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&raw[start..=end])
}

/// Collect every balanced top-level object that parses on its own.
fn scan_objects(text: &str) -> Vec<Value> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
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
                        if let Ok(v) = serde_json::from_str::<Value>(&text[s..=i]) {
                            out.push(v);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    out
}

fn verdict_from_value(value: &Value) -> Result<ParsedVerdict, ParseError> {
    let compliant = match value.get("compliant") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => true,
            "false" | "no" => false,
            _ => return Err(ParseError::MissingVerdict),
        },
        _ => return Err(ParseError::MissingVerdict),
    };

    let text = |key: &str| match value.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    Ok(ParsedVerdict {
        compliant,
        evidence: Evidence {
            quote: text("evidence"),
            location: text("location"),
        },
    })
}
