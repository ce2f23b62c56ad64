//! Locate and decode the JSON object embedded in a free-text model answer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How the candidate `{...}` span is chosen inside the raw answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// First `{` up to the first `}` after it. Nested objects are cut short
    /// and then fail to decode.
    #[default]
    FirstBraces,
    /// First `{` up to its matching `}`, ignoring braces inside JSON strings.
    Balanced,
}

/// Field name to raw value, as decoded from the answer.
pub type ParsedAnswer = Map<String, Value>;

/// Outcome of extraction. Failure is an ordinary value, never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Parsed(ParsedAnswer),
    /// No `{` or no `}` after it.
    NoBraces,
    /// A span was found but it is not a JSON object.
    Malformed(String),
}

impl Extraction {
    pub fn parsed(&self) -> Option<&ParsedAnswer> {
        match self {
            Extraction::Parsed(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Extraction::Parsed(_))
    }

    /// Short machine-readable reason, `None` on success.
    pub fn failure_reason(&self) -> Option<&'static str> {
        match self {
            Extraction::Parsed(_) => None,
            Extraction::NoBraces => Some("no-braces"),
            Extraction::Malformed(_) => Some("malformed-json"),
        }
    }
}

/// Extract the answer object from `raw` using `strategy`.
pub fn extract_answer(raw: &str, strategy: ExtractionStrategy) -> Extraction {
    let span = match strategy {
        ExtractionStrategy::FirstBraces => first_brace_span(raw),
        ExtractionStrategy::Balanced => balanced_span(raw),
    };

    let Some(span) = span else {
        return Extraction::NoBraces;
    };

    match serde_json::from_str::<Value>(span) {
        Ok(Value::Object(map)) => Extraction::Parsed(map),
        Ok(other) => Extraction::Malformed(format!("expected object, got {other}")),
        Err(e) => Extraction::Malformed(e.to_string()),
    }
}

fn first_brace_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw[start..].find('}')? + start;
    Some(&raw[start..=end])
}

fn balanced_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let remainder = &raw[start..];
    let end = find_matching_brace(remainder)?;
    Some(&remainder[..end])
}

/// Byte offset just past the brace closing the one at offset 0.
/// Tracks "inside string" state so braces within `"..."` are not counted.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
