//! Template placeholder resolution and transform expressions.
//!
//! Two entry points with different failure behaviour:
//! - [`resolve_expressions`] walks arbitrary JSON and substitutes `{{ … }}`
//!   placeholders best-effort: a fragment that fails to evaluate is kept
//!   verbatim so a bad template never blocks a step on its own.
//! - [`evaluate_transform`] evaluates a single expression and propagates
//!   errors — transform steps must fail explicitly.
//!
//! Expressions are dotted paths over the run context root
//! (`trigger`, `steps`, `variables`) with `[index]` and `["quoted key"]`
//! accessors, plus the `$now()` / `$uuid()` / `$timestamp()` built-ins.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::traits::RunContext;

#[derive(Debug, Clone, Error)]
pub enum ExpressionError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("evaluation error: {0}")]
    Eval(String),
}

/// Resolve every `{{ … }}` placeholder in `template` against the context.
///
/// A string that is exactly one placeholder yields the raw looked-up value,
/// preserving numbers, arrays, objects and null. A string with embedded or
/// multiple placeholders is interpolated: each value is stringified and
/// spliced back in reverse index order so earlier offsets stay valid.
pub fn resolve_expressions(template: &Value, ctx: &RunContext) -> Value {
    let root = ctx.as_value();
    resolve_value(template, &root)
}

/// Evaluate a single transform expression, propagating failures.
pub fn evaluate_transform(expression: &str, ctx: &RunContext) -> Result<Value, ExpressionError> {
    evaluate(expression, &ctx.as_value())
}

fn resolve_value(value: &Value, root: &Value) -> Value {
    match value {
        Value::String(s) => resolve_string(s, root),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, root)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, root)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, root: &Value) -> Value {
    let placeholders = find_placeholders(s);
    if placeholders.is_empty() {
        return Value::String(s.to_string());
    }

    // Whole-string placeholder: return the raw value, whatever its type.
    if placeholders.len() == 1 {
        let (start, end, inner) = placeholders[0];
        if start == 0 && end == s.len() {
            return match evaluate(inner, root) {
                Ok(value) => value,
                Err(_) => Value::String(s.to_string()),
            };
        }
    }

    let mut out = s.to_string();
    for (start, end, inner) in placeholders.iter().rev() {
        if let Ok(value) = evaluate(inner, root) {
            out.replace_range(*start..*end, &stringify(&value));
        }
    }
    Value::String(out)
}

/// Byte ranges of `{{ … }}` fragments: (start, end-exclusive, inner text).
fn find_placeholders(s: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(rel_open) = s[from..].find("{{") {
        let open = from + rel_open;
        let Some(rel_close) = s[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + rel_close;
        found.push((open, close + 2, &s[open + 2..close]));
        from = close + 2;
    }
    found
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn evaluate(expression: &str, root: &Value) -> Result<Value, ExpressionError> {
    let expression = expression.trim();
    match expression {
        "" => return Err(ExpressionError::Parse("empty expression".to_string())),
        "$now()" => {
            return Ok(Value::String(
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ))
        }
        "$uuid()" => return Ok(Value::String(Uuid::new_v4().to_string())),
        "$timestamp()" => return Ok(Value::from(Utc::now().timestamp_millis())),
        _ => {}
    }

    let mut current = root;
    for segment in &parse_path(expression)? {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key).ok_or_else(|| {
                ExpressionError::Eval(format!("unknown field '{key}' in '{expression}'"))
            })?,
            (Segment::Index(idx), Value::Array(items)) => items.get(*idx).ok_or_else(|| {
                ExpressionError::Eval(format!("index {idx} out of bounds in '{expression}'"))
            })?,
            (Segment::Key(key), _) => {
                return Err(ExpressionError::Eval(format!(
                    "cannot read field '{key}' of a non-object in '{expression}'"
                )))
            }
            (Segment::Index(idx), _) => {
                return Err(ExpressionError::Eval(format!(
                    "cannot index [{idx}] into a non-array in '{expression}'"
                )))
            }
        };
    }
    Ok(current.clone())
}

fn parse_path(expression: &str) -> Result<Vec<Segment>, ExpressionError> {
    let bytes = expression.as_bytes();
    let n = bytes.len();
    let mut segments = Vec::new();
    let mut i = 0;

    loop {
        let start = i;
        while i < n && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
        if i == start || bytes[start].is_ascii_digit() {
            return Err(ExpressionError::Parse(format!(
                "expected identifier at offset {start} in '{expression}'"
            )));
        }
        segments.push(Segment::Key(expression[start..i].to_string()));

        while i < n && bytes[i] == b'[' {
            i += 1;
            if i < n && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let quote = bytes[i];
                i += 1;
                let key_start = i;
                while i < n && bytes[i] != quote {
                    i += 1;
                }
                if i >= n {
                    return Err(ExpressionError::Parse(format!(
                        "unterminated quoted key in '{expression}'"
                    )));
                }
                segments.push(Segment::Key(expression[key_start..i].to_string()));
                i += 1;
            } else {
                let digit_start = i;
                while i < n && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i == digit_start {
                    return Err(ExpressionError::Parse(format!(
                        "expected array index at offset {digit_start} in '{expression}'"
                    )));
                }
                let index = expression[digit_start..i]
                    .parse()
                    .map_err(|e| ExpressionError::Parse(format!("bad index: {e}")))?;
                segments.push(Segment::Index(index));
            }
            if i >= n || bytes[i] != b']' {
                return Err(ExpressionError::Parse(format!(
                    "expected ']' at offset {i} in '{expression}'"
                )));
            }
            i += 1;
        }

        if i >= n {
            break;
        }
        if bytes[i] == b'.' {
            i += 1;
            continue;
        }
        return Err(ExpressionError::Parse(format!(
            "unexpected character at offset {i} in '{expression}'"
        )));
    }

    Ok(segments)
}
