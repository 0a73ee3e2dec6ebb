//! Predicate expressions used by declarative routers.
//!
//! Supported forms, evaluated against the component input:
//! - `key == "value"`: exact match
//! - `key != "value"`: not equal
//! - `key contains "substr"`: substring match
//! - `key matches "regex"`: regex match
//! - `key`: truthiness
//!
//! `key` is a dotted path into an object input (`user.tier`). The special
//! key `input` refers to the whole input value.

use regex::Regex;

use pipegraph_core::error::{FlowError, Result};
use pipegraph_core::types::Value;

#[derive(Debug, Clone)]
pub enum Expr {
    Equals { key: String, value: String },
    NotEquals { key: String, value: String },
    Contains { key: String, substr: String },
    Matches { key: String, pattern: Regex },
    Truthy { key: String },
}

impl Expr {
    /// Parse an expression. Unparseable text is an error rather than a
    /// predicate that silently never matches.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();

        // key matches "regex"
        if let Some((key, pattern)) = parse_operator(expr, " matches ") {
            let pattern = Regex::new(pattern).map_err(|e| {
                FlowError::Config(format!("invalid regex in '{}': {}", expr, e))
            })?;
            return Ok(Self::Matches {
                key: key.to_string(),
                pattern,
            });
        }

        // key contains "value"
        if let Some((key, substr)) = parse_operator(expr, " contains ") {
            return Ok(Self::Contains {
                key: key.to_string(),
                substr: substr.to_string(),
            });
        }

        // key != "value"
        if let Some((key, value)) = parse_operator(expr, "!=") {
            return Ok(Self::NotEquals {
                key: key.to_string(),
                value: value.to_string(),
            });
        }

        // key == "value"
        if let Some((key, value)) = parse_operator(expr, "==") {
            return Ok(Self::Equals {
                key: key.to_string(),
                value: value.to_string(),
            });
        }

        if is_key(expr) {
            return Ok(Self::Truthy {
                key: expr.to_string(),
            });
        }

        Err(FlowError::Config(format!(
            "unparseable predicate expression: '{}'",
            expr
        )))
    }

    /// Evaluate against an input value. Missing keys never match, except
    /// under `!=`, where a missing key also does not match.
    pub fn evaluate(&self, input: &Value) -> bool {
        match self {
            Self::Equals { key, value } => lookup_text(input, key).is_some_and(|s| s == *value),
            Self::NotEquals { key, value } => {
                lookup_text(input, key).is_some_and(|s| s != *value)
            }
            Self::Contains { key, substr } => {
                lookup_text(input, key).is_some_and(|s| s.contains(substr.as_str()))
            }
            Self::Matches { key, pattern } => {
                lookup_text(input, key).is_some_and(|s| pattern.is_match(&s))
            }
            Self::Truthy { key } => lookup(input, key).is_some_and(truthy),
        }
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if !is_key(key) {
        return None;
    }
    let val = val.trim().trim_matches('"');
    Some((key, val))
}

fn is_key(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
}

fn lookup<'a>(input: &'a Value, key: &str) -> Option<&'a Value> {
    if key == "input" {
        return Some(input);
    }
    key.split('.')
        .try_fold(input, |current, part| current.as_object()?.get(part))
}

/// Strings compare by content; everything else by its JSON text.
pub(crate) fn lookup_text(input: &Value, key: &str) -> Option<String> {
    lookup(input, key).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
