//! Value coercion per declared field kind.
//!
//! Each coercer turns one raw JSON value into a [`FilterPredicate`] or reports
//! why it could not. Nothing here knows about keys or entities.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::model::{BoundValue, Comparison, FilterPredicate, RangeBound};
use crate::registry::EnumVocab;

/// `>N`, `>=N`, `<N`, `<=N`, `=N`, or a bare `N`.
static COMPARISON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(>=|<=|==|>|<|=)?\s*(-?\d+(?:\.\d+)?)\s*$").unwrap()
});

/// Why a value was rejected. Becomes the diagnostic message.
pub type CoerceResult = Result<FilterPredicate, String>;

/// Parse the comparison grammar shared by numeric and array-size filters.
pub fn parse_comparison(value: &Value) -> Option<(Comparison, f64)> {
    match value {
        Value::Number(n) => n.as_f64().map(|v| (Comparison::Eq, v)),
        Value::String(s) => {
            let caps = COMPARISON.captures(s)?;
            let op = match caps.get(1).map(|m| m.as_str()) {
                Some(">") => Comparison::Gt,
                Some(">=") => Comparison::Gte,
                Some("<") => Comparison::Lt,
                Some("<=") => Comparison::Lte,
                _ => Comparison::Eq,
            };
            let number = caps.get(2)?.as_str().parse().ok()?;
            Some((op, number))
        }
        _ => None,
    }
}

/// Loose boolean: `true/1/yes/on` and `false/0/no/off`.
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Membership wrapper: `{"in": [...]}`, `{"$in": [...]}`, `{"not_in": [...]}`, `{"$nin": [...]}`.
///
/// Returns the list and whether it is negated.
pub fn membership(value: &Value) -> Option<(&Vec<Value>, bool)> {
    let Value::Object(map) = value else {
        return None;
    };
    if map.len() != 1 {
        return None;
    }
    let (key, inner) = map.iter().next()?;
    let list = inner.as_array()?;
    match key.as_str() {
        "in" | "$in" => Some((list, false)),
        "not_in" | "nin" | "$nin" => Some((list, true)),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn wrap_list(values: Vec<Value>, negated: bool) -> Result<FilterPredicate, String> {
    let result = if negated {
        FilterPredicate::not_in_list(values)
    } else {
        FilterPredicate::in_list(values)
    };
    result.map_err(|e| e.to_string())
}

// ============================================================================
// Per-kind coercers
// ============================================================================

/// Case-insensitive substring match. A trailing `*` anchors a prefix match;
/// a list becomes one alternation.
pub fn coerce_text(value: &Value) -> CoerceResult {
    if let Some((list, negated)) = membership(value) {
        let values = list
            .iter()
            .filter_map(scalar_text)
            .filter(|s| !s.is_empty())
            .map(Value::String)
            .collect();
        return wrap_list(values, negated);
    }

    match value {
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(scalar_text)
                .filter(|s| !s.is_empty())
                .map(|s| text_pattern(&s))
                .collect();
            match parts.len() {
                0 => Err("empty text list".into()),
                1 => FilterPredicate::regex(parts[0].clone()).map_err(|e| e.to_string()),
                _ => FilterPredicate::regex(format!("({})", parts.join("|")))
                    .map_err(|e| e.to_string()),
            }
        }
        other => {
            let text = scalar_text(other).ok_or_else(|| format!("expected text, got {}", other))?;
            FilterPredicate::regex(text_pattern(&text)).map_err(|e| e.to_string())
        }
    }
}

fn text_pattern(text: &str) -> String {
    match text.strip_suffix('*') {
        Some(prefix) if !prefix.is_empty() => format!("^{}", regex::escape(prefix)),
        _ => regex::escape(text),
    }
}

/// Equality on the raw value; lists become membership.
pub fn coerce_exact(value: &Value) -> CoerceResult {
    if let Some((list, negated)) = membership(value) {
        return wrap_list(list.clone(), negated);
    }
    match value {
        Value::Array(items) => wrap_list(items.clone(), false),
        Value::Null | Value::Object(_) => Err(format!("expected a scalar, got {}", value)),
        other => Ok(FilterPredicate::Equals(other.clone())),
    }
}

/// Closed vocabulary. Unknown spellings are dropped; if none survive, the
/// whole filter is rejected.
pub fn coerce_enum(value: &Value, vocab: &EnumVocab) -> CoerceResult {
    let (raw, negated) = match membership(value) {
        Some((list, negated)) => (list.iter().collect::<Vec<_>>(), negated),
        None => match value {
            Value::Array(items) => (items.iter().collect(), false),
            other => (vec![other], false),
        },
    };

    let mut canonical: Vec<Value> = Vec::new();
    for item in raw {
        let Some(text) = item.as_str() else { continue };
        if let Some(v) = vocab.canonical(text) {
            let v = Value::String(v.to_string());
            if !canonical.contains(&v) {
                canonical.push(v);
            }
        }
    }

    if canonical.is_empty() {
        return Err(format!("no value recognized in vocabulary '{}'", vocab.name));
    }
    if negated {
        return wrap_list(canonical, true);
    }
    if canonical.len() == 1 {
        return Ok(FilterPredicate::Equals(canonical.remove(0)));
    }
    wrap_list(canonical, false)
}

pub fn coerce_bool(value: &Value) -> CoerceResult {
    parse_bool(value)
        .map(FilterPredicate::Boolean)
        .ok_or_else(|| format!("expected a boolean, got {}", value))
}

/// Numbers accept the comparison grammar; `=N` becomes plain equality.
pub fn coerce_number(value: &Value) -> CoerceResult {
    if let Some((list, negated)) = membership(value) {
        let numbers = list.iter().filter(|v| v.is_number()).cloned().collect();
        return wrap_list(numbers, negated);
    }
    if let Value::Array(items) = value {
        let numbers = items.iter().filter(|v| v.is_number()).cloned().collect();
        return wrap_list(numbers, false);
    }

    let (op, number) =
        parse_comparison(value).ok_or_else(|| format!("expected a number, got {}", value))?;
    let bound = BoundValue::Number(number);
    let predicate = match op {
        Comparison::Eq => {
            let literal = if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
                Value::from(number as i64)
            } else {
                Value::from(number)
            };
            return Ok(FilterPredicate::Equals(literal));
        }
        Comparison::Gt => FilterPredicate::range(Some(RangeBound::exclusive(bound)), None),
        Comparison::Gte => FilterPredicate::range(Some(RangeBound::inclusive(bound)), None),
        Comparison::Lt => FilterPredicate::range(None, Some(RangeBound::exclusive(bound))),
        Comparison::Lte => FilterPredicate::range(None, Some(RangeBound::inclusive(bound))),
    };
    predicate.map_err(|e| e.to_string())
}

/// Array length constraint. Sizes must be non-negative integers.
pub fn coerce_array_size(value: &Value) -> CoerceResult {
    let (op, number) = parse_comparison(value)
        .ok_or_else(|| format!("expected a size comparison, got {}", value))?;
    if number.fract() != 0.0 {
        return Err(format!("array size must be an integer, got {}", number));
    }
    FilterPredicate::array_size(op, number as i64).map_err(|e| e.to_string())
}

/// Sub-conditions applied jointly to one array element.
pub fn coerce_elem_match(value: &Value) -> CoerceResult {
    let Value::Object(map) = value else {
        return Err(format!("expected an object of sub-conditions, got {}", value));
    };
    let mut conditions = Vec::with_capacity(map.len());
    for (key, raw) in map {
        let predicate = match raw {
            Value::String(_) => coerce_text(raw)?,
            Value::Bool(b) => FilterPredicate::Boolean(*b),
            _ => coerce_exact(raw)?,
        };
        conditions.push((key.clone(), predicate));
    }
    FilterPredicate::elem_match(conditions).map_err(|e| e.to_string())
}

pub fn coerce_search(value: &Value) -> CoerceResult {
    let text = scalar_text(value).ok_or_else(|| format!("expected search text, got {}", value))?;
    FilterPredicate::text(text).map_err(|e| e.to_string())
}
