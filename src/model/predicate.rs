//! Validated filter predicates and their rendering into match documents.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::error::PredicateError;

/// Comparison operator for numeric and array-size predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    pub fn operator(&self) -> &'static str {
        match self {
            Comparison::Eq => "$eq",
            Comparison::Gt => "$gt",
            Comparison::Gte => "$gte",
            Comparison::Lt => "$lt",
            Comparison::Lte => "$lte",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparison::Eq => "=",
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
        };
        f.write_str(s)
    }
}

/// A value used as a range bound.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Date(DateTime<Utc>),
    Number(f64),
}

impl BoundValue {
    pub fn to_value(&self) -> Value {
        match self {
            BoundValue::Date(dt) => date_value(dt),
            BoundValue::Number(n) => json!(n),
        }
    }

    fn compare(&self, other: &BoundValue) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (BoundValue::Date(a), BoundValue::Date(b)) => a.partial_cmp(b),
            (BoundValue::Number(a), BoundValue::Number(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Extended-JSON date literal understood by the store.
pub fn date_value(dt: &DateTime<Utc>) -> Value {
    json!({ "$date": dt.to_rfc3339_opts(SecondsFormat::Millis, true) })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    pub value: BoundValue,
    pub inclusive: bool,
}

impl RangeBound {
    pub fn inclusive(value: BoundValue) -> Self {
        Self {
            value,
            inclusive: true,
        }
    }

    pub fn exclusive(value: BoundValue) -> Self {
        Self {
            value,
            inclusive: false,
        }
    }
}

/// Closed set of predicates a normalized filter can compile to.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterPredicate {
    Equals(Value),
    Regex {
        pattern: String,
        case_insensitive: bool,
    },
    Range {
        lower: Option<RangeBound>,
        upper: Option<RangeBound>,
    },
    /// Length of the array at the predicate's path.
    ArraySize { op: Comparison, size: i64 },
    /// At least one array element satisfies all sub-conditions.
    ElemMatch(Vec<(String, FilterPredicate)>),
    Boolean(bool),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    /// Full-text search; the path is ignored.
    Text(String),
}

impl FilterPredicate {
    pub fn regex(pattern: impl Into<String>) -> Result<Self, PredicateError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(PredicateError::EmptyPattern);
        }
        Ok(FilterPredicate::Regex {
            pattern,
            case_insensitive: true,
        })
    }

    pub fn range(
        lower: Option<RangeBound>,
        upper: Option<RangeBound>,
    ) -> Result<Self, PredicateError> {
        match (&lower, &upper) {
            (None, None) => return Err(PredicateError::UnboundedRange),
            (Some(lo), Some(hi)) => {
                if lo.value.compare(&hi.value) == Some(std::cmp::Ordering::Greater) {
                    return Err(PredicateError::InvertedRange);
                }
            }
            _ => {}
        }
        Ok(FilterPredicate::Range { lower, upper })
    }

    pub fn array_size(op: Comparison, size: i64) -> Result<Self, PredicateError> {
        if size < 0 {
            return Err(PredicateError::NegativeSize(size));
        }
        Ok(FilterPredicate::ArraySize { op, size })
    }

    pub fn in_list(values: Vec<Value>) -> Result<Self, PredicateError> {
        if values.is_empty() {
            return Err(PredicateError::EmptyList);
        }
        Ok(FilterPredicate::In(values))
    }

    pub fn not_in_list(values: Vec<Value>) -> Result<Self, PredicateError> {
        if values.is_empty() {
            return Err(PredicateError::EmptyList);
        }
        Ok(FilterPredicate::NotIn(values))
    }

    pub fn elem_match(conditions: Vec<(String, FilterPredicate)>) -> Result<Self, PredicateError> {
        if conditions.is_empty() {
            return Err(PredicateError::EmptyList);
        }
        for (key, predicate) in &conditions {
            if !is_plain_identifier(key) {
                return Err(PredicateError::InvalidElementKey(key.clone()));
            }
            if matches!(
                predicate,
                FilterPredicate::ArraySize { .. }
                    | FilterPredicate::Text(_)
                    | FilterPredicate::ElemMatch(_)
            ) {
                return Err(PredicateError::NestedNotAllowed);
            }
        }
        Ok(FilterPredicate::ElemMatch(conditions))
    }

    pub fn text(search: impl Into<String>) -> Result<Self, PredicateError> {
        let search = search.into();
        if search.trim().is_empty() {
            return Err(PredicateError::EmptyPattern);
        }
        Ok(FilterPredicate::Text(search))
    }

    /// Value placed under the field key in a match document.
    ///
    /// `ArraySize` and `Text` are document-level and handled by [`MatchDocument`].
    fn condition(&self) -> Value {
        match self {
            FilterPredicate::Equals(v) => v.clone(),
            FilterPredicate::Regex {
                pattern,
                case_insensitive,
            } => {
                let mut m = Map::new();
                m.insert("$regex".into(), Value::String(pattern.clone()));
                if *case_insensitive {
                    m.insert("$options".into(), Value::String("i".into()));
                }
                Value::Object(m)
            }
            FilterPredicate::Range { lower, upper } => {
                let mut m = Map::new();
                if let Some(lo) = lower {
                    let op = if lo.inclusive { "$gte" } else { "$gt" };
                    m.insert(op.into(), lo.value.to_value());
                }
                if let Some(hi) = upper {
                    let op = if hi.inclusive { "$lte" } else { "$lt" };
                    m.insert(op.into(), hi.value.to_value());
                }
                Value::Object(m)
            }
            FilterPredicate::Boolean(b) => Value::Bool(*b),
            FilterPredicate::In(values) => json!({ "$in": values }),
            FilterPredicate::NotIn(values) => json!({ "$nin": values }),
            FilterPredicate::ElemMatch(conditions) => {
                let inner: Map<String, Value> = conditions
                    .iter()
                    .map(|(k, p)| (k.clone(), p.condition()))
                    .collect();
                json!({ "$elemMatch": inner })
            }
            FilterPredicate::ArraySize { .. } | FilterPredicate::Text(_) => Value::Null,
        }
    }
}

/// Plain field identifier: no operators, no empty segments.
pub fn is_plain_identifier(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('$')
        && key
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_alphanumeric() || c == '_'))
}

/// A predicate bound to a canonical field path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPredicate {
    pub path: String,
    pub predicate: FilterPredicate,
}

impl FieldPredicate {
    pub fn new(path: impl Into<String>, predicate: FilterPredicate) -> Self {
        Self {
            path: path.into(),
            predicate,
        }
    }
}

/// Builds the body of a `Match` stage from field predicates.
///
/// Two predicates on the same path are merged when both render to operator
/// objects with disjoint operators; otherwise both go under `$and`.
#[derive(Debug, Clone, Default)]
pub struct MatchDocument {
    fields: Map<String, Value>,
    exprs: Vec<Value>,
    conjuncts: Vec<Value>,
    text: Option<String>,
}

impl MatchDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, predicate: &FieldPredicate) {
        match &predicate.predicate {
            FilterPredicate::ArraySize { op, size } => {
                let length = json!({ "$size": { "$ifNull": [format!("${}", predicate.path), []] } });
                let mut cmp = Map::new();
                cmp.insert(op.operator().into(), json!([length, size]));
                self.exprs.push(Value::Object(cmp));
            }
            FilterPredicate::Text(search) => {
                self.text = Some(search.clone());
            }
            other => {
                let condition = other.condition();
                match self.fields.get_mut(&predicate.path) {
                    None => {
                        self.fields.insert(predicate.path.clone(), condition);
                    }
                    Some(existing) => {
                        if !merge_operators(existing, &condition) {
                            let mut single = Map::new();
                            single.insert(predicate.path.clone(), condition);
                            self.conjuncts.push(Value::Object(single));
                        }
                    }
                }
            }
        }
    }

    pub fn extend<'a>(&mut self, predicates: impl IntoIterator<Item = &'a FieldPredicate>) {
        for p in predicates {
            self.push(p);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.exprs.is_empty() && self.conjuncts.is_empty() && self.text.is_none()
    }

    pub fn into_map(self) -> Map<String, Value> {
        let mut out = Map::new();
        if let Some(search) = self.text {
            out.insert("$text".into(), json!({ "$search": search }));
        }
        out.extend(self.fields);
        match self.exprs.len() {
            0 => {}
            1 => {
                out.insert("$expr".into(), self.exprs.into_iter().next().unwrap_or(Value::Null));
            }
            _ => {
                out.insert("$expr".into(), json!({ "$and": self.exprs }));
            }
        }
        if !self.conjuncts.is_empty() {
            out.insert("$and".into(), Value::Array(self.conjuncts));
        }
        out
    }
}

fn merge_operators(existing: &mut Value, incoming: &Value) -> bool {
    let (Value::Object(a), Value::Object(b)) = (existing, incoming) else {
        return false;
    };
    let all_ops = |m: &Map<String, Value>| m.keys().all(|k| k.starts_with('$'));
    if !all_ops(a) || !all_ops(b) || b.keys().any(|k| a.contains_key(k)) {
        return false;
    }
    for (k, v) in b {
        a.insert(k.clone(), v.clone());
    }
    true
}
