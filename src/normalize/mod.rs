//! Filter normalization - raw filter maps to validated predicates.
//!
//! Every key is resolved against the registry before its value is looked at:
//!
//! 1. the entity's alias map and field table (local predicate)
//! 2. registry relation filters such as `cycle_name` (joined predicate)
//! 3. suffixed keys: `_count`, `_elemMatch`, `_from`, `_to`, `_within`, `_duration`
//! 4. full-text search keys, when the collection is text-indexed
//! 5. raw allow-listed paths (equality)
//!
//! Anything else is dropped with a diagnostic. A bad value drops only its own key.

mod dates;
mod values;

pub use dates::{parse_date_spec, parse_duration_spec, DateSpec};
pub use values::{
    coerce_array_size, coerce_bool, coerce_elem_match, coerce_enum, coerce_exact, coerce_number,
    coerce_search, coerce_text, membership, parse_bool, parse_comparison, CoerceResult,
};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::{DiagnosticKind, Diagnostics};
use crate::model::{BoundValue, FieldPredicate, FilterPredicate, MatchDocument, RangeBound};
use crate::registry::{Entity, FieldKind, FieldMapping, Registry};

/// Keys routed to the collection's full-text index.
const SEARCH_KEYS: &[&str] = &["search", "text", "search_text", "keyword", "keywords"];

// ============================================================================
// Output
// ============================================================================

/// A predicate on a field that only exists after a join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedPredicate {
    /// Entity holding the field.
    pub target: String,
    /// Predicate with a path relative to the target's documents.
    pub predicate: FieldPredicate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedFilters {
    pub primary: Vec<FieldPredicate>,
    pub joined: Vec<JoinedPredicate>,
}

impl NormalizedFilters {
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.joined.is_empty()
    }

    /// Target entities of joined predicates, first occurrence order.
    pub fn joined_targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for j in &self.joined {
            if !out.contains(&j.target.as_str()) {
                out.push(&j.target);
            }
        }
        out
    }

    /// Body of the primary `Match` stage, or `None` when nothing is local.
    pub fn primary_match(&self) -> Option<Map<String, Value>> {
        let mut doc = MatchDocument::new();
        doc.extend(&self.primary);
        (!doc.is_empty()).then(|| doc.into_map())
    }
}

// ============================================================================
// Key resolution
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatePart {
    From,
    To,
    Within,
    Duration,
}

impl DatePart {
    fn from_suffix(key: &str) -> Option<(&str, DatePart)> {
        [
            ("_from", DatePart::From),
            ("_to", DatePart::To),
            ("_within", DatePart::Within),
            ("_duration", DatePart::Duration),
        ]
        .into_iter()
        .find_map(|(suffix, part)| key.strip_suffix(suffix).map(|base| (base, part)))
    }
}

enum Resolved<'e> {
    Field(&'e FieldMapping),
    Joined {
        target: &'e Entity,
        mapping: &'e FieldMapping,
    },
    Date {
        path: String,
        part: DatePart,
    },
    ArraySize(String),
    ElemMatch(String),
    Search,
    RawPath,
}

#[derive(Debug, Default)]
struct DateParts {
    from: Option<DateSpec>,
    to: Option<DateSpec>,
    within: Option<DateSpec>,
    duration: Option<DateSpec>,
}

/// Normalizes raw filter maps against a registry at a fixed instant.
pub struct FilterNormalizer<'r> {
    registry: &'r Registry,
    now: DateTime<Utc>,
}

impl<'r> FilterNormalizer<'r> {
    pub fn new(registry: &'r Registry, now: DateTime<Utc>) -> Self {
        Self { registry, now }
    }

    pub fn normalize(
        &self,
        entity: &Entity,
        filters: &Map<String, Value>,
        diagnostics: &mut Diagnostics,
    ) -> NormalizedFilters {
        let mut out = NormalizedFilters::default();
        let mut dates: Vec<(String, DateParts)> = Vec::new();

        let resolved: Vec<(&String, &Value, Option<Resolved<'_>>)> = filters
            .iter()
            .filter(|(_, v)| !is_unset(v))
            .map(|(k, v)| (k, v, self.resolve_key(entity, k)))
            .collect();

        for (key, value, resolution) in &resolved {
            let Some(resolution) = resolution else {
                diagnostics.push(
                    DiagnosticKind::InvalidFilterKey,
                    key.as_str(),
                    format!("not a filterable field of '{}'", entity.name),
                );
                continue;
            };

            match resolution {
                Resolved::Field(mapping) => {
                    if let Some(canonical) = superseded_by(key, mapping, &resolved) {
                        diagnostics.push(
                            DiagnosticKind::InvalidFilterKey,
                            key.as_str(),
                            format!("superseded by canonical key '{}'", canonical),
                        );
                        continue;
                    }
                    if mapping.kind.is_date() {
                        self.record_date(&mut dates, &mapping.path, DatePart::Within, key, value, diagnostics);
                        continue;
                    }
                    match self.coerce(mapping, value) {
                        Ok(predicate) => out.primary.push(FieldPredicate::new(&mapping.path, predicate)),
                        Err(message) => diagnostics.push(DiagnosticKind::InvalidFilterValue, key.as_str(), message),
                    }
                }
                Resolved::Joined { target, mapping } => {
                    let predicate = if mapping.kind.is_date() {
                        let mut parts = DateParts::default();
                        match parse_date_spec(value, self.now) {
                            Some(spec) => parts.within = Some(spec),
                            None => {
                                diagnostics.push(
                                    DiagnosticKind::MalformedDateSpec,
                                    key.as_str(),
                                    format!("unrecognized date {}", value),
                                );
                                continue;
                            }
                        }
                        self.date_range(&parts)
                    } else {
                        self.coerce(mapping, value)
                    };
                    match predicate {
                        Ok(predicate) => out.joined.push(JoinedPredicate {
                            target: target.name.clone(),
                            predicate: FieldPredicate::new(&mapping.path, predicate),
                        }),
                        Err(message) => diagnostics.push(DiagnosticKind::InvalidFilterValue, key.as_str(), message),
                    }
                }
                Resolved::Date { path, part } => {
                    self.record_date(&mut dates, path, *part, key, value, diagnostics);
                }
                Resolved::ArraySize(path) => match coerce_array_size(value) {
                    Ok(predicate) => out.primary.push(FieldPredicate::new(path, predicate)),
                    Err(message) => diagnostics.push(DiagnosticKind::InvalidFilterValue, key.as_str(), message),
                },
                Resolved::ElemMatch(path) => match coerce_elem_match(value) {
                    Ok(predicate) => out.primary.push(FieldPredicate::new(path, predicate)),
                    Err(message) => diagnostics.push(DiagnosticKind::InvalidFilterValue, key.as_str(), message),
                },
                Resolved::Search => match coerce_search(value) {
                    Ok(predicate) => out.primary.push(FieldPredicate::new("$text", predicate)),
                    Err(message) => diagnostics.push(DiagnosticKind::InvalidFilterValue, key.as_str(), message),
                },
                Resolved::RawPath => match coerce_exact(value) {
                    Ok(predicate) => out.primary.push(FieldPredicate::new(key.as_str(), predicate)),
                    Err(message) => diagnostics.push(DiagnosticKind::InvalidFilterValue, key.as_str(), message),
                },
            }
        }

        for (path, parts) in dates {
            match self.date_range(&parts) {
                Ok(predicate) => out.primary.push(FieldPredicate::new(path, predicate)),
                Err(message) => diagnostics.push(DiagnosticKind::InvalidFilterValue, path, message),
            }
        }

        trace!(
            entity = %entity.name,
            primary = out.primary.len(),
            joined = out.joined.len(),
            "filters normalized"
        );
        out
    }

    fn resolve_key<'e>(&self, entity: &'e Entity, key: &str) -> Option<Resolved<'e>>
    where
        'r: 'e,
    {
        if let Some(mapping) = entity.mapping(key) {
            return Some(Resolved::Field(mapping));
        }

        if let Some(filter) = self.registry.relation_filter(key) {
            if let Some(target) = self.registry.entity(&filter.target) {
                if target.name == entity.name {
                    return target.mapping(&filter.field).map(Resolved::Field);
                }
                return target
                    .mapping(&filter.field)
                    .map(|mapping| Resolved::Joined { target, mapping });
            }
        }

        if let Some(base) = key.strip_suffix("_count") {
            return array_path(entity, base).map(Resolved::ArraySize);
        }
        if let Some(base) = key.strip_suffix("_elemMatch") {
            return array_path(entity, base).map(Resolved::ElemMatch);
        }
        if let Some((base, part)) = DatePart::from_suffix(key) {
            return entity
                .mapping(base)
                .filter(|m| m.kind.is_date())
                .map(|m| Resolved::Date {
                    path: m.path.clone(),
                    part,
                });
        }

        if SEARCH_KEYS.contains(&key) {
            return entity.text_search.then_some(Resolved::Search);
        }

        entity.is_allowed(key).then_some(Resolved::RawPath)
    }

    fn coerce(&self, mapping: &FieldMapping, value: &Value) -> CoerceResult {
        match &mapping.kind {
            FieldKind::Text => coerce_text(value),
            FieldKind::Exact => coerce_exact(value),
            FieldKind::Boolean => coerce_bool(value),
            FieldKind::Number => coerce_number(value),
            FieldKind::Enum { vocab } => match self.registry.vocab(vocab) {
                Some(vocab) => coerce_enum(value, vocab),
                None => Err(format!("unknown vocabulary '{}'", vocab)),
            },
            FieldKind::Date => Err("date fields take a date specification".into()),
        }
    }

    fn record_date(
        &self,
        dates: &mut Vec<(String, DateParts)>,
        path: &str,
        part: DatePart,
        key: &str,
        value: &Value,
        diagnostics: &mut Diagnostics,
    ) {
        let spec = match part {
            DatePart::Duration => parse_duration_spec(value, self.now),
            _ => parse_date_spec(value, self.now),
        };
        let Some(spec) = spec else {
            diagnostics.push(
                DiagnosticKind::MalformedDateSpec,
                key,
                format!("unrecognized date {}", value),
            );
            return;
        };

        let idx = match dates.iter().position(|(p, _)| p == path) {
            Some(idx) => idx,
            None => {
                dates.push((path.to_string(), DateParts::default()));
                dates.len() - 1
            }
        };
        let parts = &mut dates[idx].1;
        let slot = match part {
            DatePart::From => &mut parts.from,
            DatePart::To => &mut parts.to,
            DatePart::Within => &mut parts.within,
            DatePart::Duration => &mut parts.duration,
        };
        *slot = Some(spec);
    }

    /// Merge the date parts for one field into a single range.
    ///
    /// Lower bound: `from`, else `within`, else `duration`.
    /// Upper bound: `to`, else the end implied by `within` (closed windows end
    /// exclusively, relative phrases end at now), else now for a relative
    /// `from` or a `duration`.
    fn date_range(&self, parts: &DateParts) -> CoerceResult {
        let now = self.now;
        let lower_spec = parts.from.or(parts.within).or(parts.duration);
        let lower = lower_spec.map(|s| RangeBound::inclusive(BoundValue::Date(s.start(now))));

        let implied_end = |spec: DateSpec| match spec {
            DateSpec::Window { end, .. } => Some(RangeBound::exclusive(BoundValue::Date(end))),
            DateSpec::Since(_) => Some(RangeBound::inclusive(BoundValue::Date(now))),
            DateSpec::Until(t) => Some(RangeBound::inclusive(BoundValue::Date(t))),
            DateSpec::Instant(_) => None,
        };

        let upper = if let Some(to) = parts.to {
            match to {
                DateSpec::Window { end, .. } => Some(RangeBound::exclusive(BoundValue::Date(end))),
                DateSpec::Instant(t) | DateSpec::Since(t) | DateSpec::Until(t) => {
                    Some(RangeBound::inclusive(BoundValue::Date(t)))
                }
            }
        } else if let Some(within) = parts.within {
            implied_end(within)
        } else if let Some(from) = parts.from.filter(DateSpec::is_relative) {
            implied_end(from)
        } else if parts.duration.is_some() && parts.from.is_none() {
            Some(RangeBound::inclusive(BoundValue::Date(now)))
        } else {
            None
        };

        FilterPredicate::range(lower, upper).map_err(|e| e.to_string())
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Logical array name to its path; a trailing plural `s` is tolerated.
fn array_path(entity: &Entity, base: &str) -> Option<String> {
    entity
        .arrays
        .get(base)
        .or_else(|| base.strip_suffix('s').and_then(|b| entity.arrays.get(b)))
        .cloned()
}

/// When `key` is a legacy alias and the canonical key is also present, the
/// canonical key wins.
fn superseded_by<'a>(
    key: &str,
    mapping: &'a FieldMapping,
    resolved: &[(&String, &Value, Option<Resolved<'_>>)],
) -> Option<&'a str> {
    if key == mapping.key {
        return None;
    }
    let canonical_present = resolved.iter().any(|(other, _, r)| {
        other.as_str() == mapping.key && matches!(r, Some(Resolved::Field(m)) if m.key == mapping.key)
    });
    canonical_present.then_some(mapping.key.as_str())
}
