//! Document-level sorting, including rank sorts on ordered vocabularies.

use serde_json::{json, Map, Value};

use crate::error::{DiagnosticKind, Diagnostics};
use crate::model::{SortDirection, SortKey};
use crate::registry::{EnumVocab, Entity, FieldKind, Registry};
use crate::resolve::JoinPlan;

/// Stages contributed by the sort phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortPlan {
    /// Computed rank fields, added before sorting.
    pub ranks: Map<String, Value>,
    pub keys: Vec<(String, SortDirection)>,
}

impl SortPlan {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Helper fields to drop at the end of the pipeline.
    pub fn helpers(&self) -> Vec<String> {
        self.ranks.keys().cloned().collect()
    }
}

/// `$switch` mapping each vocabulary value to its ordinal; unknown values rank 0.
pub fn rank_expression(path: &str, vocab: &EnumVocab) -> Value {
    let branches: Vec<Value> = vocab
        .values
        .iter()
        .filter_map(|value| {
            let rank = vocab.rank(value)?;
            Some(json!({
                "case": { "$eq": [format!("${}", path), value] },
                "then": rank,
            }))
        })
        .collect();
    json!({ "$switch": { "branches": branches, "default": 0 } })
}

/// Resolve requested sort keys against the entity and joined aliases.
pub fn sort_plan(
    entity: &Entity,
    registry: &Registry,
    sort: &[SortKey],
    joins: &JoinPlan,
    diagnostics: &mut Diagnostics,
) -> SortPlan {
    let mut out = SortPlan::default();

    for key in sort {
        if let Some(mapping) = entity.mapping(&key.field) {
            let ranked = match &mapping.kind {
                FieldKind::Enum { vocab } => registry.vocab(vocab).filter(|v| v.ranked),
                _ => None,
            };
            match ranked {
                Some(vocab) => {
                    let helper = format!("_{}Rank", mapping.key);
                    out.ranks
                        .insert(helper.clone(), rank_expression(&mapping.path, vocab));
                    out.keys.push((helper, key.direction));
                }
                None => out.keys.push((mapping.path.clone(), key.direction)),
            }
            continue;
        }

        if entity.is_allowed(&key.field) || is_joined_path(&key.field, joins) {
            out.keys.push((key.field.clone(), key.direction));
            continue;
        }

        diagnostics.push(
            DiagnosticKind::UnresolvedField,
            key.field.as_str(),
            format!("not a sortable field of '{}'", entity.name),
        );
    }

    out
}

/// `alias.field` under a join that exists in this query.
pub fn is_joined_path(field: &str, joins: &JoinPlan) -> bool {
    field
        .split_once('.')
        .is_some_and(|(alias, rest)| !rest.is_empty() && joins.join(alias).is_some())
}
