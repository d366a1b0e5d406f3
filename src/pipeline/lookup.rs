//! Lookup rendering for resolved joins.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::model::{LookupOperator, LookupStage, PipelineStage, UnwindStage};
use crate::registry::{JoinMechanism, Registry, RelationshipEdge};
use crate::resolve::JoinSpec;

/// Scratch field for the inner document of an indirect join.
const INDIRECT_FIELD: &str = "__indirect";

/// Lookup (and unwind, when flagged) for one join.
pub fn join_stages(spec: &JoinSpec, registry: &Registry) -> Vec<PipelineStage> {
    let Some(lookup) = lookup_for(spec, registry) else {
        warn!(
            relation = %spec.edge.name,
            source = %spec.edge.source,
            "join skipped, target collection unknown"
        );
        return Vec::new();
    };

    let mut stages = vec![PipelineStage::Lookup(lookup)];
    if spec.unwind {
        stages.push(PipelineStage::Unwind(UnwindStage::preserving(&spec.alias)));
    }
    stages
}

fn collection_of<'a>(registry: &'a Registry, entity: &str) -> Option<&'a str> {
    registry.entity(entity).map(|e| e.collection.as_str())
}

/// `(local, foreign, operator)` for a single-hop mechanism.
fn key_match(join: &JoinMechanism) -> Option<(&str, &str, LookupOperator)> {
    match join {
        JoinMechanism::DirectKeyMatch {
            local_field,
            foreign_field,
        } => Some((local_field.as_str(), foreign_field.as_str(), LookupOperator::Eq)),
        JoinMechanism::ArrayMembership {
            local_array_field,
            foreign_field,
        } => Some((local_array_field.as_str(), foreign_field.as_str(), LookupOperator::In)),
        JoinMechanism::Indirect { .. } => None,
    }
}

fn lookup_for(spec: &JoinSpec, registry: &Registry) -> Option<LookupStage> {
    let edge = &spec.edge;
    let target = collection_of(registry, &edge.target)?;

    if let Some((local, foreign, operator)) = key_match(&edge.join) {
        return Some(LookupStage {
            from: target.to_string(),
            local_field: spec.local_path(local),
            foreign_field: foreign.to_string(),
            operator,
            pipeline: Vec::new(),
            as_field: spec.alias.clone(),
        });
    }

    let JoinMechanism::Indirect {
        via_entity,
        path,
        foreign_field,
    } = &edge.join
    else {
        return None;
    };
    let via: &RelationshipEdge = spec.via.as_ref()?;
    let (local, via_foreign, operator) = key_match(&via.join)?;
    let via_collection = collection_of(registry, via_entity)?;

    // Inside the intermediate collection: reach the target, then swap roots so
    // the outer alias holds target documents.
    let inner = vec![
        PipelineStage::Lookup(LookupStage {
            from: target.to_string(),
            local_field: path.clone(),
            foreign_field: foreign_field.clone(),
            operator: LookupOperator::Eq,
            pipeline: Vec::new(),
            as_field: INDIRECT_FIELD.to_string(),
        }),
        PipelineStage::Unwind(UnwindStage::strict(INDIRECT_FIELD)),
        PipelineStage::ReplaceRoot(json!(format!("${}", INDIRECT_FIELD))),
    ];

    Some(LookupStage {
        from: via_collection.to_string(),
        local_field: spec.local_path(local),
        foreign_field: via_foreign.to_string(),
        operator,
        pipeline: inner,
        as_field: spec.alias.clone(),
    })
}

/// Prefer the embedded reference and fall back to the looked-up document.
///
/// Only joins whose alias was renamed away from an embedded field need this.
pub fn reference_fallbacks(joins: &[JoinSpec]) -> Option<Map<String, Value>> {
    let mut fields = Map::new();
    for spec in joins.iter().filter(|j| j.local_prefix.is_none()) {
        let Some(original) = spec.alias.strip_suffix("Doc") else {
            continue;
        };
        if original != spec.edge.alias {
            continue;
        }
        let looked_up = if spec.unwind {
            json!(format!("${}", spec.alias))
        } else {
            json!({ "$arrayElemAt": [format!("${}", spec.alias), 0] })
        };
        fields.insert(
            original.to_string(),
            json!({ "$ifNull": [format!("${}", original), looked_up] }),
        );
    }
    (!fields.is_empty()).then_some(fields)
}
