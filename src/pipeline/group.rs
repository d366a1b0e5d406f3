//! Grouping, measures, and the grouped result shape.

use serde_json::{json, Map, Value};

use crate::config::CompilerSettings;
use crate::model::{GroupStage, PipelineStage, QueryIntent, SortDirection, UnwindStage};
use crate::registry::{Entity, MeasureSpec};
use crate::resolve::GroupKeySpec;

use super::page_limit;

/// Default measure when the entity declares none.
pub const COUNT_MEASURE: &str = "count";

/// Name and accumulator of the entity's primary measure.
pub fn measure(entity: &Entity) -> (String, Value) {
    match &entity.measure {
        Some(MeasureSpec::Duration {
            name,
            hours_field,
            minutes_field,
        }) => (
            name.clone(),
            json!({
                "$sum": {
                    "$add": [
                        { "$ifNull": [format!("${}", hours_field), 0] },
                        { "$divide": [{ "$ifNull": [format!("${}", minutes_field), 0] }, 60] }
                    ]
                }
            }),
        ),
        Some(MeasureSpec::Sum { name, field }) => {
            (name.clone(), json!({ "$sum": format!("${}", field) }))
        }
        None => (COUNT_MEASURE.to_string(), json!({ "$sum": 1 })),
    }
}

/// Key under `_id` for a token in a composite group.
fn id_key(token: &str) -> String {
    token.replace('.', "_")
}

fn group_id(keys: &[GroupKeySpec]) -> Value {
    match keys {
        [single] => json!(format!("${}", single.path)),
        _ => {
            let fields: Map<String, Value> = keys
                .iter()
                .map(|k| (id_key(&k.token), json!(format!("${}", k.path))))
                .collect();
            Value::Object(fields)
        }
    }
}

/// Sample pushed per group when details are requested.
fn detail_item(entity: &Entity) -> Value {
    let mut item = Map::new();
    item.insert("_id".into(), json!("$_id"));
    let fields = if entity.default_projection.is_empty() {
        std::slice::from_ref(&entity.display_field)
    } else {
        entity.default_projection.as_slice()
    };
    for field in fields {
        item.insert(id_key(field), json!(format!("${}", field)));
    }
    Value::Object(item)
}

/// Sort for the grouped result: an explicit sort on a grouped key or the
/// measure wins, otherwise the measure descending.
fn group_sort(keys: &[GroupKeySpec], measure: &str, intent: &QueryIntent) -> Vec<(String, SortDirection)> {
    for sort in &intent.sort {
        if sort.field == measure || sort.field == COUNT_MEASURE {
            return vec![(measure.to_string(), sort.direction)];
        }
        let hit = keys
            .iter()
            .find(|k| k.token == sort.field || k.path == sort.field);
        if let Some(key) = hit {
            let field = if keys.len() == 1 {
                "_id".to_string()
            } else {
                format!("_id.{}", id_key(&key.token))
            };
            return vec![(field, sort.direction)];
        }
    }
    vec![(measure.to_string(), SortDirection::Descending)]
}

/// Unwind, group, sort, project, and paginate.
pub fn group_stages(
    entity: &Entity,
    keys: &[GroupKeySpec],
    intent: &QueryIntent,
    settings: &CompilerSettings,
) -> Vec<PipelineStage> {
    if keys.is_empty() {
        return Vec::new();
    }

    let mut stages = Vec::new();
    let mut unwound: Vec<&str> = Vec::new();
    for key in keys {
        if let Some(array) = &key.unwind {
            if !unwound.contains(&array.as_str()) {
                stages.push(PipelineStage::Unwind(UnwindStage::preserving(array)));
                unwound.push(array);
            }
        }
    }

    let (measure_name, accumulator) = measure(entity);
    let mut accumulators = Map::new();
    accumulators.insert(measure_name.clone(), accumulator);
    if intent.wants_details {
        accumulators.insert("items".into(), json!({ "$push": detail_item(entity) }));
    }
    stages.push(PipelineStage::Group(GroupStage {
        id: group_id(keys),
        accumulators,
    }));

    stages.push(PipelineStage::Sort(group_sort(keys, &measure_name, intent)));

    let mut shape = Map::new();
    shape.insert("_id".into(), json!(0));
    shape.insert(measure_name, json!(1));
    shape.insert("group".into(), json!("$_id"));
    if intent.wants_details {
        shape.insert(
            "items".into(),
            json!({ "$slice": ["$items", settings.detail_sample_size] }),
        );
    }
    stages.push(PipelineStage::Project(shape));

    if let Some(skip) = intent.skip.filter(|n| *n > 0) {
        stages.push(PipelineStage::Skip(skip));
    }
    if let Some(limit) = page_limit(intent) {
        stages.push(PipelineStage::Limit(limit));
    }
    stages
}
