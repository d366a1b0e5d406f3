//! Pipeline stages - the wire vocabulary handed to the store executor.
//!
//! Each stage renders to exactly one operator document (`{"$match": ...}`,
//! `{"$lookup": ...}`, ...). Lookups always use the `let` + sub-pipeline form
//! so that multi-hop joins can read from a previous hop's alias.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    #[serde(rename = "asc", alias = "ascending")]
    Ascending,
    #[serde(rename = "desc", alias = "descending")]
    Descending,
}

impl SortDirection {
    /// Parse `1`, `-1`, `"asc"`, `"desc"`, `"ascending"`, `"descending"`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(v) if v > 0 => Some(SortDirection::Ascending),
                Some(v) if v < 0 => Some(SortDirection::Descending),
                _ => None,
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "asc" | "ascending" | "1" => Some(SortDirection::Ascending),
                "desc" | "descending" | "-1" => Some(SortDirection::Descending),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

/// Matching operator used inside a lookup sub-pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupOperator {
    /// `foreign == local`
    Eq,
    /// `foreign IN local[]`
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupStage {
    pub from: String,
    /// Full path on the current document, including any hop prefix.
    pub local_field: String,
    pub foreign_field: String,
    pub operator: LookupOperator,
    /// Extra stages run after the join match inside the sub-pipeline.
    pub pipeline: Vec<PipelineStage>,
    pub as_field: String,
}

impl LookupStage {
    fn to_document(&self) -> Value {
        let (var, bound, test) = match self.operator {
            LookupOperator::Eq => (
                "localValue",
                json!(format!("${}", self.local_field)),
                json!({ "$eq": [format!("${}", self.foreign_field), "$$localValue"] }),
            ),
            LookupOperator::In => (
                "localValues",
                json!({ "$ifNull": [format!("${}", self.local_field), []] }),
                json!({ "$in": [format!("${}", self.foreign_field), "$$localValues"] }),
            ),
        };

        let mut let_vars = Map::new();
        let_vars.insert(var.to_string(), bound);

        let mut pipeline = vec![json!({ "$match": { "$expr": test } })];
        pipeline.extend(self.pipeline.iter().map(PipelineStage::to_document));

        json!({
            "$lookup": {
                "from": self.from,
                "let": let_vars,
                "pipeline": pipeline,
                "as": self.as_field,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnwindStage {
    pub path: String,
    pub preserve_null_and_empty: bool,
}

impl UnwindStage {
    pub fn preserving(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            preserve_null_and_empty: true,
        }
    }

    pub fn strict(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            preserve_null_and_empty: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupStage {
    /// Group key expression: a field reference, an object, or null.
    pub id: Value,
    pub accumulators: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketAutoStage {
    pub group_by: Value,
    pub buckets: u32,
    pub output: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionWithStage {
    pub collection: String,
    pub pipeline: Vec<PipelineStage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphLookupStage {
    pub from: String,
    pub start_with: String,
    pub connect_from_field: String,
    pub connect_to_field: String,
    pub as_field: String,
    pub max_depth: Option<u32>,
    pub depth_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetWindowFieldsStage {
    pub partition_by: Option<Value>,
    pub sort_by: Vec<(String, SortDirection)>,
    pub output: Map<String, Value>,
}

/// One operation in a compiled pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStage {
    Match(Map<String, Value>),
    Lookup(LookupStage),
    Unwind(UnwindStage),
    AddFields(Map<String, Value>),
    Group(GroupStage),
    Sort(Vec<(String, SortDirection)>),
    Project(Map<String, Value>),
    Skip(u64),
    Limit(u64),
    Unset(Vec<String>),
    /// Replace the stream with a single `{field: n}` document.
    Count(String),
    Facet(Vec<(String, Vec<PipelineStage>)>),
    BucketAuto(BucketAutoStage),
    UnionWith(UnionWithStage),
    GraphLookup(GraphLookupStage),
    SetWindowFields(SetWindowFieldsStage),
    /// Only emitted inside lookup sub-pipelines.
    ReplaceRoot(Value),
}

impl PipelineStage {
    /// Operator name of this stage, e.g. `$match`.
    pub fn operator(&self) -> &'static str {
        match self {
            PipelineStage::Match(_) => "$match",
            PipelineStage::Lookup(_) => "$lookup",
            PipelineStage::Unwind(_) => "$unwind",
            PipelineStage::AddFields(_) => "$addFields",
            PipelineStage::Group(_) => "$group",
            PipelineStage::Sort(_) => "$sort",
            PipelineStage::Project(_) => "$project",
            PipelineStage::Skip(_) => "$skip",
            PipelineStage::Limit(_) => "$limit",
            PipelineStage::Unset(_) => "$unset",
            PipelineStage::Count(_) => "$count",
            PipelineStage::Facet(_) => "$facet",
            PipelineStage::BucketAuto(_) => "$bucketAuto",
            PipelineStage::UnionWith(_) => "$unionWith",
            PipelineStage::GraphLookup(_) => "$graphLookup",
            PipelineStage::SetWindowFields(_) => "$setWindowFields",
            PipelineStage::ReplaceRoot(_) => "$replaceRoot",
        }
    }

    pub fn to_document(&self) -> Value {
        match self {
            PipelineStage::Match(m) => json!({ "$match": m }),
            PipelineStage::Lookup(lookup) => lookup.to_document(),
            PipelineStage::Unwind(unwind) => json!({
                "$unwind": {
                    "path": format!("${}", unwind.path),
                    "preserveNullAndEmptyArrays": unwind.preserve_null_and_empty,
                }
            }),
            PipelineStage::AddFields(fields) => json!({ "$addFields": fields }),
            PipelineStage::Group(group) => {
                let mut body = Map::new();
                body.insert("_id".into(), group.id.clone());
                for (k, v) in &group.accumulators {
                    body.insert(k.clone(), v.clone());
                }
                json!({ "$group": body })
            }
            PipelineStage::Sort(keys) => json!({ "$sort": sort_document(keys) }),
            PipelineStage::Project(fields) => json!({ "$project": fields }),
            PipelineStage::Skip(n) => json!({ "$skip": n }),
            PipelineStage::Limit(n) => json!({ "$limit": n }),
            PipelineStage::Unset(fields) => json!({ "$unset": fields }),
            PipelineStage::Count(field) => json!({ "$count": field }),
            PipelineStage::Facet(facets) => {
                let body: Map<String, Value> = facets
                    .iter()
                    .map(|(name, stages)| (name.clone(), pipeline_to_json(stages)))
                    .collect();
                json!({ "$facet": body })
            }
            PipelineStage::BucketAuto(bucket) => json!({
                "$bucketAuto": {
                    "groupBy": bucket.group_by,
                    "buckets": bucket.buckets,
                    "output": bucket.output,
                }
            }),
            PipelineStage::UnionWith(union) => {
                if union.pipeline.is_empty() {
                    json!({ "$unionWith": { "coll": union.collection } })
                } else {
                    json!({
                        "$unionWith": {
                            "coll": union.collection,
                            "pipeline": pipeline_to_json(&union.pipeline),
                        }
                    })
                }
            }
            PipelineStage::GraphLookup(graph) => {
                let mut body = Map::new();
                body.insert("from".into(), json!(graph.from));
                body.insert("startWith".into(), json!(format!("${}", graph.start_with)));
                body.insert("connectFromField".into(), json!(graph.connect_from_field));
                body.insert("connectToField".into(), json!(graph.connect_to_field));
                body.insert("as".into(), json!(graph.as_field));
                if let Some(depth) = graph.max_depth {
                    body.insert("maxDepth".into(), json!(depth));
                }
                if let Some(field) = &graph.depth_field {
                    body.insert("depthField".into(), json!(field));
                }
                json!({ "$graphLookup": body })
            }
            PipelineStage::SetWindowFields(window) => {
                let mut body = Map::new();
                if let Some(partition) = &window.partition_by {
                    body.insert("partitionBy".into(), partition.clone());
                }
                body.insert("sortBy".into(), sort_document(&window.sort_by));
                body.insert("output".into(), Value::Object(window.output.clone()));
                json!({ "$setWindowFields": body })
            }
            PipelineStage::ReplaceRoot(root) => json!({ "$replaceRoot": { "newRoot": root } }),
        }
    }
}

impl Serialize for PipelineStage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

fn sort_document(keys: &[(String, SortDirection)]) -> Value {
    let mut m = Map::new();
    for (field, dir) in keys {
        m.insert(field.clone(), json!(dir.as_i32()));
    }
    Value::Object(m)
}

/// Render a stage list as a JSON array of operator documents.
pub fn pipeline_to_json(stages: &[PipelineStage]) -> Value {
    Value::Array(stages.iter().map(PipelineStage::to_document).collect())
}
