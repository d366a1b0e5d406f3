//! Advanced analytics stages.
//!
//! At most one reshaping analytic runs per query, chosen by precedence:
//! bucketAuto, facet, forecast, anomaly, trend, time window. Graph traversal
//! and union are additive and never conflict.

use serde_json::{json, Map, Value};

use crate::config::CompilerSettings;
use crate::error::{DiagnosticKind, Diagnostics};
use crate::model::{
    AggregationKind, AnalyticsRequest, BucketAutoStage, GraphLookupStage, GroupStage,
    PipelineStage, SetWindowFieldsStage, SortDirection, TimeUnit, UnionWithStage, UnwindStage,
    WindowOperation,
};
use crate::registry::{Entity, Registry};

/// Reshaping analytics, highest precedence first.
pub const PRECEDENCE: [AggregationKind; 6] = [
    AggregationKind::BucketAuto,
    AggregationKind::Facet,
    AggregationKind::Forecast,
    AggregationKind::Anomaly,
    AggregationKind::Trend,
    AggregationKind::TimeWindow,
];

/// Field holding graph traversal results.
pub const HIERARCHY_FIELD: &str = "hierarchy";

pub struct Analytics<'a> {
    pub entity: &'a Entity,
    pub registry: &'a Registry,
    pub settings: &'a CompilerSettings,
}

/// A field resolved on the primary entity.
struct FieldRef {
    path: String,
    is_date: bool,
    unwind: Option<String>,
}

fn asc(field: &str) -> (String, SortDirection) {
    (field.to_string(), SortDirection::Ascending)
}

fn desc(field: &str) -> (String, SortDirection) {
    (field.to_string(), SortDirection::Descending)
}

fn truncate(path: &str, unit: TimeUnit) -> Value {
    json!({ "$dateTrunc": { "date": format!("${}", path), "unit": unit.as_str() } })
}

fn daily_counts(path: &str) -> PipelineStage {
    let mut acc = Map::new();
    acc.insert("count".into(), json!({ "$sum": 1 }));
    PipelineStage::Group(GroupStage {
        id: truncate(path, TimeUnit::Day),
        accumulators: acc,
    })
}

fn object(pairs: Vec<(&str, Value)>) -> Map<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

impl<'a> Analytics<'a> {
    pub fn new(entity: &'a Entity, registry: &'a Registry, settings: &'a CompilerSettings) -> Self {
        Self {
            entity,
            registry,
            settings,
        }
    }

    fn field(&self, token: &str) -> Option<FieldRef> {
        if let Some(key) = self.entity.group_by.get(token) {
            let is_date = self
                .entity
                .fields
                .by_path(&key.path)
                .is_some_and(|m| m.kind.is_date());
            return Some(FieldRef {
                path: key.path.clone(),
                is_date,
                unwind: key.unwind.clone(),
            });
        }
        if let Some(mapping) = self.entity.mapping(token) {
            return Some(FieldRef {
                path: mapping.path.clone(),
                is_date: mapping.kind.is_date(),
                unwind: None,
            });
        }
        self.entity.is_allowed(token).then(|| FieldRef {
            path: token.to_string(),
            is_date: false,
            unwind: None,
        })
    }

    fn unresolved(&self, diagnostics: &mut Diagnostics, kind: AggregationKind, token: &str) {
        diagnostics.push(
            DiagnosticKind::UnresolvedField,
            token,
            format!("{:?} field does not resolve on '{}'", kind, self.entity.name),
        );
    }

    /// Pick the highest-precedence reshaping analytic that can be built.
    ///
    /// Requests that lose to it are reported as conflicts.
    pub fn reshaping(
        &self,
        requests: &[AnalyticsRequest],
        diagnostics: &mut Diagnostics,
    ) -> Option<(AggregationKind, Vec<PipelineStage>)> {
        let mut chosen: Option<(AggregationKind, Vec<PipelineStage>)> = None;

        for kind in PRECEDENCE {
            for request in requests.iter().filter(|r| r.kind() == kind) {
                if let Some((winner, _)) = &chosen {
                    diagnostics.push(
                        DiagnosticKind::AggregationConflict,
                        format!("{:?}", kind),
                        format!("superseded by {:?}", winner),
                    );
                    continue;
                }
                if let Some(stages) = self.build(request, diagnostics) {
                    chosen = Some((kind, stages));
                }
            }
        }
        chosen
    }

    fn build(&self, request: &AnalyticsRequest, diagnostics: &mut Diagnostics) -> Option<Vec<PipelineStage>> {
        match request {
            AnalyticsRequest::BucketAuto { field, buckets } => {
                self.bucket_auto(field, *buckets, diagnostics)
            }
            AnalyticsRequest::Facet { fields } => self.facet(fields, diagnostics),
            AnalyticsRequest::Forecast { field, periods } => {
                self.forecast(field, *periods, diagnostics)
            }
            AnalyticsRequest::Anomaly { field, threshold } => {
                self.anomaly(field, *threshold, diagnostics)
            }
            AnalyticsRequest::Trend { field, period } => self.trend(field, *period, diagnostics),
            AnalyticsRequest::TimeWindow {
                field,
                size,
                operation,
            } => self.time_window(field, *size, *operation, diagnostics),
            AnalyticsRequest::UnionWith { .. } | AnalyticsRequest::GraphTraversal { .. } => None,
        }
    }

    // ========================================================================
    // Reshaping analytics
    // ========================================================================

    fn bucket_auto(
        &self,
        field: &str,
        buckets: Option<u32>,
        diagnostics: &mut Diagnostics,
    ) -> Option<Vec<PipelineStage>> {
        let Some(f) = self.field(field) else {
            self.unresolved(diagnostics, AggregationKind::BucketAuto, field);
            return None;
        };
        let buckets = buckets
            .filter(|b| *b > 0)
            .unwrap_or(self.settings.bucket_count);

        let mut stages = Vec::new();
        if let Some(array) = f.unwind {
            stages.push(PipelineStage::Unwind(UnwindStage::preserving(array)));
        }
        stages.push(PipelineStage::BucketAuto(BucketAutoStage {
            group_by: json!(format!("${}", f.path)),
            buckets,
            output: object(vec![("count", json!({ "$sum": 1 }))]),
        }));
        Some(stages)
    }

    fn facet(&self, fields: &[String], diagnostics: &mut Diagnostics) -> Option<Vec<PipelineStage>> {
        let mut facets = Vec::new();
        for token in fields {
            let Some(f) = self.field(token) else {
                self.unresolved(diagnostics, AggregationKind::Facet, token);
                continue;
            };
            let mut sub = Vec::new();
            if let Some(array) = f.unwind {
                sub.push(PipelineStage::Unwind(UnwindStage::preserving(array)));
            }
            sub.push(PipelineStage::Group(GroupStage {
                id: json!(format!("${}", f.path)),
                accumulators: object(vec![("count", json!({ "$sum": 1 }))]),
            }));
            sub.push(PipelineStage::Sort(vec![desc("count")]));
            facets.push((token.replace('.', "_"), sub));
        }
        (!facets.is_empty()).then(|| vec![PipelineStage::Facet(facets)])
    }

    fn date_field(
        &self,
        token: &str,
        kind: AggregationKind,
        diagnostics: &mut Diagnostics,
    ) -> Option<String> {
        match self.field(token) {
            Some(f) if f.is_date => Some(f.path),
            Some(_) => {
                diagnostics.push(
                    DiagnosticKind::UnresolvedField,
                    token,
                    format!("{:?} needs a date field", kind),
                );
                None
            }
            None => {
                self.unresolved(diagnostics, kind, token);
                None
            }
        }
    }

    fn trend(
        &self,
        field: &str,
        period: TimeUnit,
        diagnostics: &mut Diagnostics,
    ) -> Option<Vec<PipelineStage>> {
        let path = self.date_field(field, AggregationKind::Trend, diagnostics)?;
        Some(vec![
            PipelineStage::Group(GroupStage {
                id: truncate(&path, period),
                accumulators: object(vec![("count", json!({ "$sum": 1 }))]),
            }),
            PipelineStage::SetWindowFields(SetWindowFieldsStage {
                partition_by: None,
                sort_by: vec![asc("_id")],
                output: object(vec![(
                    "previous",
                    json!({ "$shift": { "output": "$count", "by": -1, "default": null } }),
                )]),
            }),
            PipelineStage::Project(object(vec![
                ("_id", json!(0)),
                ("period", json!("$_id")),
                ("count", json!(1)),
                (
                    "change",
                    json!({
                        "$cond": [
                            { "$eq": ["$previous", null] },
                            null,
                            { "$subtract": ["$count", "$previous"] }
                        ]
                    }),
                ),
            ])),
            PipelineStage::Sort(vec![asc("period")]),
        ])
    }

    fn time_window(
        &self,
        field: &str,
        size: Option<u32>,
        operation: WindowOperation,
        diagnostics: &mut Diagnostics,
    ) -> Option<Vec<PipelineStage>> {
        let Some(f) = self.field(field) else {
            self.unresolved(diagnostics, AggregationKind::TimeWindow, field);
            return None;
        };
        let size = size.filter(|s| *s > 0).unwrap_or(self.settings.window_size);
        let reach = -(i64::from(size) - 1);

        if f.is_date {
            return Some(vec![
                daily_counts(&f.path),
                PipelineStage::SetWindowFields(SetWindowFieldsStage {
                    partition_by: None,
                    sort_by: vec![asc("_id")],
                    output: object(vec![(
                        "rolling",
                        json!({
                            (operation.operator()): "$count",
                            "window": { "range": [reach, 0], "unit": "day" }
                        }),
                    )]),
                }),
                PipelineStage::Project(object(vec![
                    ("_id", json!(0)),
                    ("date", json!("$_id")),
                    ("count", json!(1)),
                    ("rolling", json!(1)),
                ])),
                PipelineStage::Sort(vec![asc("date")]),
            ]);
        }

        Some(vec![PipelineStage::SetWindowFields(SetWindowFieldsStage {
            partition_by: None,
            sort_by: vec![asc("_id")],
            output: object(vec![(
                "rolling",
                json!({
                    (operation.operator()): format!("${}", f.path),
                    "window": { "documents": [reach, 0] }
                }),
            )]),
        })])
    }

    fn anomaly(
        &self,
        field: &str,
        threshold: Option<f64>,
        diagnostics: &mut Diagnostics,
    ) -> Option<Vec<PipelineStage>> {
        let Some(f) = self.field(field) else {
            self.unresolved(diagnostics, AggregationKind::Anomaly, field);
            return None;
        };
        let threshold = threshold
            .filter(|t| t.is_finite() && *t > 0.0)
            .unwrap_or(self.settings.anomaly_threshold);

        // Bucket dates per day; numeric fields are scored directly.
        let (mut stages, key, value) = if f.is_date {
            (vec![daily_counts(&f.path)], "date", "$count".to_string())
        } else {
            (Vec::new(), "ref", format!("${}", f.path))
        };

        stages.push(PipelineStage::Group(GroupStage {
            id: Value::Null,
            accumulators: object(vec![
                ("values", json!({ "$push": { "key": "$_id", "value": &value } })),
                ("mean", json!({ "$avg": &value })),
                ("stdDev", json!({ "$stdDevPop": &value })),
            ]),
        }));
        stages.push(PipelineStage::Unwind(UnwindStage::strict("values")));
        stages.push(PipelineStage::Project(object(vec![
            ("_id", json!(0)),
            (key, json!("$values.key")),
            ("value", json!("$values.value")),
            ("mean", json!(1)),
            ("stdDev", json!(1)),
            (
                "zScore",
                json!({
                    "$cond": [
                        { "$eq": ["$stdDev", 0] },
                        0,
                        { "$divide": [{ "$subtract": ["$values.value", "$mean"] }, "$stdDev"] }
                    ]
                }),
            ),
        ])));
        stages.push(PipelineStage::Match(object(vec![(
            "$expr",
            json!({ "$gt": [{ "$abs": "$zScore" }, threshold] }),
        )])));
        stages.push(PipelineStage::Sort(vec![asc(key)]));
        Some(stages)
    }

    fn forecast(
        &self,
        field: &str,
        periods: Option<u32>,
        diagnostics: &mut Diagnostics,
    ) -> Option<Vec<PipelineStage>> {
        let path = self.date_field(field, AggregationKind::Forecast, diagnostics)?;
        let periods = periods
            .filter(|p| *p > 0)
            .unwrap_or(self.settings.forecast_periods)
            .min(self.settings.max_forecast_periods);

        // Least squares over (day index, count).
        let numerator = json!({
            "$subtract": [
                { "$multiply": ["$n", "$sumXY"] },
                { "$multiply": ["$sumX", "$sumY"] }
            ]
        });
        let denominator = json!({
            "$subtract": [
                { "$multiply": ["$n", "$sumXX"] },
                { "$multiply": ["$sumX", "$sumX"] }
            ]
        });

        Some(vec![
            daily_counts(&path),
            PipelineStage::SetWindowFields(SetWindowFieldsStage {
                partition_by: None,
                sort_by: vec![asc("_id")],
                output: object(vec![("x", json!({ "$documentNumber": {} }))]),
            }),
            PipelineStage::Group(GroupStage {
                id: Value::Null,
                accumulators: object(vec![
                    ("n", json!({ "$sum": 1 })),
                    ("sumX", json!({ "$sum": "$x" })),
                    ("sumY", json!({ "$sum": "$count" })),
                    ("sumXY", json!({ "$sum": { "$multiply": ["$x", "$count"] } })),
                    ("sumXX", json!({ "$sum": { "$multiply": ["$x", "$x"] } })),
                    ("lastDate", json!({ "$max": "$_id" })),
                ]),
            }),
            PipelineStage::AddFields(object(vec![(
                "slope",
                json!({
                    "$cond": [
                        { "$eq": [denominator, 0] },
                        0,
                        { "$divide": [numerator, denominator] }
                    ]
                }),
            )])),
            PipelineStage::AddFields(object(vec![(
                "intercept",
                json!({
                    "$divide": [
                        { "$subtract": ["$sumY", { "$multiply": ["$slope", "$sumX"] }] },
                        "$n"
                    ]
                }),
            )])),
            PipelineStage::Project(object(vec![
                ("_id", json!(0)),
                ("slope", json!(1)),
                ("intercept", json!(1)),
                (
                    "forecast",
                    json!({
                        "$map": {
                            "input": { "$range": [1, u64::from(periods) + 1] },
                            "as": "step",
                            "in": {
                                "date": {
                                    "$dateAdd": {
                                        "startDate": "$lastDate",
                                        "unit": "day",
                                        "amount": "$$step"
                                    }
                                },
                                "predicted": {
                                    "$max": [
                                        0,
                                        {
                                            "$add": [
                                                "$intercept",
                                                { "$multiply": ["$slope", { "$add": ["$n", "$$step"] }] }
                                            ]
                                        }
                                    ]
                                }
                            }
                        }
                    }),
                ),
            ])),
        ])
    }

    // ========================================================================
    // Additive analytics
    // ========================================================================

    /// Recursive traversal; depth is clamped to the configured maximum.
    pub fn graph_lookup(&self, request: &AnalyticsRequest, diagnostics: &mut Diagnostics) -> Option<PipelineStage> {
        let AnalyticsRequest::GraphTraversal {
            start_with,
            connect_from,
            connect_to,
            entity,
            max_depth,
        } = request
        else {
            return None;
        };

        let traversed = match entity {
            Some(name) => match self.registry.entity(name) {
                Some(e) => e,
                None => {
                    diagnostics.push(
                        DiagnosticKind::UnknownEntity,
                        name.as_str(),
                        "graph traversal entity is not registered",
                    );
                    return None;
                }
            },
            None => self.entity,
        };

        let start = self.entity.mapping(start_with).map(|m| m.path.clone()).or_else(|| {
            self.entity
                .is_allowed(start_with)
                .then(|| start_with.clone())
        });
        let Some(start) = start else {
            self.unresolved(diagnostics, AggregationKind::GraphLookup, start_with);
            return None;
        };
        for field in [connect_from, connect_to] {
            if !traversed.is_allowed(field) {
                self.unresolved(diagnostics, AggregationKind::GraphLookup, field);
                return None;
            }
        }

        let cap = self.settings.graph_max_depth;
        Some(PipelineStage::GraphLookup(GraphLookupStage {
            from: traversed.collection.clone(),
            start_with: start,
            connect_from_field: connect_from.clone(),
            connect_to_field: connect_to.clone(),
            as_field: HIERARCHY_FIELD.to_string(),
            max_depth: Some(max_depth.map_or(cap, |d| d.min(cap))),
            depth_field: Some("depth".to_string()),
        }))
    }

    /// Combine with another registered collection.
    pub fn union_with(&self, collection: &str, diagnostics: &mut Diagnostics) -> Option<PipelineStage> {
        let entity = self
            .registry
            .entity_by_collection(collection)
            .or_else(|| self.registry.entity(collection));
        match entity {
            Some(e) => Some(PipelineStage::UnionWith(UnionWithStage {
                collection: e.collection.clone(),
                pipeline: Vec::new(),
            })),
            None => {
                diagnostics.push(
                    DiagnosticKind::UnresolvedField,
                    collection,
                    "union collection is not registered",
                );
                None
            }
        }
    }
}
