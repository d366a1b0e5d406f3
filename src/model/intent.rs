//! Query intents - the structured request the compiler consumes.
//!
//! [`QueryIntent`] is the typed form. [`RawIntent`] is the flat JSON shape an
//! intent extractor emits, with one loose optional field per analytics
//! parameter; it folds those fields into [`AnalyticsRequest`] variants.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::stage::SortDirection;
use crate::error::{DiagnosticKind, Diagnostics};

/// A requested aggregation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregationKind {
    Count,
    Group,
    Facet,
    BucketAuto,
    UnionWith,
    GraphLookup,
    TimeWindow,
    Trend,
    Anomaly,
    Forecast,
}

impl AggregationKind {
    /// Lenient parse: case, `_` and `-` are ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        let kind = match key.as_str() {
            "count" => AggregationKind::Count,
            "group" | "groupby" => AggregationKind::Group,
            "facet" => AggregationKind::Facet,
            "bucketauto" | "bucket" => AggregationKind::BucketAuto,
            "unionwith" | "union" => AggregationKind::UnionWith,
            "graphlookup" | "graph" => AggregationKind::GraphLookup,
            "timewindow" | "window" | "rolling" => AggregationKind::TimeWindow,
            "trend" => AggregationKind::Trend,
            "anomaly" | "anomalies" => AggregationKind::Anomaly,
            "forecast" => AggregationKind::Forecast,
            _ => return None,
        };
        Some(kind)
    }
}

/// Date truncation unit for trend analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeUnit {
    pub fn parse(raw: &str) -> Option<Self> {
        let unit = match raw.trim().to_ascii_lowercase().trim_end_matches('s') {
            "hour" | "hourly" => TimeUnit::Hour,
            "day" | "daily" => TimeUnit::Day,
            "week" | "weekly" => TimeUnit::Week,
            "month" | "monthly" => TimeUnit::Month,
            "quarter" | "quarterly" => TimeUnit::Quarter,
            "year" | "yearly" | "annual" => TimeUnit::Year,
            _ => return None,
        };
        Some(unit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Quarter => "quarter",
            TimeUnit::Year => "year",
        }
    }
}

/// Rolling-window accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowOperation {
    #[default]
    Sum,
    Avg,
}

impl WindowOperation {
    pub fn operator(&self) -> &'static str {
        match self {
            WindowOperation::Sum => "$sum",
            WindowOperation::Avg => "$avg",
        }
    }
}

/// One advanced-analytics request. Each variant carries only its own parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AnalyticsRequest {
    Facet {
        fields: Vec<String>,
    },
    BucketAuto {
        field: String,
        #[serde(default)]
        buckets: Option<u32>,
    },
    UnionWith {
        collection: String,
    },
    GraphTraversal {
        start_with: String,
        connect_from: String,
        connect_to: String,
        /// Entity to traverse; defaults to the primary entity.
        #[serde(default)]
        entity: Option<String>,
        #[serde(default)]
        max_depth: Option<u32>,
    },
    TimeWindow {
        field: String,
        #[serde(default)]
        size: Option<u32>,
        #[serde(default)]
        operation: WindowOperation,
    },
    Trend {
        field: String,
        #[serde(default)]
        period: TimeUnit,
    },
    Anomaly {
        field: String,
        #[serde(default)]
        threshold: Option<f64>,
    },
    Forecast {
        field: String,
        #[serde(default)]
        periods: Option<u32>,
    },
}

impl AnalyticsRequest {
    pub fn kind(&self) -> AggregationKind {
        match self {
            AnalyticsRequest::Facet { .. } => AggregationKind::Facet,
            AnalyticsRequest::BucketAuto { .. } => AggregationKind::BucketAuto,
            AnalyticsRequest::UnionWith { .. } => AggregationKind::UnionWith,
            AnalyticsRequest::GraphTraversal { .. } => AggregationKind::GraphLookup,
            AnalyticsRequest::TimeWindow { .. } => AggregationKind::TimeWindow,
            AnalyticsRequest::Trend { .. } => AggregationKind::Trend,
            AnalyticsRequest::Anomaly { .. } => AggregationKind::Anomaly,
            AnalyticsRequest::Forecast { .. } => AggregationKind::Forecast,
        }
    }

    /// Whether this request replaces the document stream with a new shape.
    pub fn reshapes(&self) -> bool {
        !matches!(
            self,
            AnalyticsRequest::UnionWith { .. } | AnalyticsRequest::GraphTraversal { .. }
        )
    }
}

/// A sort key as requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Structured description of what to query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryIntent {
    pub primary_entity: String,
    /// Relation paths, dot-separated for multi-hop (e.g. `project.cycles`).
    pub target_entities: Vec<String>,
    pub filters: Map<String, Value>,
    pub aggregations: Vec<AggregationKind>,
    pub group_by: Vec<String>,
    pub projections: Vec<String>,
    pub sort: Vec<SortKey>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub wants_details: bool,
    pub wants_count: bool,
    pub fetch_one: bool,
    pub analytics: Vec<AnalyticsRequest>,
}

impl QueryIntent {
    pub fn new(primary_entity: impl Into<String>) -> Self {
        Self {
            primary_entity: primary_entity.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filters.insert(key.into(), value);
        self
    }

    pub fn with_aggregation(mut self, kind: AggregationKind) -> Self {
        self.aggregations.push(kind);
        self
    }

    pub fn with_group_by(mut self, token: impl Into<String>) -> Self {
        self.group_by.push(token.into());
        self
    }

    pub fn with_target(mut self, path: impl Into<String>) -> Self {
        self.target_entities.push(path.into());
        self
    }

    pub fn with_projection(mut self, field: impl Into<String>) -> Self {
        self.projections.push(field.into());
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_details(mut self) -> Self {
        self.wants_details = true;
        self
    }

    pub fn with_fetch_one(mut self) -> Self {
        self.fetch_one = true;
        self
    }

    pub fn with_analytics(mut self, request: AnalyticsRequest) -> Self {
        self.analytics.push(request);
        self
    }

    pub fn requests(&self, kind: AggregationKind) -> bool {
        self.aggregations.contains(&kind)
    }

    /// Count requested explicitly or through the `wants_count` flag.
    pub fn wants_count(&self) -> bool {
        self.wants_count || self.requests(AggregationKind::Count)
    }
}

/// Flat wire form of an intent, as produced by the extraction collaborator.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RawIntent {
    pub primary_entity: Option<String>,
    pub target_entities: Vec<String>,
    pub filters: Map<String, Value>,
    pub aggregations: Vec<String>,
    pub group_by: Vec<String>,
    pub projections: Vec<String>,
    pub sort_order: Option<Map<String, Value>>,
    pub limit: Option<Value>,
    pub skip: Option<Value>,
    pub wants_details: bool,
    pub wants_count: bool,
    pub fetch_one: bool,

    pub facet_fields: Vec<String>,
    pub bucket_field: Option<String>,
    pub bucket_count: Option<u32>,
    pub union_collection: Option<String>,
    pub graph_entity: Option<String>,
    pub graph_start_with: Option<String>,
    pub graph_connect_from: Option<String>,
    pub graph_connect_to: Option<String>,
    pub graph_max_depth: Option<u32>,
    pub window_field: Option<String>,
    pub window_size: Option<u32>,
    pub window_operation: Option<String>,
    pub trend_field: Option<String>,
    pub trend_period: Option<String>,
    pub anomaly_field: Option<String>,
    pub anomaly_threshold: Option<f64>,
    pub forecast_field: Option<String>,
    pub forecast_periods: Option<u32>,
}

impl RawIntent {
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Fold the flat fields into a typed intent, reporting anything dropped.
    pub fn into_intent(self, diagnostics: &mut Diagnostics) -> QueryIntent {
        let mut aggregations = Vec::new();
        for name in &self.aggregations {
            match AggregationKind::parse(name) {
                Some(kind) if !aggregations.contains(&kind) => aggregations.push(kind),
                Some(_) => {}
                None => diagnostics.push(
                    DiagnosticKind::AggregationConflict,
                    name.clone(),
                    "unknown aggregation kind ignored",
                ),
            }
        }

        let mut sort = Vec::new();
        for (field, dir) in self.sort_order.iter().flatten() {
            match SortDirection::from_value(dir) {
                Some(direction) => sort.push(SortKey {
                    field: field.clone(),
                    direction,
                }),
                None => diagnostics.push(
                    DiagnosticKind::UnresolvedField,
                    field.clone(),
                    format!("invalid sort direction {}", dir),
                ),
            }
        }

        let analytics = self.analytics_requests(&aggregations, diagnostics);

        QueryIntent {
            primary_entity: self.primary_entity.unwrap_or_default(),
            target_entities: self.target_entities,
            filters: self.filters,
            aggregations,
            group_by: self.group_by,
            projections: self.projections,
            sort,
            limit: self.limit.as_ref().and_then(coerce_u64),
            skip: self.skip.as_ref().and_then(coerce_u64),
            wants_details: self.wants_details,
            wants_count: self.wants_count,
            fetch_one: self.fetch_one,
            analytics,
        }
    }

    fn analytics_requests(
        &self,
        aggregations: &[AggregationKind],
        diagnostics: &mut Diagnostics,
    ) -> Vec<AnalyticsRequest> {
        let mut out = Vec::new();
        let requested = |kind| aggregations.contains(&kind);
        let mut missing = |kind: AggregationKind, what: &str| {
            if requested(kind) {
                diagnostics.push(
                    DiagnosticKind::UnresolvedField,
                    format!("{:?}", kind),
                    format!("aggregation requested without {}", what),
                );
            }
        };

        let facet_fields: Vec<String> = self
            .facet_fields
            .iter()
            .filter(|f| !f.trim().is_empty())
            .cloned()
            .collect();
        if facet_fields.is_empty() {
            missing(AggregationKind::Facet, "facet_fields");
        } else {
            out.push(AnalyticsRequest::Facet {
                fields: facet_fields,
            });
        }

        match non_empty(&self.bucket_field) {
            Some(field) => out.push(AnalyticsRequest::BucketAuto {
                field,
                buckets: self.bucket_count,
            }),
            None => missing(AggregationKind::BucketAuto, "bucket_field"),
        }

        match non_empty(&self.union_collection) {
            Some(collection) => out.push(AnalyticsRequest::UnionWith { collection }),
            None => missing(AggregationKind::UnionWith, "union_collection"),
        }

        match (
            non_empty(&self.graph_start_with),
            non_empty(&self.graph_connect_from),
            non_empty(&self.graph_connect_to),
        ) {
            (Some(start_with), Some(connect_from), Some(connect_to)) => {
                out.push(AnalyticsRequest::GraphTraversal {
                    start_with,
                    connect_from,
                    connect_to,
                    entity: non_empty(&self.graph_entity),
                    max_depth: self.graph_max_depth,
                })
            }
            _ => missing(
                AggregationKind::GraphLookup,
                "graph_start_with/graph_connect_from/graph_connect_to",
            ),
        }

        match non_empty(&self.window_field) {
            Some(field) => out.push(AnalyticsRequest::TimeWindow {
                field,
                size: self.window_size,
                operation: match self.window_operation.as_deref() {
                    Some(op) if op.eq_ignore_ascii_case("avg") || op.eq_ignore_ascii_case("average") => {
                        WindowOperation::Avg
                    }
                    _ => WindowOperation::Sum,
                },
            }),
            None => missing(AggregationKind::TimeWindow, "window_field"),
        }

        match non_empty(&self.trend_field) {
            Some(field) => out.push(AnalyticsRequest::Trend {
                field,
                period: self
                    .trend_period
                    .as_deref()
                    .and_then(TimeUnit::parse)
                    .unwrap_or_default(),
            }),
            None => missing(AggregationKind::Trend, "trend_field"),
        }

        match non_empty(&self.anomaly_field) {
            Some(field) => out.push(AnalyticsRequest::Anomaly {
                field,
                threshold: self.anomaly_threshold,
            }),
            None => missing(AggregationKind::Anomaly, "anomaly_field"),
        }

        match non_empty(&self.forecast_field) {
            Some(field) => out.push(AnalyticsRequest::Forecast {
                field,
                periods: self.forecast_periods,
            }),
            None => missing(AggregationKind::Forecast, "forecast_field"),
        }

        out
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
