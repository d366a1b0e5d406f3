//! Wire types shared by the compiler phases.
//!
//! - [`QueryIntent`] / [`RawIntent`]: what the caller asks for
//! - [`FilterPredicate`]: the closed set a filter can normalize to
//! - [`PipelineStage`]: what the store executor receives

pub mod intent;
pub mod predicate;
pub mod stage;

pub use intent::{
    AggregationKind, AnalyticsRequest, QueryIntent, RawIntent, SortKey, TimeUnit,
    WindowOperation,
};
pub use predicate::{
    date_value, is_plain_identifier, BoundValue, Comparison, FieldPredicate, FilterPredicate,
    MatchDocument, RangeBound,
};
pub use stage::{
    pipeline_to_json, BucketAutoStage, GraphLookupStage, GroupStage, LookupOperator,
    LookupStage, PipelineStage, SetWindowFieldsStage, SortDirection, UnionWithStage,
    UnwindStage,
};
