//! # intentql
//!
//! Compiles structured query intents into document-store aggregation pipelines.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              QueryIntent (typed or flat wire form)       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [normalize]
//! ┌─────────────────────────────────────────────────────────┐
//! │        Field predicates (primary + joined targets)       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [resolve]
//! ┌─────────────────────────────────────────────────────────┐
//! │        Join plan over the registry's relation graph      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [pipeline]
//! ┌─────────────────────────────────────────────────────────┐
//! │     Ordered stages: match, lookup, group, analytics ...  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs against an immutable [`registry::Registry`] loaded once.
//! Compilation is synchronous and never fails on bad input; dropped pieces
//! come back as [`error::Diagnostic`]s.

pub mod compile;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod registry;
pub mod resolve;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::compile::{CompileOutput, Compiler};
    pub use crate::config::{CompilerSettings, Settings};
    pub use crate::error::{Diagnostic, DiagnosticKind};
    pub use crate::executor::{QueryService, StoreExecutor};
    pub use crate::model::{
        AggregationKind, AnalyticsRequest, PipelineStage, QueryIntent, RawIntent, SortDirection,
        TimeUnit, WindowOperation,
    };
    pub use crate::registry::Registry;
}

pub use compile::{CompileOutput, Compiler};
pub use model::{PipelineStage, QueryIntent};
pub use registry::Registry;
