//! End-to-end compilation from a query intent to a store pipeline.
//!
//! ```text
//! QueryIntent → normalize filters → resolve joins → assemble stages
//! ```
//!
//! # Example
//!
//! ```ignore
//! use intentql::compile::Compiler;
//! use intentql::model::{AggregationKind, QueryIntent};
//! use intentql::registry::Registry;
//! use serde_json::json;
//!
//! let compiler = Compiler::new(Registry::builtin()?);
//! let intent = QueryIntent::new("workItem")
//!     .with_filter("project_name", json!("Simpo"))
//!     .with_aggregation(AggregationKind::Count);
//!
//! let output = compiler.compile(&intent);
//! println!("{}", output.pipeline_json());
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::CompilerSettings;
use crate::error::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::model::{pipeline_to_json, PipelineStage, QueryIntent, RawIntent};
use crate::pipeline::PipelineAssembler;
use crate::registry::{Entity, Registry};

// ============================================================================
// Error Types
// ============================================================================

/// Raised only when the intent itself cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Invalid intent document: {0}")]
    InvalidIntent(#[from] serde_json::Error),
}

pub type CompileResult<T> = Result<T, CompileError>;

// ============================================================================
// Result Types
// ============================================================================

/// Result of compiling one intent.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// Entity the pipeline runs against (after any fallback).
    pub entity: String,

    /// Collection to run the pipeline on.
    pub collection: String,

    pub pipeline: Vec<PipelineStage>,

    /// Everything that was dropped or substituted along the way.
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    /// The pipeline as store-ready JSON documents.
    pub fn pipeline_json(&self) -> Value {
        pipeline_to_json(&self.pipeline)
    }

    pub fn stage_documents(&self) -> Vec<Value> {
        self.pipeline.iter().map(PipelineStage::to_document).collect()
    }

    pub fn has_diagnostic(&self, kind: DiagnosticKind) -> bool {
        self.diagnostics.iter().any(|d| d.kind == kind)
    }
}

// ============================================================================
// Compiler
// ============================================================================

/// Compiles intents against a shared, immutable registry.
///
/// Cloning is cheap; clones share the registry.
#[derive(Debug, Clone)]
pub struct Compiler {
    registry: Arc<Registry>,
    settings: CompilerSettings,
}

impl Compiler {
    pub fn new(registry: Registry) -> Self {
        Self::with_shared(Arc::new(registry))
    }

    pub fn with_shared(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            settings: CompilerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CompilerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &CompilerSettings {
        &self.settings
    }

    /// Compile against the current time.
    pub fn compile(&self, intent: &QueryIntent) -> CompileOutput {
        self.compile_at(intent, Utc::now())
    }

    /// Compile with relative dates anchored at `now`.
    pub fn compile_at(&self, intent: &QueryIntent, now: DateTime<Utc>) -> CompileOutput {
        self.run(intent, now, Diagnostics::new())
    }

    /// Compile the flat wire form, keeping diagnostics from its conversion.
    pub fn compile_raw_at(&self, raw: RawIntent, now: DateTime<Utc>) -> CompileOutput {
        let mut diagnostics = Diagnostics::new();
        let intent = raw.into_intent(&mut diagnostics);
        self.run(&intent, now, diagnostics)
    }

    pub fn compile_raw(&self, raw: RawIntent) -> CompileOutput {
        self.compile_raw_at(raw, Utc::now())
    }

    /// Decode a flat wire-form document and compile it.
    pub fn compile_json(&self, document: Value) -> CompileResult<CompileOutput> {
        let raw = RawIntent::from_json(document)?;
        Ok(self.compile_raw(raw))
    }

    fn run(&self, intent: &QueryIntent, now: DateTime<Utc>, mut diagnostics: Diagnostics) -> CompileOutput {
        let entity = self.primary_entity(&intent.primary_entity, &mut diagnostics);
        let pipeline = PipelineAssembler::new(&self.registry, &self.settings).assemble(
            entity,
            intent,
            now,
            &mut diagnostics,
        );

        debug!(
            entity = %entity.name,
            stages = pipeline.len(),
            diagnostics = diagnostics.len(),
            "compiled intent"
        );

        CompileOutput {
            entity: entity.name.clone(),
            collection: entity.collection.clone(),
            pipeline,
            diagnostics: diagnostics.into_vec(),
        }
    }

    /// The named entity, or the configured default when it is missing or unknown.
    fn primary_entity(&self, name: &str, diagnostics: &mut Diagnostics) -> &Entity {
        if let Some(entity) = self.registry.entity(name) {
            return entity;
        }

        let entity = self
            .settings
            .default_entity
            .as_deref()
            .and_then(|d| self.registry.entity(d))
            .unwrap_or_else(|| self.registry.fallback_entity());
        let subject = if name.is_empty() { "<none>" } else { name };
        diagnostics.push(
            DiagnosticKind::UnknownEntity,
            subject,
            format!("using default entity '{}'", entity.name),
        );
        entity
    }
}
