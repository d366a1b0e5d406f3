//! Error and diagnostic types.
//!
//! Two tiers:
//! - Fatal errors (`RegistryError`, `ExecutorError`, ...) are returned as `Result`s.
//!   Only a registry that fails to load should stop the process.
//! - Per-request degradations are [`Diagnostic`]s. Compilation never fails on
//!   bad input; it drops the offending piece and records why.

use std::fmt;

use thiserror::Error;

pub use crate::config::SettingsError;

/// Errors raised while loading or validating a registry document.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read registry file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse registry document: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Unsupported registry version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Unknown entity '{entity}' referenced by {context}")]
    UnknownEntity { entity: String, context: String },

    #[error("Unknown enum vocabulary '{vocab}' referenced by {entity}.{field}")]
    UnknownVocabulary {
        vocab: String,
        entity: String,
        field: String,
    },

    #[error("Invalid relation '{relation}' on entity '{entity}': {message}")]
    InvalidRelation {
        entity: String,
        relation: String,
        message: String,
    },

    #[error("Invalid entity '{entity}': {message}")]
    InvalidEntity { entity: String, message: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised when constructing a [`crate::model::FilterPredicate`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredicateError {
    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Empty value list")]
    EmptyList,

    #[error("Range has no bounds")]
    UnboundedRange,

    #[error("Range lower bound is after upper bound")]
    InvertedRange,

    #[error("Negative array size: {0}")]
    NegativeSize(i64),

    #[error("Invalid element-match key '{0}'")]
    InvalidElementKey(String),

    #[error("Predicate is not allowed inside an element match")]
    NestedNotAllowed,
}

/// Errors surfaced by a store executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Store rejected pipeline on '{collection}': {message}")]
    Rejected { collection: String, message: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Classification of a non-fatal compile degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// Primary entity missing from the registry; the default entity was used.
    UnknownEntity,
    /// Filter key not in the allow-list or alias map.
    InvalidFilterKey,
    /// Filter value failed coercion for its declared kind.
    InvalidFilterValue,
    /// Requested or implied relation is not defined for the entity.
    UnresolvableRelation,
    /// Date phrase could not be parsed.
    MalformedDateSpec,
    /// Mutually exclusive aggregation requests; precedence applied.
    AggregationConflict,
    /// Sort, projection, or group-by token did not resolve to a field.
    UnresolvedField,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::UnknownEntity => "unknown_entity",
            DiagnosticKind::InvalidFilterKey => "invalid_filter_key",
            DiagnosticKind::InvalidFilterValue => "invalid_filter_value",
            DiagnosticKind::UnresolvableRelation => "unresolvable_relation",
            DiagnosticKind::MalformedDateSpec => "malformed_date_spec",
            DiagnosticKind::AggregationConflict => "aggregation_conflict",
            DiagnosticKind::UnresolvedField => "unresolved_field",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dropped or substituted piece of a query intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// The filter key, relation path, token, or entity concerned.
    pub subject: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.subject, self.message)
    }
}

/// Accumulates diagnostics for a single compile call.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        kind: DiagnosticKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) {
        let diagnostic = Diagnostic {
            kind,
            subject: subject.into(),
            message: message.into(),
        };
        tracing::debug!(
            kind = %diagnostic.kind,
            subject = %diagnostic.subject,
            "{}",
            diagnostic.message
        );
        self.items.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn has(&self, kind: DiagnosticKind) -> bool {
        self.items.iter().any(|d| d.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}
