//! Schema registry - entities, allow-lists, aliases, and relationship edges.
//!
//! The registry is built once at startup from a versioned TOML document and
//! never mutated afterwards. It is passed explicitly to the compiler; a
//! hot-reload would swap the whole value (e.g. behind an `Arc`), never patch it.
//!
//! Contract:
//! - [`Registry::entity`]
//! - [`Registry::edge`]
//! - [`Registry::is_allowed_field`]
//! - [`Registry::resolve_alias`]

mod document;
mod graph;
mod types;

pub use document::{
    EntityDocument, EnumDocument, FieldDocument, RegistryDocument, RelationDocument,
    SUPPORTED_VERSION,
};
pub use graph::{RelationGraph, RelationRef, Route};
pub use types::{
    Cardinality, Entity, EnumVocab, FieldKind, FieldMapping, FieldMappingTable, GroupKey,
    JoinMechanism, MeasureSpec, RelationFilter, RelationshipEdge,
};

use std::collections::HashMap;
use std::path::Path;

use crate::error::RegistryResult;

const BUILTIN_REGISTRY: &str = include_str!("default.toml");

/// Immutable, process-wide schema registry.
#[derive(Debug, Clone)]
pub struct Registry {
    version: u32,
    default_entity: String,
    hub_entity: String,
    entities: HashMap<String, Entity>,
    enums: HashMap<String, EnumVocab>,
    relation_filters: HashMap<String, RelationFilter>,
    group_targets: HashMap<String, String>,
    graph: RelationGraph,
}

impl Registry {
    pub(crate) fn assemble(
        version: u32,
        default_entity: String,
        hub_entity: String,
        entities: HashMap<String, Entity>,
        enums: HashMap<String, EnumVocab>,
        relation_filters: HashMap<String, RelationFilter>,
        group_targets: HashMap<String, String>,
    ) -> Self {
        let mut ordered: Vec<&Entity> = entities.values().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));
        let graph = RelationGraph::build(ordered);

        tracing::info!(
            version,
            entities = graph.node_count(),
            relations = graph.edge_count(),
            "schema registry loaded"
        );

        Self {
            version,
            default_entity,
            hub_entity,
            entities,
            enums,
            relation_filters,
            group_targets,
            graph,
        }
    }

    /// The project-management registry shipped with the crate.
    pub fn builtin() -> RegistryResult<Self> {
        Self::from_toml_str(BUILTIN_REGISTRY)
    }

    pub fn from_toml_str(source: &str) -> RegistryResult<Self> {
        RegistryDocument::from_toml_str(source)?.into_registry()
    }

    pub fn from_path(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn default_entity(&self) -> &str {
        &self.default_entity
    }

    /// The default entity itself. Load-time validation guarantees it exists.
    pub fn fallback_entity(&self) -> &Entity {
        &self.entities[&self.default_entity]
    }

    /// The common hub entity used for one-hop fallback routes.
    pub fn hub_entity(&self) -> &str {
        &self.hub_entity
    }

    /// Look up an entity by name: exact match first, then case-insensitive.
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name).or_else(|| {
            self.entities
                .values()
                .find(|e| e.name.eq_ignore_ascii_case(name))
        })
    }

    /// Find the entity backed by `collection`.
    pub fn entity_by_collection(&self, collection: &str) -> Option<&Entity> {
        self.entities.values().find(|e| e.collection == collection)
    }

    pub fn entity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn edge(&self, entity: &str, relation: &str) -> Option<&RelationshipEdge> {
        self.entity(entity)?.relation(relation)
    }

    pub fn is_allowed_field(&self, entity: &str, field: &str) -> bool {
        self.entity(entity).is_some_and(|e| e.is_allowed(field))
    }

    /// Resolve a logical key to its canonical field path.
    ///
    /// Goes through the alias map and field table; falls back to the key
    /// itself when it is an allow-listed path.
    pub fn resolve_alias(&self, entity: &str, key: &str) -> Option<String> {
        let entity = self.entity(entity)?;
        if let Some(mapping) = entity.mapping(key) {
            return Some(mapping.path.clone());
        }
        entity.is_allowed(key).then(|| key.to_string())
    }

    pub fn vocab(&self, name: &str) -> Option<&EnumVocab> {
        self.enums.get(name)
    }

    /// Name-based filter keys that require a relation (e.g. `cycle_name`).
    pub fn relation_filter(&self, key: &str) -> Option<&RelationFilter> {
        self.relation_filters.get(key)
    }

    /// Entity that a relational group-by token refers to.
    pub fn group_target(&self, token: &str) -> Option<&str> {
        self.group_targets.get(token).map(|s| s.as_str())
    }

    /// Route from one entity to another: direct edge, else through the hub.
    pub fn route(&self, from: &str, to: &str) -> Option<Vec<&RelationshipEdge>> {
        let route = self.graph.route(from, to, &self.hub_entity)?;
        route
            .iter()
            .map(|r| self.edge(&r.source, &r.relation))
            .collect()
    }

    pub fn graph(&self) -> &RelationGraph {
        &self.graph
    }
}
