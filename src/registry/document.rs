//! TOML registry document and its validation into a [`Registry`].
//!
//! Example:
//! ```toml
//! version = 1
//! default_entity = "workItem"
//! hub_entity = "project"
//!
//! [enums.priority]
//! values = ["URGENT", "HIGH", "MEDIUM", "LOW", "NONE"]
//! ranked = true
//!
//! [entities.workItem]
//! collection = "workItem"
//! display_field = "title"
//! allowed_fields = ["title", "priority", "project._id", "project.name"]
//!
//! [entities.workItem.fields]
//! priority = { path = "priority", kind = "enum", vocab = "priority" }
//!
//! [[entities.workItem.relations]]
//! name = "project"
//! target = "project"
//! cardinality = "one"
//! join = { kind = "direct_key_match", local_field = "project._id", foreign_field = "_id" }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::types::{
    Cardinality, Entity, EnumVocab, FieldKind, FieldMapping, FieldMappingTable, GroupKey,
    JoinMechanism, MeasureSpec, RelationFilter, RelationshipEdge,
};
use super::Registry;
use crate::error::{RegistryError, RegistryResult};

/// Registry document version understood by this crate.
pub const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryDocument {
    pub version: u32,
    pub default_entity: String,
    pub hub_entity: String,
    #[serde(default)]
    pub enums: BTreeMap<String, EnumDocument>,
    #[serde(default)]
    pub relation_filters: BTreeMap<String, RelationFilter>,
    #[serde(default)]
    pub group_targets: BTreeMap<String, String>,
    pub entities: BTreeMap<String, EntityDocument>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnumDocument {
    pub values: Vec<String>,
    #[serde(default)]
    pub ranked: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntityDocument {
    pub collection: String,
    pub display_field: String,
    #[serde(default)]
    pub text_search: bool,
    #[serde(default)]
    pub allowed_fields: Vec<String>,
    #[serde(default)]
    pub default_projection: Vec<String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDocument>,
    #[serde(default)]
    pub arrays: BTreeMap<String, String>,
    #[serde(default)]
    pub group_by: BTreeMap<String, GroupKey>,
    #[serde(default)]
    pub measure: Option<MeasureSpec>,
    #[serde(default)]
    pub relations: Vec<RelationDocument>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldDocument {
    pub path: String,
    pub kind: String,
    #[serde(default)]
    pub vocab: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelationDocument {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub join: JoinMechanism,
    /// Defaults to `name`.
    #[serde(default)]
    pub alias: Option<String>,
    /// Defaults to `cardinality == many`.
    #[serde(default)]
    pub is_array: Option<bool>,
}

impl RegistryDocument {
    pub fn from_toml_str(source: &str) -> RegistryResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Validate every cross-reference and build the immutable registry.
    pub fn into_registry(self) -> RegistryResult<Registry> {
        if self.version != SUPPORTED_VERSION {
            return Err(RegistryError::UnsupportedVersion {
                found: self.version,
                supported: SUPPORTED_VERSION,
            });
        }

        let entity_names: HashSet<&str> = self.entities.keys().map(|s| s.as_str()).collect();
        require_entity(&entity_names, &self.default_entity, "default_entity")?;
        require_entity(&entity_names, &self.hub_entity, "hub_entity")?;

        let enums: HashMap<String, EnumVocab> = self
            .enums
            .iter()
            .map(|(name, doc)| {
                (
                    name.clone(),
                    EnumVocab {
                        name: name.clone(),
                        values: doc.values.clone(),
                        ranked: doc.ranked,
                    },
                )
            })
            .collect();

        let mut entities = HashMap::new();
        for (name, doc) in &self.entities {
            let entity = build_entity(name, doc, &entity_names, &enums)?;
            entities.insert(name.clone(), entity);
        }

        // Indirect edges need the source's own edge to the intermediate entity
        for entity in entities.values() {
            for rel in &entity.relations {
                if let JoinMechanism::Indirect { via_entity, .. } = &rel.join {
                    if entity.relation_to(via_entity).is_none() {
                        return Err(RegistryError::InvalidRelation {
                            entity: entity.name.clone(),
                            relation: rel.name.clone(),
                            message: format!("no relation to intermediate entity '{}'", via_entity),
                        });
                    }
                }
            }
        }

        for (key, filter) in &self.relation_filters {
            let target = entities.get(&filter.target).ok_or_else(|| RegistryError::UnknownEntity {
                entity: filter.target.clone(),
                context: format!("relation filter '{}'", key),
            })?;
            if target.mapping(&filter.field).is_none() {
                return Err(RegistryError::InvalidEntity {
                    entity: filter.target.clone(),
                    message: format!(
                        "relation filter '{}' names unknown field '{}'",
                        key, filter.field
                    ),
                });
            }
        }

        for (token, target) in &self.group_targets {
            require_entity(&entity_names, target, &format!("group target '{}'", token))?;
        }

        Ok(Registry::assemble(
            self.version,
            self.default_entity,
            self.hub_entity,
            entities,
            enums,
            self.relation_filters.into_iter().collect(),
            self.group_targets.into_iter().collect(),
        ))
    }
}

fn require_entity(names: &HashSet<&str>, entity: &str, context: &str) -> RegistryResult<()> {
    if names.contains(entity) {
        Ok(())
    } else {
        Err(RegistryError::UnknownEntity {
            entity: entity.to_string(),
            context: context.to_string(),
        })
    }
}

fn build_entity(
    name: &str,
    doc: &EntityDocument,
    entity_names: &HashSet<&str>,
    enums: &HashMap<String, EnumVocab>,
) -> RegistryResult<Entity> {
    let invalid = |message: String| RegistryError::InvalidEntity {
        entity: name.to_string(),
        message,
    };

    if doc.collection.trim().is_empty() {
        return Err(invalid("empty collection name".into()));
    }

    let allowed_fields: BTreeSet<String> = doc.allowed_fields.iter().cloned().collect();

    for field in &doc.default_projection {
        if !allowed_fields.contains(field) {
            return Err(invalid(format!(
                "default projection field '{}' is not allow-listed",
                field
            )));
        }
    }

    let mut fields = FieldMappingTable::new();
    for (key, field) in &doc.fields {
        let kind = parse_field_kind(name, key, field, enums)?;
        fields.insert(FieldMapping {
            key: key.clone(),
            path: field.path.clone(),
            kind,
        });
    }

    for (alias, canonical) in &doc.aliases {
        if fields.get(canonical).is_none() {
            return Err(invalid(format!(
                "alias '{}' points to unknown field '{}'",
                alias, canonical
            )));
        }
    }

    let array_paths: HashSet<&str> = doc.arrays.values().map(|s| s.as_str()).collect();
    for (token, key) in &doc.group_by {
        if let Some(unwind) = &key.unwind {
            if !array_paths.contains(unwind.as_str()) {
                return Err(invalid(format!(
                    "group token '{}' unwinds '{}' which is not a declared array",
                    token, unwind
                )));
            }
        }
    }

    let mut relations = Vec::with_capacity(doc.relations.len());
    let mut seen = HashSet::new();
    for rel in &doc.relations {
        let invalid_rel = |message: &str| RegistryError::InvalidRelation {
            entity: name.to_string(),
            relation: rel.name.clone(),
            message: message.to_string(),
        };

        if !seen.insert(rel.name.as_str()) {
            return Err(invalid_rel("duplicate relation name"));
        }
        require_entity(
            entity_names,
            &rel.target,
            &format!("relation '{}.{}'", name, rel.name),
        )?;
        if let JoinMechanism::Indirect { via_entity, .. } = &rel.join {
            require_entity(
                entity_names,
                via_entity,
                &format!("relation '{}.{}'", name, rel.name),
            )?;
            if via_entity == &rel.target {
                return Err(invalid_rel("intermediate entity equals target"));
            }
        }

        let alias = rel.alias.clone().unwrap_or_else(|| rel.name.clone());
        if alias.is_empty() || alias.starts_with('$') || alias.contains('.') {
            return Err(invalid_rel("alias must be a plain field name"));
        }

        relations.push(RelationshipEdge {
            name: rel.name.clone(),
            source: name.to_string(),
            target: rel.target.clone(),
            cardinality: rel.cardinality,
            join: rel.join.clone(),
            alias,
            is_array: rel.is_array.unwrap_or(rel.cardinality.causes_fanout()),
        });
    }

    Ok(Entity {
        name: name.to_string(),
        collection: doc.collection.clone(),
        display_field: doc.display_field.clone(),
        text_search: doc.text_search,
        allowed_fields,
        default_projection: doc.default_projection.clone(),
        aliases: doc.aliases.clone().into_iter().collect(),
        fields,
        arrays: doc.arrays.clone().into_iter().collect(),
        group_by: doc.group_by.clone().into_iter().collect(),
        measure: doc.measure.clone(),
        relations,
    })
}

fn parse_field_kind(
    entity: &str,
    key: &str,
    field: &FieldDocument,
    enums: &HashMap<String, EnumVocab>,
) -> RegistryResult<FieldKind> {
    let kind = match field.kind.as_str() {
        "text" => FieldKind::Text,
        "exact" => FieldKind::Exact,
        "boolean" => FieldKind::Boolean,
        "number" => FieldKind::Number,
        "date" => FieldKind::Date,
        "enum" => {
            let vocab = field.vocab.clone().unwrap_or_else(|| key.to_string());
            if !enums.contains_key(&vocab) {
                return Err(RegistryError::UnknownVocabulary {
                    vocab,
                    entity: entity.to_string(),
                    field: key.to_string(),
                });
            }
            FieldKind::Enum { vocab }
        }
        other => {
            return Err(RegistryError::InvalidEntity {
                entity: entity.to_string(),
                message: format!("field '{}' has unknown kind '{}'", key, other),
            })
        }
    };
    Ok(kind)
}
