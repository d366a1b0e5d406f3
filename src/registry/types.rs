//! Type definitions for the schema registry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Relationships
// ============================================================================

/// Whether a relationship yields at most one or possibly many documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

impl Cardinality {
    /// Returns true if the joined result may hold more than one document.
    pub fn causes_fanout(&self) -> bool {
        matches!(self, Cardinality::Many)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cardinality::One => write!(f, "1"),
            Cardinality::Many => write!(f, "N"),
        }
    }
}

/// How a relationship edge is joined in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinMechanism {
    /// `local == foreign`
    DirectKeyMatch {
        local_field: String,
        foreign_field: String,
    },
    /// `foreign IN local[]`
    ArrayMembership {
        local_array_field: String,
        foreign_field: String,
    },
    /// Two hops: the source's own edge to `via_entity`, then
    /// `via.path == target.foreign_field`.
    Indirect {
        via_entity: String,
        path: String,
        foreign_field: String,
    },
}

/// A declared traversal from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipEdge {
    /// Relation name, unique per source entity.
    pub name: String,
    pub source: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub join: JoinMechanism,
    /// Field the joined documents are written to.
    pub alias: String,
    /// Downstream consumers must flatten the result.
    pub is_array: bool,
}

impl RelationshipEdge {
    pub fn is_indirect(&self) -> bool {
        matches!(self.join, JoinMechanism::Indirect { .. })
    }
}

// ============================================================================
// Fields
// ============================================================================

/// Declared type of a filterable field. Selects the value normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Case-insensitive substring (or `prefix*`) match.
    Text,
    /// Exact equality on the raw value.
    Exact,
    /// Closed vocabulary; unrecognized values are dropped.
    Enum { vocab: String },
    Boolean,
    Number,
    Date,
}

impl FieldKind {
    pub fn is_date(&self) -> bool {
        matches!(self, FieldKind::Date)
    }
}

/// One row of an entity's field mapping table: logical key to canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub key: String,
    pub path: String,
    pub kind: FieldKind,
}

/// Table-driven mapping of logical filter keys for one entity.
#[derive(Debug, Clone, Default)]
pub struct FieldMappingTable {
    rows: BTreeMap<String, FieldMapping>,
}

impl FieldMappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mapping: FieldMapping) {
        self.rows.insert(mapping.key.clone(), mapping);
    }

    pub fn get(&self, key: &str) -> Option<&FieldMapping> {
        self.rows.get(key)
    }

    /// Find the mapping whose canonical path is `path`.
    pub fn by_path(&self, path: &str) -> Option<&FieldMapping> {
        self.rows.values().find(|m| m.path == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldMapping> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// An enum vocabulary shared by fields of the same family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumVocab {
    pub name: String,
    /// Canonical spellings. For ranked vocabularies, highest rank first.
    pub values: Vec<String>,
    /// Values carry an ordinal (e.g. priority) used for rank sorting.
    pub ranked: bool,
}

impl EnumVocab {
    /// Case-insensitive lookup returning the canonical spelling.
    pub fn canonical(&self, raw: &str) -> Option<&str> {
        let needle = normalize_enum_token(raw);
        self.values
            .iter()
            .find(|v| normalize_enum_token(v) == needle)
            .map(|v| v.as_str())
    }

    /// Ordinal of a canonical value: the highest-ranked value gets the largest number.
    pub fn rank(&self, value: &str) -> Option<usize> {
        self.values
            .iter()
            .position(|v| v == value)
            .map(|idx| self.values.len() - idx)
    }
}

fn normalize_enum_token(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// A group-by token embedded in the entity's own documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKey {
    pub path: String,
    /// Embedded array to flatten before grouping.
    #[serde(default)]
    pub unwind: Option<String>,
}

/// A domain-specific measure replacing the default count accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasureSpec {
    /// Sum of `hours + minutes / 60` across grouped documents.
    Duration {
        name: String,
        hours_field: String,
        minutes_field: String,
    },
    /// Plain sum of a numeric field.
    Sum { name: String, field: String },
}

impl MeasureSpec {
    pub fn name(&self) -> &str {
        match self {
            MeasureSpec::Duration { name, .. } | MeasureSpec::Sum { name, .. } => name,
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A schema-registered concept backed by one collection.
#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    pub collection: String,
    /// Human-readable field used when the entity is a group key.
    pub display_field: String,
    /// Backing collection has a full-text index.
    pub text_search: bool,
    /// Whitelist for projections, sorts, and raw-path filters.
    pub allowed_fields: BTreeSet<String>,
    pub default_projection: Vec<String>,
    /// Logical key -> canonical key in `fields`.
    pub aliases: HashMap<String, String>,
    pub fields: FieldMappingTable,
    /// Logical name -> array path, for `_count` and `_elemMatch` filters.
    pub arrays: HashMap<String, String>,
    pub group_by: HashMap<String, GroupKey>,
    pub measure: Option<MeasureSpec>,
    /// Declaration order is preserved; first match wins.
    pub relations: Vec<RelationshipEdge>,
}

impl Entity {
    /// Resolve a logical key through the alias map to its canonical key.
    pub fn canonical_key<'a>(&'a self, key: &'a str) -> &'a str {
        self.aliases.get(key).map(|s| s.as_str()).unwrap_or(key)
    }

    /// Look up a field mapping, going through aliases first.
    pub fn mapping(&self, key: &str) -> Option<&FieldMapping> {
        self.fields.get(self.canonical_key(key))
    }

    pub fn relation(&self, name: &str) -> Option<&RelationshipEdge> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// First declared relation reaching `target`.
    pub fn relation_to(&self, target: &str) -> Option<&RelationshipEdge> {
        self.relations.iter().find(|r| r.target == target)
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        self.allowed_fields.contains(path)
    }

    /// Whether documents already embed a field at `name` (scalar or sub-document).
    pub fn embeds(&self, name: &str) -> bool {
        let prefix = format!("{}.", name);
        self.allowed_fields
            .iter()
            .any(|f| f == name || f.starts_with(&prefix))
    }
}

/// A filter key that needs a joined relation, e.g. `cycle_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationFilter {
    /// Entity holding the field.
    pub target: String,
    /// Logical key in the target entity's field table.
    pub field: String,
}
