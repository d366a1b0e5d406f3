//! Join resolution - which relationship edges a query must traverse.
//!
//! Inputs come from three places: requested relation paths, joined filter
//! targets, and group-by tokens. Each becomes a chain of edges starting at the
//! primary entity. Chains are merged into one ordered join list where every
//! hop appears once and parents precede children.

use tracing::debug;

use crate::error::{DiagnosticKind, Diagnostics};
use crate::registry::{Entity, JoinMechanism, Registry, RelationshipEdge};

// ============================================================================
// Output
// ============================================================================

/// One join in the compiled pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub edge: RelationshipEdge,
    /// Field the joined documents are written to. May differ from the edge's
    /// declared alias when that name is already taken.
    pub alias: String,
    /// Flatten the joined array right after the lookup.
    pub unwind: bool,
    /// Alias of the previous hop; the local field is read from under it.
    pub local_prefix: Option<String>,
    /// For indirect edges: the source's own edge to the intermediate entity.
    pub via: Option<RelationshipEdge>,
}

impl JoinSpec {
    /// Full local path on the current document, including any hop prefix.
    pub fn local_path(&self, field: &str) -> String {
        match &self.local_prefix {
            Some(prefix) => format!("{}.{}", prefix, field),
            None => field.to_string(),
        }
    }
}

/// A group-by token resolved to a concrete document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKeySpec {
    pub token: String,
    pub path: String,
    /// Embedded array to flatten before grouping.
    pub unwind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinPlan {
    pub joins: Vec<JoinSpec>,
    pub group_keys: Vec<GroupKeySpec>,
    /// Target entity -> alias holding its joined documents.
    pub aliases: Vec<(String, String)>,
    /// Aliases produced for explicitly requested relation paths.
    pub requested: Vec<String>,
}

impl JoinPlan {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn alias_for(&self, entity: &str) -> Option<&str> {
        self.aliases
            .iter()
            .find(|(e, _)| e == entity)
            .map(|(_, a)| a.as_str())
    }

    pub fn join(&self, alias: &str) -> Option<&JoinSpec> {
        self.joins.iter().find(|j| j.alias == alias)
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// What the consumer of a chain needs from its last hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Attach related documents as-is.
    Attach,
    /// Read a scalar through the alias; `Many` edges get flattened.
    Scalar,
    /// Group on the joined value; always flattened.
    Group,
}

struct Node {
    /// `source:relation` hops from the primary entity, dot-joined.
    key: String,
    spec: JoinSpec,
}

pub struct JoinResolver<'r> {
    registry: &'r Registry,
}

impl<'r> JoinResolver<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    pub fn resolve(
        &self,
        primary: &Entity,
        relation_paths: &[String],
        joined_targets: &[&str],
        group_by: &[String],
        diagnostics: &mut Diagnostics,
    ) -> JoinPlan {
        let mut nodes: Vec<Node> = Vec::new();
        let mut plan = JoinPlan::default();

        for path in relation_paths {
            match self.walk(primary, path) {
                Ok(chain) => {
                    let idx = add_chain(primary, &mut nodes, &chain, Access::Attach, self.registry);
                    let alias = nodes[idx].spec.alias.clone();
                    record_alias(&mut plan, &chain, &alias);
                    if !plan.requested.contains(&alias) {
                        plan.requested.push(alias);
                    }
                }
                Err(hop) => diagnostics.push(
                    DiagnosticKind::UnresolvableRelation,
                    path.as_str(),
                    format!("no relation '{}' on the path from '{}'", hop, primary.name),
                ),
            }
        }

        for target in joined_targets {
            match self.registry.route(&primary.name, target) {
                Some(chain) => {
                    let idx = add_chain(primary, &mut nodes, &chain, Access::Scalar, self.registry);
                    let alias = nodes[idx].spec.alias.clone();
                    record_alias(&mut plan, &chain, &alias);
                }
                None => diagnostics.push(
                    DiagnosticKind::UnresolvableRelation,
                    *target,
                    format!("'{}' is not reachable from '{}'", target, primary.name),
                ),
            }
        }

        for token in group_by {
            match self.group_key(primary, token, &mut nodes, &mut plan) {
                Some(key) => {
                    if !plan.group_keys.iter().any(|k| k.token == key.token) {
                        plan.group_keys.push(key);
                    }
                }
                None => diagnostics.push(
                    DiagnosticKind::UnresolvedField,
                    token.as_str(),
                    format!("group-by token does not resolve on '{}'", primary.name),
                ),
            }
        }

        plan.joins = nodes.into_iter().map(|n| n.spec).collect();
        debug!(
            entity = %primary.name,
            joins = plan.joins.len(),
            group_keys = plan.group_keys.len(),
            "joins resolved"
        );
        plan
    }

    /// Walk a dot-separated relation path. Each hop may name a relation or
    /// a target entity. Returns the failing hop on error.
    fn walk<'a>(&'a self, primary: &'a Entity, path: &'a str) -> Result<Vec<&'a RelationshipEdge>, &'a str> {
        let mut current = primary;
        let mut chain = Vec::new();
        for hop in path.split('.').map(str::trim) {
            let edge = current
                .relation(hop)
                .or_else(|| current.relation_to(hop))
                .or_else(|| {
                    self.registry
                        .entity(hop)
                        .and_then(|e| current.relation_to(&e.name))
                })
                .ok_or(hop)?;
            current = self.registry.entity(&edge.target).ok_or(hop)?;
            chain.push(edge);
        }
        Ok(chain)
    }

    fn group_key(
        &self,
        primary: &Entity,
        token: &str,
        nodes: &mut Vec<Node>,
        plan: &mut JoinPlan,
    ) -> Option<GroupKeySpec> {
        if let Some(key) = primary.group_by.get(token) {
            return Some(GroupKeySpec {
                token: token.to_string(),
                path: key.path.clone(),
                unwind: key.unwind.clone(),
            });
        }
        if let Some(mapping) = primary.mapping(token) {
            return Some(GroupKeySpec {
                token: token.to_string(),
                path: mapping.path.clone(),
                unwind: None,
            });
        }
        if primary.is_allowed(token) {
            return Some(GroupKeySpec {
                token: token.to_string(),
                path: token.to_string(),
                unwind: None,
            });
        }

        let target_name = self
            .registry
            .group_target(token)
            .map(str::to_string)
            .or_else(|| primary.relation(token).map(|r| r.target.clone()))
            .or_else(|| self.registry.entity(token).map(|e| e.name.clone()))?;
        let target = self.registry.entity(&target_name)?;
        let chain = self.registry.route(&primary.name, &target.name)?;

        let idx = add_chain(primary, nodes, &chain, Access::Group, self.registry);
        let alias = nodes[idx].spec.alias.clone();
        record_alias(plan, &chain, &alias);

        Some(GroupKeySpec {
            token: token.to_string(),
            path: format!("{}.{}", alias, target.display_field),
            unwind: None,
        })
    }
}

/// Merge a chain into the node list, returning the index of its last hop.
fn add_chain(
    primary: &Entity,
    nodes: &mut Vec<Node>,
    chain: &[&RelationshipEdge],
    access: Access,
    registry: &Registry,
) -> usize {
    let mut parent: Option<usize> = None;
    let mut key = String::new();

    for (i, edge) in chain.iter().enumerate() {
        if !key.is_empty() {
            key.push('.');
        }
        key.push_str(&edge.source);
        key.push(':');
        key.push_str(&edge.name);

        let is_last = i + 1 == chain.len();
        let wants_unwind = if is_last {
            match access {
                Access::Attach => false,
                Access::Scalar => edge.cardinality.causes_fanout(),
                Access::Group => true,
            }
        } else {
            true
        };

        let idx = match nodes.iter().position(|n| n.key == key) {
            Some(idx) => {
                nodes[idx].spec.unwind |= wants_unwind;
                idx
            }
            None => {
                let local_prefix = parent.map(|p| nodes[p].spec.alias.clone());
                let alias = choose_alias(primary, nodes, edge, local_prefix.as_deref());
                let via = match &edge.join {
                    JoinMechanism::Indirect { via_entity, .. } => registry
                        .entity(&edge.source)
                        .and_then(|source| source.relation_to(via_entity))
                        .cloned(),
                    _ => None,
                };
                nodes.push(Node {
                    key: key.clone(),
                    spec: JoinSpec {
                        edge: (*edge).clone(),
                        alias,
                        unwind: wants_unwind,
                        local_prefix,
                        via,
                    },
                });
                nodes.len() - 1
            }
        };
        parent = Some(idx);
    }

    parent.unwrap_or(0)
}

/// Declared alias, unless it would clobber an embedded field or another join.
fn choose_alias(
    primary: &Entity,
    nodes: &[Node],
    edge: &RelationshipEdge,
    parent_alias: Option<&str>,
) -> String {
    let mut alias = edge.alias.clone();
    if primary.embeds(&alias) {
        alias = format!("{}Doc", alias);
    }
    if nodes.iter().any(|n| n.spec.alias == alias) {
        alias = match parent_alias {
            Some(parent) => format!("{}_{}", parent, alias),
            None => format!("{}_{}", edge.source, alias),
        };
    }
    alias
}

fn record_alias(plan: &mut JoinPlan, chain: &[&RelationshipEdge], alias: &str) {
    if let Some(last) = chain.last() {
        if plan.alias_for(&last.target).is_none() {
            plan.aliases.push((last.target.clone(), alias.to_string()));
        }
    }
}
