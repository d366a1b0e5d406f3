//! Entity relation graph for route finding.
//!
//! Nodes are entities, edges are declared relations (directed, source to
//! target). Routes are either a direct edge or a two-hop route through the
//! hub entity.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};

use super::types::Entity;

/// Edge weight: which relation on the source entity this edge came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRef {
    pub source: String,
    pub relation: String,
    /// Declaration position on the source entity.
    pub ordinal: usize,
}

/// A route is a list of relation references, parent first.
pub type Route = Vec<RelationRef>;

#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    graph: DiGraph<String, RelationRef>,
    node_indices: HashMap<String, NodeIndex>,
}

impl RelationGraph {
    pub fn build<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Self {
        let entities: Vec<&Entity> = entities.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        for entity in &entities {
            let idx = graph.add_node(entity.name.clone());
            node_indices.insert(entity.name.clone(), idx);
        }

        for entity in &entities {
            let from = node_indices[&entity.name];
            for (ordinal, rel) in entity.relations.iter().enumerate() {
                // Targets are validated before the graph is built
                let Some(&to) = node_indices.get(&rel.target) else {
                    continue;
                };
                graph.add_edge(
                    from,
                    to,
                    RelationRef {
                        source: entity.name.clone(),
                        relation: rel.name.clone(),
                        ordinal,
                    },
                );
            }
        }

        Self {
            graph,
            node_indices,
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// First-declared relation from `from` to `to`.
    pub fn direct(&self, from: &str, to: &str) -> Option<RelationRef> {
        let a = *self.node_indices.get(from)?;
        let b = *self.node_indices.get(to)?;
        self.graph
            .edges_connecting(a, b)
            .map(|e| e.weight())
            .min_by_key(|r| r.ordinal)
            .cloned()
    }

    /// Direct edge, else `from -> hub -> to`.
    pub fn route(&self, from: &str, to: &str, hub: &str) -> Option<Route> {
        if from == to {
            return None;
        }
        if let Some(edge) = self.direct(from, to) {
            return Some(vec![edge]);
        }
        if from == hub || to == hub {
            return None;
        }
        let first = self.direct(from, hub)?;
        let second = self.direct(hub, to)?;
        Some(vec![first, second])
    }
}
