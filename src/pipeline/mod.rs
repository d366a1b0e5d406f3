//! Pipeline assembly.
//!
//! Phases run in a fixed order:
//!
//! 1. primary match
//! 2. count short-circuit
//! 3. lookups, in resolver order
//! 4. secondary match on joined fields
//! 5. embedded-or-looked-up reference fallbacks
//! 6. union with another collection
//! 7. grouping and measures
//! 8. document sort (rank helpers for ordered vocabularies)
//! 9. projection
//! 10. pagination
//! 11. graph traversal, then at most one reshaping analytic
//!
//! Rank helpers are dropped by a trailing `Unset`. No phase can fail the
//! whole pipeline; unresolved pieces are left out and reported.

mod analytics;
mod group;
mod lookup;
mod sort;

pub use analytics::{Analytics, HIERARCHY_FIELD, PRECEDENCE};
pub use group::{group_stages, measure, COUNT_MEASURE};
pub use lookup::{join_stages, reference_fallbacks};
pub use sort::{rank_expression, sort_plan, SortPlan};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::config::CompilerSettings;
use crate::error::{DiagnosticKind, Diagnostics};
use crate::model::{
    AggregationKind, AnalyticsRequest, FieldPredicate, MatchDocument, PipelineStage, QueryIntent,
};
use crate::normalize::{FilterNormalizer, NormalizedFilters};
use crate::registry::{Entity, Registry};
use crate::resolve::{JoinPlan, JoinResolver};

/// Sequences stages for one intent against a read-only registry.
pub struct PipelineAssembler<'r> {
    registry: &'r Registry,
    settings: &'r CompilerSettings,
}

impl<'r> PipelineAssembler<'r> {
    pub fn new(registry: &'r Registry, settings: &'r CompilerSettings) -> Self {
        Self { registry, settings }
    }

    /// Assemble the pipeline for `intent` on `entity`.
    ///
    /// `now` anchors every relative date phrase.
    pub fn assemble(
        &self,
        entity: &Entity,
        intent: &QueryIntent,
        now: DateTime<Utc>,
        diagnostics: &mut Diagnostics,
    ) -> Vec<PipelineStage> {
        let filters = FilterNormalizer::new(self.registry, now).normalize(entity, &intent.filters, diagnostics);
        let analytics = Analytics::new(entity, self.registry, self.settings);

        let mut stages = Vec::new();

        // 1. Primary match
        if let Some(body) = filters.primary_match() {
            stages.push(PipelineStage::Match(body));
        }

        // 2. Count short-circuit
        if is_pure_count(intent) {
            return self.count_tail(stages, &filters, &analytics, intent, diagnostics);
        }

        // The reshaping analytic is chosen up front because it replaces any
        // manual grouping.
        let reshaping = analytics.reshaping(&intent.analytics, diagnostics);
        let group_by: &[String] = match &reshaping {
            Some((kind, _)) if !intent.group_by.is_empty() => {
                diagnostics.push(
                    DiagnosticKind::AggregationConflict,
                    intent.group_by.join(","),
                    format!("group-by superseded by {:?}", kind),
                );
                &[]
            }
            _ => &intent.group_by,
        };

        // 3. Joins
        let joined_targets = filters.joined_targets();
        let plan = JoinResolver::new(self.registry).resolve(
            entity,
            &intent.target_entities,
            &joined_targets,
            group_by,
            diagnostics,
        );
        for join in &plan.joins {
            stages.extend(join_stages(join, self.registry));
        }

        // 4. Secondary match
        if let Some(body) = secondary_match(&filters, &plan) {
            stages.push(PipelineStage::Match(body));
        }

        // 5. Field normalization
        if let Some(fields) = reference_fallbacks(&plan.joins) {
            stages.push(PipelineStage::AddFields(fields));
        }

        // 6. Set combination
        stages.extend(self.unions(intent, &analytics, diagnostics));

        // Built early so a projection can keep the traversal's start field.
        let graphs: Vec<PipelineStage> = intent
            .analytics
            .iter()
            .filter(|r| r.kind() == AggregationKind::GraphLookup)
            .filter_map(|r| analytics.graph_lookup(r, diagnostics))
            .collect();

        if intent.limit == Some(0) && !intent.fetch_one {
            diagnostics.push(
                DiagnosticKind::InvalidFilterValue,
                "limit",
                "limit must be at least 1; dropped",
            );
        }

        let mut helpers = Vec::new();
        let grouped = !plan.group_keys.is_empty();
        if let Some((kind, _)) = &reshaping {
            let skipped: Vec<&str> = [
                ("sort", !intent.sort.is_empty()),
                ("projection", !intent.projections.is_empty()),
                ("skip", intent.skip.is_some_and(|n| n > 0)),
                ("limit", intent.limit.is_some_and(|n| n > 0)),
            ]
            .into_iter()
            .filter_map(|(name, requested)| requested.then_some(name))
            .collect();
            if !skipped.is_empty() {
                diagnostics.push(
                    DiagnosticKind::AggregationConflict,
                    skipped.join(","),
                    format!("{} not applied to {:?} output", skipped.join(", "), kind),
                );
            }
        } else if grouped {
            // 7. Grouping + measures
            stages.extend(group_stages(entity, &plan.group_keys, intent, self.settings));
        } else {
            // 8. Sort
            let sort = sort_plan(entity, self.registry, &intent.sort, &plan, diagnostics);
            if !sort.ranks.is_empty() {
                stages.push(PipelineStage::AddFields(sort.ranks.clone()));
                helpers = sort.helpers();
            }
            if !sort.is_empty() {
                stages.push(PipelineStage::Sort(sort.keys));
            }

            // 9. Projection
            let keep: Vec<String> = graphs
                .iter()
                .filter_map(|g| match g {
                    PipelineStage::GraphLookup(graph) => Some(graph.start_with.clone()),
                    _ => None,
                })
                .collect();
            if let Some(fields) = projection(entity, intent, &plan, &keep, diagnostics) {
                stages.push(PipelineStage::Project(fields));
            }

            // 10. Pagination
            stages.extend(self.pagination(intent));
        }

        // 11. Advanced analytics
        stages.extend(graphs);
        if let Some((_, analytic)) = reshaping {
            stages.extend(analytic);
            if intent.fetch_one {
                stages.push(PipelineStage::Limit(1));
            }
        }

        if !helpers.is_empty() {
            stages.push(PipelineStage::Unset(helpers));
        }
        stages
    }

    /// `[Match?, UnionWith?, Count]`. Nothing that needs a join survives.
    fn count_tail(
        &self,
        mut stages: Vec<PipelineStage>,
        filters: &NormalizedFilters,
        analytics: &Analytics<'_>,
        intent: &QueryIntent,
        diagnostics: &mut Diagnostics,
    ) -> Vec<PipelineStage> {
        for joined in &filters.joined {
            diagnostics.push(
                DiagnosticKind::UnresolvableRelation,
                joined.predicate.path.as_str(),
                format!("joined filter on '{}' ignored by a plain count", joined.target),
            );
        }
        stages.extend(self.unions(intent, analytics, diagnostics));
        stages.push(PipelineStage::Count(self.settings.count_field.clone()));
        stages
    }

    fn unions(
        &self,
        intent: &QueryIntent,
        analytics: &Analytics<'_>,
        diagnostics: &mut Diagnostics,
    ) -> Vec<PipelineStage> {
        intent
            .analytics
            .iter()
            .filter_map(|r| match r {
                AnalyticsRequest::UnionWith { collection } => {
                    analytics.union_with(collection, diagnostics)
                }
                _ => None,
            })
            .collect()
    }

    fn pagination(&self, intent: &QueryIntent) -> Vec<PipelineStage> {
        let mut stages = Vec::new();
        if let Some(skip) = intent.skip.filter(|n| *n > 0) {
            stages.push(PipelineStage::Skip(skip));
        }
        let limit = page_limit(intent).or(self.settings.default_limit);
        if let Some(limit) = limit {
            stages.push(PipelineStage::Limit(limit));
        }
        stages
    }
}

/// Count with nothing that groups, samples, or reshapes.
pub fn is_pure_count(intent: &QueryIntent) -> bool {
    intent.wants_count()
        && intent.group_by.is_empty()
        && !intent.wants_details
        && !intent.analytics.iter().any(AnalyticsRequest::reshapes)
}

/// `Limit` for a page of results. Zero is not a valid limit and is ignored.
pub fn page_limit(intent: &QueryIntent) -> Option<u64> {
    if intent.fetch_one {
        Some(1)
    } else {
        intent.limit.filter(|n| *n > 0)
    }
}

/// Joined predicates rewritten under their join aliases.
fn secondary_match(filters: &NormalizedFilters, plan: &JoinPlan) -> Option<Map<String, Value>> {
    let mut doc = MatchDocument::new();
    for joined in &filters.joined {
        // Targets the resolver could not reach were already reported.
        let Some(alias) = plan.alias_for(&joined.target) else {
            continue;
        };
        let path = format!("{}.{}", alias, joined.predicate.path);
        doc.push(&FieldPredicate::new(path, joined.predicate.predicate.clone()));
    }
    (!doc.is_empty()).then(|| doc.into_map())
}

/// Inclusion projection over allow-listed fields and referenced join aliases.
fn projection(
    entity: &Entity,
    intent: &QueryIntent,
    plan: &JoinPlan,
    keep: &[String],
    diagnostics: &mut Diagnostics,
) -> Option<Map<String, Value>> {
    let mut paths: Vec<String> = Vec::new();

    if intent.projections.is_empty() {
        paths.extend(entity.default_projection.iter().cloned());
    } else {
        for field in &intent.projections {
            let path = entity
                .mapping(field)
                .map(|m| m.path.clone())
                .or_else(|| {
                    let known = entity.is_allowed(field)
                        || plan.requested.contains(field)
                        || sort::is_joined_path(field, plan);
                    known.then(|| field.clone())
                });
            match path {
                Some(path) => paths.push(path),
                None => diagnostics.push(
                    DiagnosticKind::UnresolvedField,
                    field.as_str(),
                    format!("not a projectable field of '{}'", entity.name),
                ),
            }
        }
    }
    if paths.is_empty() {
        return None;
    }
    paths.extend(plan.requested.iter().cloned());
    paths.extend(keep.iter().cloned());

    let mut kept: Vec<String> = Vec::new();
    for path in paths {
        add_path(&mut kept, path);
    }

    let mut fields = Map::new();
    for path in kept {
        fields.insert(path, json!(1));
    }
    Some(fields)
}

/// Keep the widest of overlapping paths; `a` and `a.b` cannot both be projected.
fn add_path(kept: &mut Vec<String>, path: String) {
    let covers = |outer: &str, inner: &str| {
        inner == outer || inner.strip_prefix(outer).is_some_and(|rest| rest.starts_with('.'))
    };
    if kept.iter().any(|k| covers(k, &path)) {
        return;
    }
    kept.retain(|k| !covers(&path, k));
    kept.push(path);
}
