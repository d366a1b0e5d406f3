// tests/pipeline/assembler_test.rs
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use intentql::config::CompilerSettings;
use intentql::error::{DiagnosticKind, Diagnostics};
use intentql::model::{
    pipeline_to_json, AggregationKind, AnalyticsRequest, PipelineStage, QueryIntent,
    SortDirection,
};
use intentql::pipeline::PipelineAssembler;
use intentql::registry::Registry;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
}

fn assemble_with(intent: &QueryIntent, settings: &CompilerSettings) -> (Vec<PipelineStage>, Diagnostics) {
    let registry = Registry::builtin().unwrap();
    let entity = registry.entity(&intent.primary_entity).unwrap();
    let mut diagnostics = Diagnostics::new();
    let stages = PipelineAssembler::new(&registry, settings).assemble(entity, intent, now(), &mut diagnostics);
    (stages, diagnostics)
}

fn assemble(intent: &QueryIntent) -> (Vec<PipelineStage>, Diagnostics) {
    assemble_with(intent, &CompilerSettings::default())
}

fn operators(stages: &[PipelineStage]) -> Vec<&'static str> {
    stages.iter().map(PipelineStage::operator).collect()
}

// ============================================================================
// Count short-circuit
// ============================================================================

#[test]
fn test_pure_count_without_filters() {
    let intent = QueryIntent::new("workItem").with_aggregation(AggregationKind::Count);
    let (stages, _) = assemble(&intent);
    assert_eq!(pipeline_to_json(&stages), json!([{ "$count": "total" }]));
}

#[test]
fn test_count_with_union() {
    let intent = QueryIntent::new("workItem")
        .with_filter("priority", json!("high"))
        .with_aggregation(AggregationKind::Count)
        .with_analytics(AnalyticsRequest::UnionWith {
            collection: "epic".into(),
        });
    let (stages, _) = assemble(&intent);
    assert_eq!(
        pipeline_to_json(&stages),
        json!([
            { "$match": { "priority": "HIGH" } },
            { "$unionWith": { "coll": "epic" } },
            { "$count": "total" }
        ])
    );
}

#[test]
fn test_count_ignores_joined_filters() {
    let intent = QueryIntent::new("workItem")
        .with_filter("member_role", json!("admin"))
        .with_aggregation(AggregationKind::Count);
    let (stages, diagnostics) = assemble(&intent);
    assert_eq!(operators(&stages), vec!["$count"]);
    assert!(diagnostics.has(DiagnosticKind::UnresolvableRelation));
}

#[test]
fn test_count_field_is_configurable() {
    let settings = CompilerSettings {
        count_field: "n".into(),
        ..Default::default()
    };
    let intent = QueryIntent::new("project").with_aggregation(AggregationKind::Count);
    let (stages, _) = assemble_with(&intent, &settings);
    assert_eq!(pipeline_to_json(&stages), json!([{ "$count": "n" }]));
}

#[test]
fn test_count_with_details_is_not_pure() {
    let intent = QueryIntent::new("workItem")
        .with_aggregation(AggregationKind::Count)
        .with_details();
    let (stages, _) = assemble(&intent);
    assert!(!operators(&stages).contains(&"$count"));
}

// ============================================================================
// Joins and secondary match
// ============================================================================

#[test]
fn test_joined_filter_matches_after_lookup() {
    let intent = QueryIntent::new("page").with_filter("cycle_name", json!("Sprint 4"));
    let (stages, diagnostics) = assemble(&intent);
    assert!(diagnostics.is_empty());

    let docs = pipeline_to_json(&stages);
    assert_eq!(
        docs[0],
        json!({
            "$lookup": {
                "from": "cycle",
                "let": { "localValues": { "$ifNull": ["$linkedCycle._id", []] } },
                "pipeline": [
                    { "$match": { "$expr": { "$in": ["$_id", "$$localValues"] } } }
                ],
                "as": "linkedCycles"
            }
        })
    );
    assert_eq!(
        docs[1],
        json!({ "$unwind": { "path": "$linkedCycles", "preserveNullAndEmptyArrays": true } })
    );
    assert_eq!(
        docs[2],
        json!({ "$match": { "linkedCycles.name": { "$regex": "Sprint 4", "$options": "i" } } })
    );
}

#[test]
fn test_primary_match_precedes_lookups() {
    let intent = QueryIntent::new("workItem")
        .with_filter("priority", json!("urgent"))
        .with_filter("member_role", json!("admin"));
    let (stages, _) = assemble(&intent);
    assert_eq!(&operators(&stages)[..4], &["$match", "$lookup", "$unwind", "$match"]);
    assert_eq!(
        pipeline_to_json(&stages)[3],
        json!({ "$match": { "assignees.role": "ADMIN" } })
    );
}

#[test]
fn test_requested_relation_adds_reference_fallback() {
    let intent = QueryIntent::new("workItem").with_target("project");
    let (stages, _) = assemble(&intent);
    let docs = pipeline_to_json(&stages);
    assert_eq!(docs[0]["$lookup"]["as"], json!("projectDoc"));
    assert_eq!(
        docs[1],
        json!({
            "$addFields": {
                "project": { "$ifNull": ["$project", { "$arrayElemAt": ["$projectDoc", 0] }] }
            }
        })
    );
    // Requested aliases survive the projection.
    assert_eq!(docs[2]["$project"]["projectDoc"], json!(1));
}

#[test]
fn test_multi_hop_lookup_reads_previous_alias() {
    let intent = QueryIntent::new("workItem").with_target("project.cycles");
    let (stages, _) = assemble(&intent);
    let docs = pipeline_to_json(&stages);
    assert_eq!(
        operators(&stages)[..4],
        ["$lookup", "$unwind", "$lookup", "$addFields"]
    );
    assert_eq!(docs[2]["$lookup"]["from"], json!("cycle"));
    assert_eq!(docs[2]["$lookup"]["let"], json!({ "localValue": "$projectDoc._id" }));
    assert_eq!(
        docs[3],
        json!({ "$addFields": { "project": { "$ifNull": ["$project", "$projectDoc"] } } })
    );
}

#[test]
fn test_indirect_join_nests_intermediate_lookup() {
    let intent = QueryIntent::new("members").with_target("business");
    let (stages, _) = assemble(&intent);
    let docs = pipeline_to_json(&stages);
    assert_eq!(
        docs[0],
        json!({
            "$lookup": {
                "from": "project",
                "let": { "localValue": "$project._id" },
                "pipeline": [
                    { "$match": { "$expr": { "$eq": ["$_id", "$$localValue"] } } },
                    {
                        "$lookup": {
                            "from": "business",
                            "let": { "localValue": "$business._id" },
                            "pipeline": [
                                { "$match": { "$expr": { "$eq": ["$_id", "$$localValue"] } } }
                            ],
                            "as": "__indirect"
                        }
                    },
                    { "$unwind": { "path": "$__indirect", "preserveNullAndEmptyArrays": false } },
                    { "$replaceRoot": { "newRoot": "$__indirect" } }
                ],
                "as": "business"
            }
        })
    );
}

// ============================================================================
// Grouping
// ============================================================================

#[test]
fn test_group_by_hub_routed_token() {
    let intent = QueryIntent::new("cycle").with_group_by("module");
    let (stages, diagnostics) = assemble(&intent);
    assert!(diagnostics.is_empty());
    assert_eq!(
        operators(&stages),
        vec!["$lookup", "$unwind", "$lookup", "$unwind", "$addFields", "$group", "$sort", "$project"]
    );
    let docs = pipeline_to_json(&stages);
    assert_eq!(docs[0]["$lookup"]["from"], json!("project"));
    assert_eq!(docs[2]["$lookup"]["from"], json!("module"));
    assert_eq!(docs[5]["$group"]["_id"], json!("$modules.title"));
}

#[test]
fn test_composite_group_key() {
    let intent = QueryIntent::new("workItem")
        .with_group_by("priority")
        .with_group_by("state");
    let (stages, _) = assemble(&intent);
    assert_eq!(
        pipeline_to_json(&stages)[0],
        json!({
            "$group": {
                "_id": { "priority": "$priority", "state": "$state.name" },
                "count": { "$sum": 1 }
            }
        })
    );
}

#[test]
fn test_group_on_embedded_array_unwinds_first() {
    let intent = QueryIntent::new("workItem").with_group_by("assignee");
    let (stages, _) = assemble(&intent);
    assert_eq!(
        pipeline_to_json(&stages).as_array().unwrap()[..2],
        [
            json!({ "$unwind": { "path": "$assignee", "preserveNullAndEmptyArrays": true } }),
            json!({ "$group": { "_id": "$assignee.name", "count": { "$sum": 1 } } })
        ]
    );
}

#[test]
fn test_worklog_groups_sum_duration() {
    let intent = QueryIntent::new("worklog").with_group_by("user");
    let (stages, _) = assemble(&intent);
    assert_eq!(
        pipeline_to_json(&stages),
        json!([
            {
                "$group": {
                    "_id": "$user.name",
                    "totalHours": {
                        "$sum": {
                            "$add": [
                                { "$ifNull": ["$hours", 0] },
                                { "$divide": [{ "$ifNull": ["$mins", 0] }, 60] }
                            ]
                        }
                    }
                }
            },
            { "$sort": { "totalHours": -1 } },
            { "$project": { "_id": 0, "totalHours": 1, "group": "$_id" } }
        ])
    );
}

#[test]
fn test_explicit_sort_on_group_key() {
    let intent = QueryIntent::new("workItem")
        .with_group_by("priority")
        .with_sort("priority", SortDirection::Ascending)
        .with_limit(3);
    let (stages, _) = assemble(&intent);
    let docs = pipeline_to_json(&stages);
    assert_eq!(docs[1], json!({ "$sort": { "_id": 1 } }));
    assert_eq!(docs[3], json!({ "$limit": 3 }));
}

#[test]
fn test_group_with_details_pushes_samples() {
    let intent = QueryIntent::new("cycle")
        .with_group_by("status")
        .with_details();
    let (stages, _) = assemble(&intent);
    let docs = pipeline_to_json(&stages);
    assert_eq!(
        docs[0]["$group"]["items"],
        json!({
            "$push": {
                "_id": "$_id",
                "name": "$name",
                "status": "$status",
                "startDate": "$startDate",
                "endDate": "$endDate",
                "project_name": "$project.name"
            }
        })
    );
    assert_eq!(docs[2]["$project"]["items"], json!({ "$slice": ["$items", 3] }));
}

#[test]
fn test_unresolved_group_token_falls_back_to_list() {
    let intent = QueryIntent::new("workItem").with_group_by("color");
    let (stages, diagnostics) = assemble(&intent);
    assert!(!operators(&stages).contains(&"$group"));
    assert!(diagnostics.has(DiagnosticKind::UnresolvedField));
}

// ============================================================================
// Sort, projection, pagination
// ============================================================================

#[test]
fn test_rank_sort_uses_helper_field() {
    let intent = QueryIntent::new("workItem")
        .with_sort("priority", SortDirection::Descending)
        .with_limit(10);
    let (stages, _) = assemble(&intent);
    assert_eq!(
        operators(&stages),
        vec!["$addFields", "$sort", "$project", "$limit", "$unset"]
    );
    let docs = pipeline_to_json(&stages);
    assert_eq!(
        docs[0]["$addFields"]["_priorityRank"]["$switch"]["branches"][0],
        json!({ "case": { "$eq": ["$priority", "URGENT"] }, "then": 5 })
    );
    assert_eq!(docs[1], json!({ "$sort": { "_priorityRank": -1 } }));
    assert_eq!(docs[4], json!({ "$unset": ["_priorityRank"] }));
}

#[test]
fn test_plain_sort_uses_canonical_path() {
    let intent = QueryIntent::new("workItem").with_sort("created", SortDirection::Descending);
    let (stages, _) = assemble(&intent);
    assert_eq!(
        pipeline_to_json(&stages)[0],
        json!({ "$sort": { "createdTimeStamp": -1 } })
    );
}

#[test]
fn test_unknown_sort_field_is_reported() {
    let intent = QueryIntent::new("workItem").with_sort("karma", SortDirection::Ascending);
    let (stages, diagnostics) = assemble(&intent);
    assert!(!operators(&stages).contains(&"$sort"));
    assert!(diagnostics.has(DiagnosticKind::UnresolvedField));
}

#[test]
fn test_default_projection() {
    let intent = QueryIntent::new("business");
    let (stages, _) = assemble(&intent);
    assert_eq!(
        pipeline_to_json(&stages),
        json!([{ "$project": { "name": 1, "createdTimeStamp": 1 } }])
    );
}

#[test]
fn test_explicit_projection_is_allow_listed() {
    let intent = QueryIntent::new("workItem")
        .with_projection("title")
        .with_projection("state")
        .with_projection("secret");
    let (stages, diagnostics) = assemble(&intent);
    assert_eq!(
        pipeline_to_json(&stages),
        json!([{ "$project": { "title": 1, "state.name": 1 } }])
    );
    assert!(diagnostics.has(DiagnosticKind::UnresolvedField));
}

#[test]
fn test_skip_then_limit() {
    let intent = QueryIntent::new("business").with_skip(20).with_limit(10);
    let (stages, _) = assemble(&intent);
    assert_eq!(operators(&stages), vec!["$project", "$skip", "$limit"]);
}

#[test]
fn test_fetch_one_forces_single_result() {
    let intent = QueryIntent::new("business").with_limit(10).with_fetch_one();
    let (stages, _) = assemble(&intent);
    assert_eq!(pipeline_to_json(&stages)[1], json!({ "$limit": 1 }));
}

#[test]
fn test_default_limit_applies_to_lists_only() {
    let settings = CompilerSettings {
        default_limit: Some(50),
        ..Default::default()
    };
    let list = QueryIntent::new("business");
    let (stages, _) = assemble_with(&list, &settings);
    assert_eq!(pipeline_to_json(&stages)[1], json!({ "$limit": 50 }));

    let grouped = QueryIntent::new("workItem").with_group_by("priority");
    let (stages, _) = assemble_with(&grouped, &settings);
    assert!(!operators(&stages).contains(&"$limit"));
}

#[test]
fn test_zero_limit_is_dropped_from_list() {
    let intent = QueryIntent::new("business").with_limit(0);
    let (stages, diagnostics) = assemble(&intent);
    assert_eq!(operators(&stages), vec!["$project"]);
    assert!(diagnostics.has(DiagnosticKind::InvalidFilterValue));
}

#[test]
fn test_zero_limit_falls_back_to_default_limit() {
    let settings = CompilerSettings {
        default_limit: Some(50),
        ..Default::default()
    };
    let intent = QueryIntent::new("business").with_limit(0);
    let (stages, _) = assemble_with(&intent, &settings);
    assert_eq!(pipeline_to_json(&stages)[1], json!({ "$limit": 50 }));
}

#[test]
fn test_zero_limit_is_dropped_from_groups() {
    let intent = QueryIntent::new("workItem").with_group_by("priority").with_limit(0);
    let (stages, diagnostics) = assemble(&intent);
    assert_eq!(operators(&stages), vec!["$group", "$sort", "$project"]);
    assert!(diagnostics.has(DiagnosticKind::InvalidFilterValue));
}

// ============================================================================
// Union
// ============================================================================

#[test]
fn test_union_precedes_grouping() {
    let intent = QueryIntent::new("workItem")
        .with_group_by("priority")
        .with_analytics(AnalyticsRequest::UnionWith {
            collection: "epic".into(),
        });
    let (stages, _) = assemble(&intent);
    assert_eq!(&operators(&stages)[..2], &["$unionWith", "$group"]);
}

#[test]
fn test_union_by_entity_name_uses_collection() {
    let intent = QueryIntent::new("workItem").with_analytics(AnalyticsRequest::UnionWith {
        collection: "worklog".into(),
    });
    let (stages, _) = assemble(&intent);
    assert_eq!(pipeline_to_json(&stages)[0], json!({ "$unionWith": { "coll": "workLog" } }));
}

#[test]
fn test_unknown_union_collection_is_dropped() {
    let intent = QueryIntent::new("workItem").with_analytics(AnalyticsRequest::UnionWith {
        collection: "sessions".into(),
    });
    let (stages, diagnostics) = assemble(&intent);
    assert!(!operators(&stages).contains(&"$unionWith"));
    assert!(diagnostics.has(DiagnosticKind::UnresolvedField));
}

#[test]
fn test_stage_documents_are_single_operator() {
    let intent = QueryIntent::new("cycle")
        .with_filter("status", json!("active"))
        .with_group_by("module")
        .with_limit(5);
    let (stages, _) = assemble(&intent);
    for doc in pipeline_to_json(&stages).as_array().unwrap() {
        let object = doc.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert!(object.keys().all(|k| k.starts_with('$')));
    }
}
