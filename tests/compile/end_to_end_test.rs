// tests/compile/end_to_end_test.rs
//! Whole-pipeline expectations for representative questions.

use chrono::{DateTime, TimeZone, Utc};
use insta::assert_json_snapshot;
use serde_json::json;

use intentql::compile::Compiler;
use intentql::config::CompilerSettings;
use intentql::error::DiagnosticKind;
use intentql::model::{AggregationKind, AnalyticsRequest, QueryIntent, RawIntent, SortDirection};
use intentql::registry::Registry;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
}

fn compiler() -> Compiler {
    Compiler::new(Registry::builtin().unwrap())
}

#[test]
fn test_count_by_project_name() {
    let intent = QueryIntent::new("workItem")
        .with_filter("project_name", json!("Simpo"))
        .with_aggregation(AggregationKind::Count);
    let output = compiler().compile_at(&intent, now());

    assert_eq!(output.collection, "workItem");
    assert!(output.diagnostics.is_empty());
    assert_json_snapshot!("count_by_project_name", output.pipeline_json());
}

#[test]
fn test_group_by_priority() {
    let intent = QueryIntent::new("workItem").with_group_by("priority");
    let output = compiler().compile_at(&intent, now());
    assert_json_snapshot!("group_by_priority", output.pipeline_json());
}

#[test]
fn test_count_items_with_several_assignees() {
    let intent = QueryIntent::new("workItem")
        .with_filter("assignee_count", json!(">1"))
        .with_aggregation(AggregationKind::Count);
    let output = compiler().compile_at(&intent, now());
    assert_json_snapshot!("count_with_several_assignees", output.pipeline_json());
}

#[test]
fn test_recent_urgent_items() {
    let intent = QueryIntent::new("workItem")
        .with_filter("priority", json!("urgent"))
        .with_filter("createdTimeStamp", json!("last 7 days"))
        .with_sort("created", SortDirection::Descending)
        .with_limit(5);
    let output = compiler().compile_at(&intent, now());

    let docs = output.pipeline_json();
    assert_eq!(
        docs[0],
        json!({
            "$match": {
                "priority": "URGENT",
                "createdTimeStamp": { "$gte": { "$date": "2024-05-08T12:00:00.000Z" } }
            }
        })
    );
    assert_eq!(docs[1], json!({ "$sort": { "createdTimeStamp": -1 } }));
    assert_eq!(docs[3], json!({ "$limit": 5 }));
}

#[test]
fn test_cycles_grouped_by_module() {
    let intent = QueryIntent::new("cycle").with_group_by("module");
    let output = compiler().compile_at(&intent, now());
    let docs = output.pipeline_json();

    assert_eq!(
        docs[0],
        json!({
            "$lookup": {
                "from": "project",
                "let": { "localValue": "$project._id" },
                "pipeline": [
                    { "$match": { "$expr": { "$eq": ["$_id", "$$localValue"] } } }
                ],
                "as": "projectDoc"
            }
        })
    );
    assert_eq!(
        docs[2],
        json!({
            "$lookup": {
                "from": "module",
                "let": { "localValue": "$projectDoc._id" },
                "pipeline": [
                    { "$match": { "$expr": { "$eq": ["$project._id", "$$localValue"] } } }
                ],
                "as": "modules"
            }
        })
    );
    assert_eq!(docs[5]["$group"]["_id"], json!("$modules.title"));
}

#[test]
fn test_hours_logged_per_member() {
    let intent = QueryIntent::new("worklog")
        .with_group_by("member")
        .with_filter("loggedAt", json!("this_month"));
    let output = compiler().compile_at(&intent, now());
    let docs = output.pipeline_json();
    assert_eq!(output.collection, "workLog");
    assert_eq!(
        docs[0],
        json!({
            "$match": { "loggedAt": { "$gte": { "$date": "2024-05-01T00:00:00.000Z" } } }
        })
    );
    assert_eq!(docs[1]["$group"]["_id"], json!("$user.name"));
    assert_eq!(docs[2], json!({ "$sort": { "totalHours": -1 } }));
}

#[test]
fn test_bucket_supersedes_group() {
    let intent = QueryIntent::new("workItem")
        .with_group_by("priority")
        .with_analytics(AnalyticsRequest::BucketAuto {
            field: "estimate".into(),
            buckets: Some(3),
        });
    let output = compiler().compile_at(&intent, now());
    let ops: Vec<_> = output.pipeline.iter().map(|s| s.operator()).collect();
    assert_eq!(ops, vec!["$bucketAuto"]);
    assert!(output.has_diagnostic(DiagnosticKind::AggregationConflict));
}

// ============================================================================
// Flat wire form
// ============================================================================

#[test]
fn test_compile_flat_document() {
    let raw = RawIntent::from_json(json!({
        "primary_entity": "project",
        "filters": { "status": "started", "active": "yes" },
        "sort_order": { "name": "asc" },
        "limit": "20",
        "skip": 40
    }))
    .unwrap();
    let output = compiler().compile_raw_at(raw, now());

    assert!(output.diagnostics.is_empty());
    assert_json_snapshot!("flat_project_page", output.pipeline_json());
}

#[test]
fn test_flat_analytics_fields() {
    let raw = RawIntent::from_json(json!({
        "primary_entity": "workItem",
        "aggregations": ["count", "union_with"],
        "union_collection": "epic"
    }))
    .unwrap();
    let output = compiler().compile_raw_at(raw, now());
    assert_eq!(
        output.pipeline_json(),
        json!([{ "$unionWith": { "coll": "epic" } }, { "$count": "total" }])
    );
}

#[test]
fn test_compile_json_falls_back_on_missing_entity() {
    let output = compiler()
        .compile_json(json!({ "filters": { "title": "login" } }))
        .unwrap();
    assert_eq!(output.entity, "workItem");
    assert!(output.has_diagnostic(DiagnosticKind::UnknownEntity));
    assert_eq!(
        output.pipeline_json()[0],
        json!({ "$match": { "title": { "$regex": "login", "$options": "i" } } })
    );
}

#[test]
fn test_configured_default_entity() {
    let settings = CompilerSettings {
        default_entity: Some("project".into()),
        ..Default::default()
    };
    let compiler = compiler().with_settings(settings);
    let output = compiler.compile_at(&QueryIntent::new("spaceship"), now());
    assert_eq!(output.entity, "project");
    assert_eq!(output.collection, "project");
}

#[test]
fn test_compile_json_rejects_malformed_document() {
    let err = compiler()
        .compile_json(json!({ "group_by": "priority" }))
        .unwrap_err();
    assert!(err.to_string().starts_with("Invalid intent document"));
}

#[test]
fn test_output_serializes_as_stage_array() {
    let intent = QueryIntent::new("business").with_limit(1);
    let output = compiler().compile_at(&intent, now());
    let text = serde_json::to_string(&output.pipeline).unwrap();
    assert_eq!(
        text,
        r#"[{"$project":{"name":1,"createdTimeStamp":1}},{"$limit":1}]"#
    );
}
