// tests/normalize/filter_test.rs
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use test_case::test_case;

use intentql::error::{DiagnosticKind, Diagnostics};
use intentql::model::{Comparison, FilterPredicate};
use intentql::normalize::{
    coerce_array_size, coerce_bool, coerce_elem_match, coerce_number, coerce_text,
    FilterNormalizer, NormalizedFilters,
};
use intentql::registry::Registry;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
}

fn normalize(entity: &str, filters: Value) -> (NormalizedFilters, Diagnostics) {
    let registry = Registry::builtin().unwrap();
    let entity = registry.entity(entity).unwrap();
    let mut diagnostics = Diagnostics::new();
    let filters: Map<String, Value> = filters.as_object().cloned().unwrap();
    let out = FilterNormalizer::new(&registry, now()).normalize(entity, &filters, &mut diagnostics);
    (out, diagnostics)
}

fn primary_match(entity: &str, filters: Value) -> Value {
    let (out, _) = normalize(entity, filters);
    Value::Object(out.primary_match().unwrap_or_default())
}

// ============================================================================
// Value coercion
// ============================================================================

#[test_case(json!("true"), true ; "string true")]
#[test_case(json!("YES"), true ; "string yes")]
#[test_case(json!("on"), true ; "string on")]
#[test_case(json!(1), true ; "number one")]
#[test_case(json!("false"), false ; "string false")]
#[test_case(json!("no"), false ; "string no")]
#[test_case(json!("off"), false ; "string off")]
#[test_case(json!(0), false ; "number zero")]
fn test_bool_forms(raw: Value, expected: bool) {
    assert_eq!(coerce_bool(&raw), Ok(FilterPredicate::Boolean(expected)));
}

#[test_case(json!("maybe") ; "unknown word")]
#[test_case(json!(2) ; "other number")]
#[test_case(json!([true]) ; "list")]
fn test_bool_rejects(raw: Value) {
    assert!(coerce_bool(&raw).is_err());
}

#[test_case(json!(">1"), Comparison::Gt, 1 ; "greater")]
#[test_case(json!(">=2"), Comparison::Gte, 2 ; "greater or equal")]
#[test_case(json!("<3"), Comparison::Lt, 3 ; "less")]
#[test_case(json!("<=0"), Comparison::Lte, 0 ; "less or equal")]
#[test_case(json!("4"), Comparison::Eq, 4 ; "bare string")]
#[test_case(json!(5), Comparison::Eq, 5 ; "bare number")]
fn test_array_size_grammar(raw: Value, op: Comparison, size: i64) {
    assert_eq!(coerce_array_size(&raw), Ok(FilterPredicate::ArraySize { op, size }));
}

#[test_case(json!("> 1.5") ; "fractional")]
#[test_case(json!("-1") ; "negative")]
#[test_case(json!("many") ; "word")]
fn test_array_size_rejects(raw: Value) {
    assert!(coerce_array_size(&raw).is_err());
}

#[test]
fn test_text_escapes_metacharacters() {
    assert_eq!(
        coerce_text(&json!("a.b (c)")),
        Ok(FilterPredicate::Regex {
            pattern: r"a\.b \(c\)".into(),
            case_insensitive: true,
        })
    );
}

#[test]
fn test_text_prefix_and_alternation() {
    assert_eq!(
        coerce_text(&json!("Sim*")),
        Ok(FilterPredicate::Regex {
            pattern: "^Sim".into(),
            case_insensitive: true,
        })
    );
    assert_eq!(
        coerce_text(&json!(["Alpha", "Beta"])),
        Ok(FilterPredicate::Regex {
            pattern: "(Alpha|Beta)".into(),
            case_insensitive: true,
        })
    );
}

#[test]
fn test_text_membership_objects() {
    assert_eq!(
        coerce_text(&json!({ "not_in": ["Done"] })),
        Ok(FilterPredicate::NotIn(vec![json!("Done")]))
    );
    assert_eq!(
        coerce_text(&json!({ "$in": ["A", "B"] })),
        Ok(FilterPredicate::In(vec![json!("A"), json!("B")]))
    );
}

#[test]
fn test_number_equality_keeps_integers() {
    assert_eq!(coerce_number(&json!("8")), Ok(FilterPredicate::Equals(json!(8))));
    assert_eq!(coerce_number(&json!(2.5)), Ok(FilterPredicate::Equals(json!(2.5))));
}

#[test]
fn test_elem_match_rejects_operator_keys() {
    assert!(coerce_elem_match(&json!({ "$where": "1" })).is_err());
    assert!(coerce_elem_match(&json!({ "name": "Ann", "active": true })).is_ok());
    assert!(coerce_elem_match(&json!("name")).is_err());
}

// ============================================================================
// Key resolution
// ============================================================================

#[test]
fn test_alias_resolves_to_canonical_path() {
    assert_eq!(
        primary_match("workItem", json!({ "project": "Simpo" })),
        json!({ "project.name": { "$regex": "Simpo", "$options": "i" } })
    );
}

#[test]
fn test_unknown_key_is_dropped() {
    let (out, diagnostics) = normalize("workItem", json!({ "password": "x", "title": "login" }));
    let body = Value::Object(out.primary_match().unwrap());
    assert!(body.get("password").is_none());
    assert_eq!(body["title"], json!({ "$regex": "login", "$options": "i" }));
    assert!(diagnostics.has(DiagnosticKind::InvalidFilterKey));
}

#[test]
fn test_enum_values_are_canonicalized() {
    assert_eq!(
        primary_match("workItem", json!({ "priority": "high" })),
        json!({ "priority": "HIGH" })
    );
    assert_eq!(
        primary_match("workItem", json!({ "priority": ["urgent", "bogus", "HIGH"] })),
        json!({ "priority": { "$in": ["URGENT", "HIGH"] } })
    );
}

#[test]
fn test_enum_with_no_known_value_is_dropped() {
    let (out, diagnostics) = normalize("workItem", json!({ "priority": "blocker" }));
    assert!(out.is_empty());
    assert!(diagnostics.has(DiagnosticKind::InvalidFilterValue));
}

#[test]
fn test_boolean_field() {
    assert_eq!(
        primary_match("project", json!({ "active": "yes" })),
        json!({ "isActive": true })
    );
}

#[test]
fn test_array_count_compiles_to_size_expression() {
    assert_eq!(
        primary_match("workItem", json!({ "assignee_count": ">1" })),
        json!({
            "$expr": { "$gt": [{ "$size": { "$ifNull": ["$assignee", []] } }, 1] }
        })
    );
}

#[test]
fn test_plural_array_count() {
    assert_eq!(
        primary_match("workItem", json!({ "labels_count": 0 })),
        json!({
            "$expr": { "$eq": [{ "$size": { "$ifNull": ["$label", []] } }, 0] }
        })
    );
}

#[test]
fn test_two_counts_share_one_expr() {
    let body = primary_match("workItem", json!({ "assignee_count": ">=1", "label_count": "<3" }));
    assert_eq!(
        body["$expr"],
        json!({
            "$and": [
                { "$gte": [{ "$size": { "$ifNull": ["$assignee", []] } }, 1] },
                { "$lt": [{ "$size": { "$ifNull": ["$label", []] } }, 3] }
            ]
        })
    );
}

#[test]
fn test_elem_match_on_array() {
    assert_eq!(
        primary_match("workItem", json!({ "label_elemMatch": { "name": "bug", "color": "red" } })),
        json!({
            "label": {
                "$elemMatch": {
                    "name": { "$regex": "bug", "$options": "i" },
                    "color": { "$regex": "red", "$options": "i" }
                }
            }
        })
    );
}

#[test]
fn test_search_key_needs_text_index() {
    assert_eq!(
        primary_match("workItem", json!({ "search": "login bug" })),
        json!({ "$text": { "$search": "login bug" } })
    );

    let (out, diagnostics) = normalize("cycle", json!({ "search": "sprint" }));
    assert!(out.is_empty());
    assert!(diagnostics.has(DiagnosticKind::InvalidFilterKey));
}

#[test]
fn test_raw_allow_listed_path_is_exact() {
    assert_eq!(
        primary_match("workItem", json!({ "parent._id": "abc" })),
        json!({ "parent._id": "abc" })
    );
}

#[test]
fn test_relation_filter_becomes_joined() {
    let (out, diagnostics) = normalize("page", json!({ "cycle_name": "Sprint 4" }));
    assert!(diagnostics.is_empty());
    assert!(out.primary.is_empty());
    assert_eq!(out.joined_targets(), vec!["cycle"]);
    assert_eq!(out.joined[0].predicate.path, "name");
}

#[test]
fn test_relation_filter_on_own_entity_is_local() {
    assert_eq!(
        primary_match("cycle", json!({ "cycle_name": "Sprint 4" })),
        json!({ "name": { "$regex": "Sprint 4", "$options": "i" } })
    );
}

#[test]
fn test_embedded_field_beats_relation_filter() {
    let (out, _) = normalize("workItem", json!({ "cycle_name": "Sprint 4" }));
    assert!(out.joined.is_empty());
    assert_eq!(out.primary[0].path, "cycle.name");
}

#[test]
fn test_bad_value_drops_only_its_key() {
    let (out, diagnostics) = normalize("workItem", json!({ "estimate": "lots", "title": "x" }));
    assert_eq!(out.primary.len(), 1);
    assert_eq!(diagnostics.len(), 1);
    assert!(diagnostics.has(DiagnosticKind::InvalidFilterValue));
}

#[test]
fn test_numeric_range() {
    assert_eq!(
        primary_match("workItem", json!({ "estimate": ">=3" })),
        json!({ "estimate": { "$gte": 3.0 } })
    );
}
