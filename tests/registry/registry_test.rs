// tests/registry/registry_test.rs
use intentql::registry::{Cardinality, FieldKind, JoinMechanism, MeasureSpec, Registry};

fn registry() -> Registry {
    Registry::builtin().unwrap()
}

#[test]
fn test_builtin_loads_every_entity() {
    let registry = registry();
    assert_eq!(registry.version(), 1);
    assert_eq!(registry.default_entity(), "workItem");
    assert_eq!(registry.hub_entity(), "project");
    assert_eq!(
        registry.entity_names(),
        vec!["business", "cycle", "epic", "members", "module", "page", "project", "workItem", "worklog"]
    );
}

#[test]
fn test_entity_lookup_is_case_insensitive() {
    let registry = registry();
    assert_eq!(registry.entity("workitem").unwrap().name, "workItem");
    assert_eq!(registry.entity("PROJECT").unwrap().name, "project");
    assert!(registry.entity("spaceship").is_none());
}

#[test]
fn test_entity_by_collection() {
    let registry = registry();
    assert_eq!(registry.entity_by_collection("workLog").unwrap().name, "worklog");
    assert!(registry.entity_by_collection("worklog").is_none());
}

#[test]
fn test_resolve_alias_through_field_table() {
    let registry = registry();
    assert_eq!(
        registry.resolve_alias("workItem", "project").as_deref(),
        Some("project.name")
    );
    assert_eq!(
        registry.resolve_alias("workItem", "status").as_deref(),
        Some("state.name")
    );
    assert_eq!(
        registry.resolve_alias("workItem", "parent._id").as_deref(),
        Some("parent._id")
    );
    assert!(registry.resolve_alias("workItem", "password").is_none());
}

#[test]
fn test_allow_list_is_per_entity() {
    let registry = registry();
    assert!(registry.is_allowed_field("workItem", "estimate"));
    assert!(!registry.is_allowed_field("project", "estimate"));
    assert!(!registry.is_allowed_field("nowhere", "name"));
}

#[test]
fn test_priority_vocab_is_ranked() {
    let registry = registry();
    let vocab = registry.vocab("priority").unwrap();
    assert!(vocab.ranked);
    assert_eq!(vocab.canonical("urgent"), Some("URGENT"));
    assert_eq!(vocab.rank("URGENT"), Some(5));
    assert_eq!(vocab.rank("NONE"), Some(1));
    assert_eq!(vocab.rank("BLOCKER"), None);
}

#[test]
fn test_enum_canonical_ignores_separators() {
    let registry = registry();
    let vocab = registry.vocab("project_status").unwrap();
    assert_eq!(vocab.canonical("not started"), Some("NOT_STARTED"));
    assert_eq!(vocab.canonical("Not-Started"), Some("NOT_STARTED"));
}

#[test]
fn test_field_kinds() {
    let registry = registry();
    let work_item = registry.entity("workItem").unwrap();
    assert_eq!(
        work_item.mapping("priority").unwrap().kind,
        FieldKind::Enum {
            vocab: "priority".into()
        }
    );
    assert!(work_item.mapping("created").unwrap().kind.is_date());
    assert_eq!(work_item.mapping("estimate").unwrap().kind, FieldKind::Number);
}

#[test]
fn test_worklog_declares_duration_measure() {
    let registry = registry();
    let worklog = registry.entity("worklog").unwrap();
    match worklog.measure.as_ref().unwrap() {
        MeasureSpec::Duration {
            name,
            hours_field,
            minutes_field,
        } => {
            assert_eq!(name, "totalHours");
            assert_eq!(hours_field, "hours");
            assert_eq!(minutes_field, "mins");
        }
        other => panic!("unexpected measure {:?}", other),
    }
}

#[test]
fn test_direct_route() {
    let registry = registry();
    let route = registry.route("workItem", "cycle").unwrap();
    assert_eq!(route.len(), 1);
    assert_eq!(route[0].name, "cycle");
    assert_eq!(route[0].cardinality, Cardinality::One);
}

#[test]
fn test_route_through_hub() {
    let registry = registry();
    let route = registry.route("cycle", "module").unwrap();
    let hops: Vec<(&str, &str)> = route
        .iter()
        .map(|e| (e.source.as_str(), e.name.as_str()))
        .collect();
    assert_eq!(hops, vec![("cycle", "project"), ("project", "modules")]);
}

#[test]
fn test_no_route_to_self_or_unreachable() {
    let registry = registry();
    assert!(registry.route("workItem", "workItem").is_none());
    assert!(registry.route("business", "epic").is_none());
}

#[test]
fn test_indirect_edge() {
    let registry = registry();
    let edge = registry.edge("members", "business").unwrap();
    assert!(edge.is_indirect());
    match &edge.join {
        JoinMechanism::Indirect {
            via_entity,
            path,
            foreign_field,
        } => {
            assert_eq!(via_entity, "project");
            assert_eq!(path, "business._id");
            assert_eq!(foreign_field, "_id");
        }
        other => panic!("unexpected join {:?}", other),
    }
}

#[test]
fn test_relation_filters_and_group_targets() {
    let registry = registry();
    let filter = registry.relation_filter("member_role").unwrap();
    assert_eq!(filter.target, "members");
    assert_eq!(filter.field, "role");
    assert_eq!(registry.group_target("assignee"), Some("members"));
    assert_eq!(registry.group_target("priority"), None);
}

#[test]
fn test_graph_counts_match_declarations() {
    let registry = registry();
    let declared: usize = registry
        .entity_names()
        .iter()
        .map(|name| registry.entity(name).unwrap().relations.len())
        .sum();
    assert_eq!(registry.graph().node_count(), 9);
    assert_eq!(registry.graph().edge_count(), declared);
}
