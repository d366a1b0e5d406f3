// tests/resolve/join_resolver_test.rs
use intentql::error::{DiagnosticKind, Diagnostics};
use intentql::registry::{JoinMechanism, Registry};
use intentql::resolve::{JoinPlan, JoinResolver};

fn resolve(
    primary: &str,
    paths: &[&str],
    joined: &[&str],
    group_by: &[&str],
) -> (JoinPlan, Diagnostics) {
    let registry = Registry::builtin().unwrap();
    let entity = registry.entity(primary).unwrap();
    let paths: Vec<String> = paths.iter().map(|s| s.to_string()).collect();
    let group_by: Vec<String> = group_by.iter().map(|s| s.to_string()).collect();
    let mut diagnostics = Diagnostics::new();
    let plan = JoinResolver::new(&registry).resolve(entity, &paths, joined, &group_by, &mut diagnostics);
    (plan, diagnostics)
}

fn aliases(plan: &JoinPlan) -> Vec<&str> {
    plan.joins.iter().map(|j| j.alias.as_str()).collect()
}

#[test]
fn test_requested_relation_keeps_array() {
    let (plan, diagnostics) = resolve("workItem", &["project"], &[], &[]);
    assert!(diagnostics.is_empty());
    assert_eq!(aliases(&plan), vec!["projectDoc"]);
    assert!(!plan.joins[0].unwind);
    assert_eq!(plan.requested, vec!["projectDoc".to_string()]);
    assert_eq!(plan.alias_for("project"), Some("projectDoc"));
}

#[test]
fn test_hop_named_by_target_entity() {
    let (plan, _) = resolve("workItem", &["members"], &[], &[]);
    assert_eq!(aliases(&plan), vec!["assignees"]);
}

#[test]
fn test_multi_hop_path_carries_prefix() {
    let (plan, _) = resolve("workItem", &["project.cycles"], &[], &[]);
    assert_eq!(aliases(&plan), vec!["projectDoc", "cycles"]);

    let parent = &plan.joins[0];
    assert!(parent.unwind);
    assert_eq!(parent.local_prefix, None);

    let child = &plan.joins[1];
    assert_eq!(child.local_prefix.as_deref(), Some("projectDoc"));
    assert_eq!(child.local_path("_id"), "projectDoc._id");
    assert!(!child.unwind);
    assert_eq!(plan.requested, vec!["cycles".to_string()]);
}

#[test]
fn test_group_through_hub_orders_parent_first() {
    let (plan, diagnostics) = resolve("cycle", &[], &[], &["module"]);
    assert!(diagnostics.is_empty());
    assert_eq!(aliases(&plan), vec!["projectDoc", "modules"]);
    assert!(plan.joins.iter().all(|j| j.unwind));
    assert_eq!(plan.joins[1].edge.source, "project");
    assert_eq!(plan.group_keys.len(), 1);
    assert_eq!(plan.group_keys[0].path, "modules.title");
}

#[test]
fn test_shared_hops_are_merged() {
    let (plan, _) = resolve("cycle", &["project"], &[], &["module"]);
    assert_eq!(aliases(&plan), vec!["projectDoc", "modules"]);
    // Grouping needs the parent flattened even though the path alone did not.
    assert!(plan.joins[0].unwind);
}

#[test]
fn test_embedded_group_key_needs_no_join() {
    let (plan, _) = resolve("workItem", &[], &[], &["assignee", "priority"]);
    assert!(plan.is_empty());
    let keys: Vec<(&str, &str, Option<&str>)> = plan
        .group_keys
        .iter()
        .map(|k| (k.token.as_str(), k.path.as_str(), k.unwind.as_deref()))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("assignee", "assignee.name", Some("assignee")),
            ("priority", "priority", None)
        ]
    );
}

#[test]
fn test_joined_filter_target_is_flattened() {
    let (plan, _) = resolve("workItem", &[], &["members"], &[]);
    assert_eq!(aliases(&plan), vec!["assignees"]);
    assert!(plan.joins[0].unwind);
    assert_eq!(plan.alias_for("members"), Some("assignees"));
    assert!(plan.requested.is_empty());
}

#[test]
fn test_indirect_edge_records_via() {
    let (plan, _) = resolve("members", &[], &["business"], &[]);
    assert_eq!(aliases(&plan), vec!["business"]);
    let join = &plan.joins[0];
    assert!(matches!(join.edge.join, JoinMechanism::Indirect { .. }));
    let via = join.via.as_ref().unwrap();
    assert_eq!(via.target, "project");
    assert!(!join.unwind);
}

#[test]
fn test_alias_collision_gets_parent_prefix() {
    let (plan, _) = resolve("workItem", &["modules", "project.modules"], &[], &[]);
    assert_eq!(
        aliases(&plan),
        vec!["modulesDoc", "projectDoc", "projectDoc_modulesDoc"]
    );
}

#[test]
fn test_unreachable_target() {
    let (plan, diagnostics) = resolve("business", &[], &["epic"], &[]);
    assert!(plan.is_empty());
    assert!(diagnostics.has(DiagnosticKind::UnresolvableRelation));
}

#[test]
fn test_unknown_group_token() {
    let (plan, diagnostics) = resolve("workItem", &[], &[], &["color"]);
    assert!(plan.group_keys.is_empty());
    assert!(diagnostics.has(DiagnosticKind::UnresolvedField));
}

#[test]
fn test_duplicate_group_tokens_collapse() {
    let (plan, _) = resolve("workItem", &[], &[], &["priority", "priority"]);
    assert_eq!(plan.group_keys.len(), 1);
}
