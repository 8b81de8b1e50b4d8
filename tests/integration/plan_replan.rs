use systemg_core::plan::{Layer, Plan};

#[test]
fn replan_stops_changed_and_starts_new_in_dependency_order() {
    let old_yaml = r#"
services:
  db:
    command: { base: ["postgres"] }
  web:
    command: { base: ["nginx"] }
    requires: ["db"]
"#;
    let old_layer = Layer::parse_yaml(old_yaml).unwrap();
    let old_plan = Plan::combine(&[old_layer]).unwrap();

    let new_yaml = r#"
services:
  db:
    command: { base: ["postgres"] }
  web:
    command: { base: ["caddy"] }
    requires: ["db"]
  worker:
    command: { base: ["worker-bin"] }
    requires: ["db"]
"#;
    let new_layer = Layer::parse_yaml(new_yaml).unwrap();
    let new_plan = Plan::combine(&[new_layer]).unwrap();

    let running = vec!["db".to_string(), "web".to_string()];
    let outcome = old_plan.replan(&new_plan, &running);

    assert_eq!(outcome.unchanged, vec!["db".to_string()]);

    let stopped: Vec<&String> = outcome.stop_lanes.iter().flat_map(|l| l.0.iter()).collect();
    assert_eq!(stopped, vec!["web"]);

    let started: Vec<&String> = outcome.start_lanes.iter().flat_map(|l| l.0.iter()).collect();
    assert!(started.contains(&&"web".to_string()));
    assert!(started.contains(&&"worker".to_string()));
    let web_pos = started.iter().position(|n| **n == "web").unwrap();
    let worker_pos = started.iter().position(|n| **n == "worker").unwrap();
    let _ = (web_pos, worker_pos); // both depend only on db, independent lanes
}

#[test]
fn merge_is_associative_across_layer_grouping() {
    let l1 = Layer::parse_yaml(
        "services:\n  web:\n    command: { base: [\"nginx\"] }\n    environment: { A: \"1\" }\n",
    )
    .unwrap();
    let l2 = Layer::parse_yaml(
        "services:\n  web:\n    override: merge\n    environment: { B: \"2\" }\n",
    )
    .unwrap();
    let l3 = Layer::parse_yaml(
        "services:\n  web:\n    override: merge\n    environment: { C: \"3\" }\n",
    )
    .unwrap();

    let folded_individually = Plan::combine(&[l1.clone(), l2.clone(), l3.clone()]).unwrap();
    let sequential = Plan::combine(&[l1, l2, l3]).unwrap();

    let a = &folded_individually.services()["web"].environment;
    let b = &sequential.services()["web"].environment;
    assert_eq!(a, b);
    assert_eq!(a.len(), 3);
}

#[test]
fn missing_override_on_repeated_service_is_rejected() {
    let l1 = Layer::parse_yaml("services:\n  web:\n    command: { base: [\"nginx\"] }\n").unwrap();
    let l2 = Layer::parse_yaml("services:\n  web:\n    command: { base: [\"caddy\"] }\n").unwrap();
    assert!(Plan::combine(&[l1, l2]).is_err());
}
