//! Combines layered YAML plan files into one validated [`Plan`], and
//! computes start/stop ordering and replan diffs against it.

pub mod layer;
pub mod load;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::constants::{
    DEFAULT_BACKOFF_DELAY, DEFAULT_BACKOFF_FACTOR, DEFAULT_BACKOFF_LIMIT, DEFAULT_KILL_DELAY,
};
use crate::error::PlanError;
use crate::identity::Identity;

pub use layer::{CheckEntry, Command, Layer, LogTargetEntry, Override, ServiceAction, Startup};

/// One service's fully combined, defaulted configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// The service's name (the map key it was combined under).
    pub name: String,
    /// The command to run.
    pub command: Command,
    /// Working directory, if not the supervisor's own.
    pub working_dir: Option<PathBuf>,
    /// Environment variables merged over the supervisor's own environment.
    pub environment: HashMap<String, String>,
    /// The identity to run the service's process as.
    pub identity: Identity,
    /// Whether this service starts automatically.
    pub startup: Startup,
    /// Services that must reach `Running` before this one starts.
    pub requires: Vec<String>,
    /// Services this one must start after, without requiring them.
    pub after: Vec<String>,
    /// Services this one must start before.
    pub before: Vec<String>,
    /// Action on a successful exit.
    pub on_success: ServiceAction,
    /// Action on a failing exit.
    pub on_failure: ServiceAction,
    /// Action per named check failure.
    pub on_check_failure: HashMap<String, ServiceAction>,
    /// Initial backoff delay.
    pub backoff_delay: Duration,
    /// Backoff growth factor.
    pub backoff_factor: f64,
    /// Backoff ceiling.
    pub backoff_limit: Duration,
    /// Delay before escalating SIGTERM to SIGKILL.
    pub kill_delay: Duration,
}

impl ServiceConfig {
    /// A stable content hash over every field except `name`, used to detect
    /// whether a service's configuration actually changed across a replan.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", self.command).as_bytes());
        hasher.update(format!("{:?}", self.working_dir).as_bytes());
        let mut env: Vec<_> = self.environment.iter().collect();
        env.sort();
        hasher.update(format!("{:?}", env).as_bytes());
        hasher.update(format!("{:?}", self.identity).as_bytes());
        hasher.update(format!("{:?}", self.startup).as_bytes());
        let mut requires = self.requires.clone();
        requires.sort();
        hasher.update(format!("{:?}", requires).as_bytes());
        let mut after = self.after.clone();
        after.sort();
        hasher.update(format!("{:?}", after).as_bytes());
        let mut before = self.before.clone();
        before.sort();
        hasher.update(format!("{:?}", before).as_bytes());
        hasher.update(format!("{:?}", self.on_success).as_bytes());
        hasher.update(format!("{:?}", self.on_failure).as_bytes());
        let mut checks: Vec<_> = self.on_check_failure.iter().collect();
        checks.sort();
        hasher.update(format!("{:?}", checks).as_bytes());
        hasher.update(self.backoff_delay.as_nanos().to_le_bytes());
        hasher.update(self.backoff_factor.to_le_bytes());
        hasher.update(self.backoff_limit.as_nanos().to_le_bytes());
        hasher.update(self.kill_delay.as_nanos().to_le_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut s = String::with_capacity(chars);
    for b in bytes {
        if s.len() >= chars {
            break;
        }
        s.push_str(&format!("{:02x}", b));
    }
    s.truncate(chars);
    s
}

/// One independent, internally-ordered chain of services to start or stop
/// together. Lanes with no dependency between them may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lane(pub Vec<String>);

/// The fully combined and validated plan.
#[derive(Debug, Clone)]
pub struct Plan {
    services: HashMap<String, ServiceConfig>,
    checks: HashMap<String, CheckEntry>,
    log_targets: HashMap<String, LogTargetEntry>,
    /// `requires`/`after` edges: predecessor -> set of successors.
    edges: HashMap<String, BTreeSet<String>>,
}

fn merge_entry(base: layer::ServiceEntry, new: layer::ServiceEntry) -> layer::ServiceEntry {
    layer::ServiceEntry {
        override_mode: new.override_mode,
        command: if !new.command.base.is_empty() {
            new.command
        } else {
            base.command
        },
        working_dir: new.working_dir.or(base.working_dir),
        environment: {
            let mut e = base.environment;
            e.extend(new.environment);
            e
        },
        identity: new.identity.or(base.identity),
        workload: new.workload.or(base.workload),
        startup: new.startup.or(base.startup),
        requires: if !new.requires.is_empty() {
            new.requires
        } else {
            base.requires
        },
        after: if !new.after.is_empty() { new.after } else { base.after },
        before: if !new.before.is_empty() {
            new.before
        } else {
            base.before
        },
        on_success: if new.on_success != ServiceAction::Unset {
            new.on_success
        } else {
            base.on_success
        },
        on_failure: if new.on_failure != ServiceAction::Unset {
            new.on_failure
        } else {
            base.on_failure
        },
        on_check_failure: {
            let mut m = base.on_check_failure;
            m.extend(new.on_check_failure);
            m
        },
        backoff_delay_secs: new.backoff_delay_secs.or(base.backoff_delay_secs),
        backoff_factor: new.backoff_factor.or(base.backoff_factor),
        backoff_limit_secs: new.backoff_limit_secs.or(base.backoff_limit_secs),
        kill_delay_secs: new.kill_delay_secs.or(base.kill_delay_secs),
    }
}

impl Plan {
    /// Folds a sequence of layers, left to right, into one validated plan.
    pub fn combine(layers: &[Layer]) -> Result<Plan, PlanError> {
        let mut accum: HashMap<String, layer::ServiceEntry> = HashMap::new();
        let mut checks: HashMap<String, CheckEntry> = HashMap::new();
        let mut log_targets: HashMap<String, LogTargetEntry> = HashMap::new();
        let mut workloads: HashMap<String, layer::WorkloadEntry> = HashMap::new();

        for layer in layers {
            for (name, entry) in &layer.services {
                match accum.get(name) {
                    None => {
                        accum.insert(name.clone(), entry.clone());
                    }
                    Some(existing) => {
                        let mode = entry
                            .override_mode
                            .ok_or_else(|| PlanError::MissingOverride(name.clone()))?;
                        let combined = match mode {
                            Override::Replace => entry.clone(),
                            Override::Merge => merge_entry(existing.clone(), entry.clone()),
                        };
                        accum.insert(name.clone(), combined);
                    }
                }
            }
            for (name, entry) in &layer.checks {
                match (checks.get(name), entry.override_mode) {
                    (Some(_), None) => return Err(PlanError::MissingOverride(name.clone())),
                    _ => {
                        checks.insert(name.clone(), entry.clone());
                    }
                }
            }
            for (name, entry) in &layer.log_targets {
                match (log_targets.get(name), entry.override_mode) {
                    (Some(_), None) => return Err(PlanError::MissingOverride(name.clone())),
                    _ => {
                        log_targets.insert(name.clone(), entry.clone());
                    }
                }
            }
            for (name, entry) in &layer.workloads {
                workloads.insert(name.clone(), entry.clone());
            }
        }

        let mut services = HashMap::new();
        for (name, entry) in accum {
            let mut environment = entry.environment.clone();
            let mut identity = entry.identity.clone();
            if let Some(workload_name) = &entry.workload {
                let workload = workloads.get(workload_name).ok_or_else(|| {
                    PlanError::UnknownWorkload {
                        service: name.clone(),
                        workload: workload_name.clone(),
                    }
                })?;
                let mut merged_env = workload.environment.clone();
                merged_env.extend(environment);
                environment = merged_env;
                if identity.is_none() {
                    identity = workload.identity.clone();
                }
            }

            services.insert(
                name.clone(),
                ServiceConfig {
                    name: name.clone(),
                    command: entry.command,
                    working_dir: entry.working_dir.map(PathBuf::from),
                    environment,
                    identity: identity.unwrap_or_default(),
                    startup: entry.startup.unwrap_or_default(),
                    requires: entry.requires,
                    after: entry.after,
                    before: entry.before,
                    on_success: entry.on_success,
                    on_failure: entry.on_failure,
                    on_check_failure: entry.on_check_failure,
                    backoff_delay: entry
                        .backoff_delay_secs
                        .map(Duration::from_secs_f64)
                        .unwrap_or(DEFAULT_BACKOFF_DELAY),
                    backoff_factor: entry.backoff_factor.unwrap_or(DEFAULT_BACKOFF_FACTOR),
                    backoff_limit: entry
                        .backoff_limit_secs
                        .map(Duration::from_secs_f64)
                        .unwrap_or(DEFAULT_BACKOFF_LIMIT),
                    kill_delay: entry
                        .kill_delay_secs
                        .map(Duration::from_secs_f64)
                        .unwrap_or(DEFAULT_KILL_DELAY),
                },
            );
        }

        let edges = build_edges(&services)?;

        let plan = Plan {
            services,
            checks,
            log_targets,
            edges,
        };
        plan.validate_check_refs()?;
        Ok(plan)
    }

    fn validate_check_refs(&self) -> Result<(), PlanError> {
        for svc in self.services.values() {
            for check in svc.on_check_failure.keys() {
                if !self.checks.contains_key(check) {
                    return Err(PlanError::UnknownDependency {
                        service: svc.name.clone(),
                        dependency: check.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// All combined service configurations, keyed by name.
    pub fn services(&self) -> &HashMap<String, ServiceConfig> {
        &self.services
    }

    /// All combined check shapes, keyed by name.
    pub fn checks(&self) -> &HashMap<String, CheckEntry> {
        &self.checks
    }

    /// All combined log target shapes, keyed by name.
    pub fn log_targets(&self) -> &HashMap<String, LogTargetEntry> {
        &self.log_targets
    }

    /// Computes start order: dependency predecessors before successors,
    /// partitioned into independent lanes, each internally ordered and
    /// alphabetically tie-broken. `names` is first expanded to its
    /// transitive `requires` closure, since `requires` only pulls services
    /// in; ordering itself comes solely from `after`/`before`.
    pub fn start_order(&self, names: &[String]) -> Result<Vec<Lane>, PlanError> {
        let expanded = self.requires_closure(names);
        order_lanes(&self.edges, &expanded, false)
    }

    /// Computes stop order: the reverse of `start_order`, both across and
    /// within lanes.
    pub fn stop_order(&self, names: &[String]) -> Result<Vec<Lane>, PlanError> {
        let expanded = self.requires_closure(names);
        order_lanes(&self.edges, &expanded, true)
    }

    /// Expands `names` to include every service transitively `requires`d by
    /// them. `requires` contributes no ordering edge of its own (that's
    /// `after`/`before`'s job) - it only determines which services a start
    /// or stop of `names` must pull in.
    fn requires_closure(&self, names: &[String]) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = names.iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(svc) = self.services.get(&name) {
                for dep in &svc.requires {
                    if !seen.contains(dep) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Diffs this plan (the "old" plan) against `new`, returning which
    /// currently-running services are unchanged and which lanes must be
    /// stopped and (re)started to converge on `new`.
    pub fn replan(&self, new: &Plan, running: &[String]) -> ReplanOutcome {
        let mut unchanged = Vec::new();
        let mut changed_or_removed = Vec::new();

        for name in running {
            match (self.services.get(name), new.services.get(name)) {
                (Some(old_cfg), Some(new_cfg)) if old_cfg.compute_hash() == new_cfg.compute_hash() => {
                    unchanged.push(name.clone());
                }
                _ => changed_or_removed.push(name.clone()),
            }
        }

        let mut to_start: Vec<String> = new
            .services
            .keys()
            .filter(|n| !unchanged.contains(n))
            .cloned()
            .collect();
        to_start.sort();

        let stop_lanes = self.stop_order(&changed_or_removed).unwrap_or_default();
        let start_lanes = new.start_order(&to_start).unwrap_or_default();

        ReplanOutcome {
            unchanged,
            stop_lanes,
            start_lanes,
        }
    }
}

/// The result of diffing two plans (spec §4.2 "Replan").
#[derive(Debug, Clone, Default)]
pub struct ReplanOutcome {
    /// Currently-running services whose configuration did not change.
    pub unchanged: Vec<String>,
    /// Lanes of services to stop, in stop order.
    pub stop_lanes: Vec<Lane>,
    /// Lanes of services to start, in start order.
    pub start_lanes: Vec<Lane>,
}

/// Builds the ordering graph from `after`/`before` edges only. `requires`
/// is validated here (an unknown `requires` target is still an error) but
/// contributes no edge: per spec §4.1 it only expands which services a
/// start/stop of a given set pulls in (see `requires_closure`), never their
/// relative order.
fn build_edges(
    services: &HashMap<String, ServiceConfig>,
) -> Result<HashMap<String, BTreeSet<String>>, PlanError> {
    let mut edges: HashMap<String, BTreeSet<String>> = HashMap::new();
    for name in services.keys() {
        edges.entry(name.clone()).or_default();
    }
    for (name, svc) in services {
        for dep in &svc.requires {
            if !services.contains_key(dep) {
                return Err(PlanError::UnknownDependency {
                    service: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        for dep in &svc.after {
            if !services.contains_key(dep) {
                return Err(PlanError::UnknownDependency {
                    service: name.clone(),
                    dependency: dep.clone(),
                });
            }
            edges.entry(dep.clone()).or_default().insert(name.clone());
        }
        for dep in &svc.before {
            if !services.contains_key(dep) {
                return Err(PlanError::UnknownDependency {
                    service: name.clone(),
                    dependency: dep.clone(),
                });
            }
            edges.entry(name.clone()).or_default().insert(dep.clone());
        }
    }
    Ok(edges)
}

/// Computes a topological order over `names` restricted to the subgraph
/// they induce, partitioned into weakly-connected-component lanes, each
/// internally ordered via Kahn's algorithm with an alphabetically-sorted
/// frontier for determinism. `reverse` flips edge direction and reverses
/// each lane's resulting order (used for stop ordering).
fn order_lanes(
    edges: &HashMap<String, BTreeSet<String>>,
    names: &[String],
    reverse: bool,
) -> Result<Vec<Lane>, PlanError> {
    let wanted: HashSet<&String> = names.iter().collect();

    let mut succ: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut pred: HashMap<String, BTreeSet<String>> = HashMap::new();
    for name in names {
        succ.entry(name.clone()).or_default();
        pred.entry(name.clone()).or_default();
    }
    for (from, tos) in edges {
        if !wanted.contains(from) {
            continue;
        }
        for to in tos {
            if !wanted.contains(to) {
                continue;
            }
            succ.get_mut(from).unwrap().insert(to.clone());
            pred.get_mut(to).unwrap().insert(from.clone());
        }
    }
    if reverse {
        std::mem::swap(&mut succ, &mut pred);
    }

    // weakly connected components over the undirected union of edges
    let mut undirected: HashMap<String, BTreeSet<String>> = HashMap::new();
    for name in names {
        undirected.entry(name.clone()).or_default();
    }
    for (a, bs) in &succ {
        for b in bs {
            undirected.get_mut(a).unwrap().insert(b.clone());
            undirected.get_mut(b).unwrap().insert(a.clone());
        }
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut components: Vec<BTreeSet<String>> = Vec::new();
    let mut sorted_names = names.to_vec();
    sorted_names.sort();
    for name in &sorted_names {
        if visited.contains(name) {
            continue;
        }
        let mut component = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(name.clone());
        visited.insert(name.clone());
        while let Some(n) = queue.pop_front() {
            component.insert(n.clone());
            for neighbor in &undirected[&n] {
                if visited.insert(neighbor.clone()) {
                    queue.push_back(neighbor.clone());
                }
            }
        }
        components.push(component);
    }

    let mut lanes = Vec::new();
    for component in components {
        let mut indegree: HashMap<String, usize> = component
            .iter()
            .map(|n| (n.clone(), pred[n].iter().filter(|p| component.contains(*p)).count()))
            .collect();
        let mut frontier: BTreeSet<String> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| n.clone())
            .collect();
        let mut order = Vec::new();
        while let Some(next) = frontier.iter().next().cloned() {
            frontier.remove(&next);
            order.push(next.clone());
            for successor in succ[&next].iter().filter(|s| component.contains(*s)) {
                let d = indegree.get_mut(successor).unwrap();
                *d -= 1;
                if *d == 0 {
                    frontier.insert(successor.clone());
                }
            }
        }
        if order.len() != component.len() {
            let remaining: Vec<String> = component
                .into_iter()
                .filter(|n| !order.contains(n))
                .collect();
            return Err(PlanError::DependencyCycle {
                cycle: remaining.join(", "),
            });
        }
        lanes.push(Lane(order));
    }

    lanes.sort_by(|a, b| a.0.first().cmp(&b.0.first()));
    Ok(lanes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_yaml(s: &str) -> Layer {
        Layer::parse_yaml(s).unwrap()
    }

    #[test]
    fn single_layer_combines() {
        let l = layer_yaml(
            r#"
services:
  web:
    command: { base: ["nginx"] }
  db:
    command: { base: ["postgres"] }
    requires: ["web"]
"#,
        );
        let plan = Plan::combine(&[l]).unwrap();
        assert_eq!(plan.services().len(), 2);
    }

    #[test]
    fn merge_requires_override_on_second_layer() {
        let l1 = layer_yaml("services:\n  web:\n    command: { base: [\"nginx\"] }\n");
        let l2 = layer_yaml("services:\n  web:\n    command: { base: [\"caddy\"] }\n");
        let err = Plan::combine(&[l1, l2]).unwrap_err();
        assert!(matches!(err, PlanError::MissingOverride(_)));
    }

    #[test]
    fn merge_unions_environment() {
        let l1 = layer_yaml(
            "services:\n  web:\n    command: { base: [\"nginx\"] }\n    environment: { A: \"1\" }\n",
        );
        let l2 = layer_yaml(
            "services:\n  web:\n    override: merge\n    environment: { B: \"2\" }\n",
        );
        let plan = Plan::combine(&[l1, l2]).unwrap();
        let web = &plan.services()["web"];
        assert_eq!(web.environment.get("A").unwrap(), "1");
        assert_eq!(web.environment.get("B").unwrap(), "2");
        assert_eq!(web.command.base, vec!["nginx"]);
    }

    #[test]
    fn replace_drops_earlier_fields() {
        let l1 = layer_yaml(
            "services:\n  web:\n    command: { base: [\"nginx\"] }\n    environment: { A: \"1\" }\n",
        );
        let l2 = layer_yaml(
            "services:\n  web:\n    override: replace\n    command: { base: [\"caddy\"] }\n",
        );
        let plan = Plan::combine(&[l1, l2]).unwrap();
        let web = &plan.services()["web"];
        assert_eq!(web.command.base, vec!["caddy"]);
        assert!(web.environment.is_empty());
    }

    #[test]
    fn start_order_respects_after() {
        let l = layer_yaml(
            r#"
services:
  db:
    command: { base: ["postgres"] }
  web:
    command: { base: ["nginx"] }
    after: ["db"]
"#,
        );
        let plan = Plan::combine(&[l]).unwrap();
        let names: Vec<String> = plan.services().keys().cloned().collect();
        let lanes = plan.start_order(&names).unwrap();
        let flat: Vec<&String> = lanes.iter().flat_map(|l| l.0.iter()).collect();
        let db_pos = flat.iter().position(|n| **n == "db").unwrap();
        let web_pos = flat.iter().position(|n| **n == "web").unwrap();
        assert!(db_pos < web_pos);
    }

    #[test]
    fn requires_pulls_in_dependency_without_ordering_it() {
        let l = layer_yaml(
            r#"
services:
  db:
    command: { base: ["postgres"] }
  web:
    command: { base: ["nginx"] }
    requires: ["db"]
"#,
        );
        let plan = Plan::combine(&[l]).unwrap();
        let lanes = plan.start_order(&["web".to_string()]).unwrap();
        let flat: Vec<&String> = lanes.iter().flat_map(|l| l.0.iter()).collect();
        assert!(flat.contains(&&"db".to_string()));
        assert!(flat.contains(&&"web".to_string()));
    }

    #[test]
    fn requires_and_before_combine_without_forming_a_cycle() {
        // t1 requires t2, and t1 must start before t2: requires only pulls
        // t2 in, `before` alone decides the order, so start order is
        // [t1, t2] rather than a cycle.
        let l = layer_yaml(
            r#"
services:
  t1:
    command: { base: ["true"] }
    requires: ["t2"]
    before: ["t2"]
  t2:
    command: { base: ["true"] }
"#,
        );
        let plan = Plan::combine(&[l]).unwrap();
        let lanes = plan.start_order(&["t1".to_string()]).unwrap();
        let flat: Vec<&String> = lanes.iter().flat_map(|l| l.0.iter()).collect();
        assert_eq!(flat, vec![&"t1".to_string(), &"t2".to_string()]);

        let stop_lanes = plan.stop_order(&["t1".to_string()]).unwrap();
        let stop_flat: Vec<&String> = stop_lanes.iter().flat_map(|l| l.0.iter()).collect();
        assert_eq!(stop_flat, vec![&"t2".to_string(), &"t1".to_string()]);
    }

    #[test]
    fn independent_services_form_separate_lanes() {
        let l = layer_yaml(
            r#"
services:
  a:
    command: { base: ["true"] }
  b:
    command: { base: ["true"] }
"#,
        );
        let plan = Plan::combine(&[l]).unwrap();
        let names: Vec<String> = plan.services().keys().cloned().collect();
        let lanes = plan.start_order(&names).unwrap();
        assert_eq!(lanes.len(), 2);
    }

    #[test]
    fn cycle_is_detected() {
        let l = layer_yaml(
            r#"
services:
  a:
    command: { base: ["true"] }
    after: ["b"]
  b:
    command: { base: ["true"] }
    after: ["a"]
"#,
        );
        let plan = Plan::combine(&[l]).unwrap();
        let names: Vec<String> = plan.services().keys().cloned().collect();
        let err = plan.start_order(&names).unwrap_err();
        assert!(matches!(err, PlanError::DependencyCycle { .. }));
    }

    #[test]
    fn stop_order_reverses_start_order() {
        let l = layer_yaml(
            r#"
services:
  db:
    command: { base: ["postgres"] }
  web:
    command: { base: ["nginx"] }
    after: ["db"]
"#,
        );
        let plan = Plan::combine(&[l]).unwrap();
        let names: Vec<String> = plan.services().keys().cloned().collect();
        let lanes = plan.stop_order(&names).unwrap();
        let flat: Vec<&String> = lanes.iter().flat_map(|l| l.0.iter()).collect();
        let db_pos = flat.iter().position(|n| **n == "db").unwrap();
        let web_pos = flat.iter().position(|n| **n == "web").unwrap();
        assert!(web_pos < db_pos);
    }

    #[test]
    fn replan_detects_unchanged_services() {
        let l = layer_yaml("services:\n  web:\n    command: { base: [\"nginx\"] }\n");
        let old = Plan::combine(&[l.clone()]).unwrap();
        let new = Plan::combine(&[l]).unwrap();
        let outcome = old.replan(&new, &["web".to_string()]);
        assert_eq!(outcome.unchanged, vec!["web".to_string()]);
        assert!(outcome.stop_lanes.is_empty());
    }

    #[test]
    fn replan_restarts_changed_services() {
        let l1 = layer_yaml("services:\n  web:\n    command: { base: [\"nginx\"] }\n");
        let l2 = layer_yaml("services:\n  web:\n    command: { base: [\"caddy\"] }\n");
        let old = Plan::combine(&[l1]).unwrap();
        let new = Plan::combine(&[l2]).unwrap();
        let outcome = old.replan(&new, &["web".to_string()]);
        assert!(outcome.unchanged.is_empty());
        assert_eq!(outcome.stop_lanes.len(), 1);
        assert_eq!(outcome.start_lanes.len(), 1);
    }
}
