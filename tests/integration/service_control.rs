use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use systemg_core::overlord::{LoggingRestarter, Overlord};
use systemg_core::plan::{Layer, Plan};
use systemg_core::service::ServiceStatus;
use tempfile::tempdir;

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn two_services_start_in_dependency_order() {
    let temp = tempdir().unwrap();
    let db_marker = temp.path().join("db.marker");
    let web_marker = temp.path().join("web.marker");

    let yaml = format!(
        r#"
services:
  db:
    command: {{ base: ["sh", "-c", "touch {} && sleep 5"] }}
  web:
    command: {{ base: ["sh", "-c", "touch {} && sleep 5"] }}
    requires: ["db"]
    after: ["db"]
"#,
        db_marker.display(),
        web_marker.display(),
    );
    let layer = Layer::parse_yaml(&yaml).unwrap();
    let plan = Plan::combine(&[layer]).unwrap();

    let state_path = temp.path().join("state.json");
    let overlord = Overlord::boot(plan, state_path, Arc::new(LoggingRestarter)).unwrap();

    assert!(wait_until(|| db_marker.exists(), Duration::from_secs(2)));
    assert!(wait_until(|| web_marker.exists(), Duration::from_secs(2)));

    assert!(wait_until(
        || overlord.service_manager().status("db") == Some(ServiceStatus::Active),
        Duration::from_secs(2)
    ));
    assert!(wait_until(
        || overlord.service_manager().status("web") == Some(ServiceStatus::Active),
        Duration::from_secs(2)
    ));

    overlord.shutdown();
}

#[test]
fn stop_then_start_service_round_trips() {
    let temp = tempdir().unwrap();
    let yaml = r#"
services:
  solo:
    command: { base: ["sleep", "30"] }
"#;
    let layer = Layer::parse_yaml(yaml).unwrap();
    let plan = Plan::combine(&[layer]).unwrap();

    let state_path = temp.path().join("state.json");
    let overlord = Overlord::boot(plan, state_path, Arc::new(LoggingRestarter)).unwrap();

    assert!(wait_until(
        || overlord.service_manager().status("solo") == Some(ServiceStatus::Active),
        Duration::from_secs(2)
    ));

    overlord.service_manager().stop("solo").unwrap();
    assert!(wait_until(
        || overlord.service_manager().status("solo") == Some(ServiceStatus::Inactive),
        Duration::from_secs(8)
    ));

    overlord.service_manager().start("solo").unwrap();
    assert!(wait_until(
        || overlord.service_manager().status("solo") == Some(ServiceStatus::Active),
        Duration::from_secs(2)
    ));

    overlord.shutdown();
}

#[test]
fn sigterm_ignoring_service_escalates_to_sigkill() {
    let temp = tempdir().unwrap();
    let marker = temp.path().join("trapped.marker");

    let yaml = format!(
        r#"
services:
  stubborn:
    command: {{ base: ["sh", "-c", "trap '' TERM; touch {}; while true; do sleep 1; done"] }}
    kill_delay_secs: 0.2
"#,
        marker.display()
    );
    let layer = Layer::parse_yaml(&yaml).unwrap();
    let plan = Plan::combine(&[layer]).unwrap();

    let state_path = temp.path().join("state.json");
    let overlord = Overlord::boot(plan, state_path, Arc::new(LoggingRestarter)).unwrap();

    assert!(wait_until(|| marker.exists(), Duration::from_secs(2)));

    overlord.service_manager().stop("stubborn").unwrap();
    // SIGTERM is trapped; the manager must escalate through kill-delay and
    // fail-delay and eventually mark the service stopped.
    assert!(wait_until(
        || overlord.service_manager().status("stubborn") == Some(ServiceStatus::Inactive),
        Duration::from_secs(10)
    ));

    overlord.shutdown();
}

#[test]
fn exit_with_restart_action_restarts_under_backoff() {
    let temp = tempdir().unwrap();
    let counter_file = temp.path().join("count");
    fs::write(&counter_file, "0").unwrap();

    let yaml = format!(
        r#"
services:
  flappy:
    command: {{ base: ["sh", "-c", "n=$(cat {0}); echo $((n+1)) > {0}; exit 1"] }}
    on_failure: restart
    backoff_delay_secs: 0.05
    backoff_limit_secs: 0.2
"#,
        counter_file.display()
    );
    let layer = Layer::parse_yaml(&yaml).unwrap();
    let plan = Plan::combine(&[layer]).unwrap();

    let state_path = temp.path().join("state.json");
    let overlord = Overlord::boot(plan, state_path, Arc::new(LoggingRestarter)).unwrap();

    assert!(wait_until(
        || fs::read_to_string(&counter_file).map(|s| s.trim().parse::<u32>().unwrap_or(0) >= 3).unwrap_or(false),
        Duration::from_secs(5)
    ));

    overlord.shutdown();
}
