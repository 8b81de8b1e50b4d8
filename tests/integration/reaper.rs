use std::process::Command;
use std::time::Duration;

use systemg_core::reaper::{ExitOutcome, Reaper};

#[test]
fn reaps_a_grandchild_orphaned_by_its_parent() {
    let reaper = Reaper::start().unwrap();

    // The immediate child forks a grandchild, then exits quickly, orphaning
    // the grandchild; the reaper's subreaper registration should adopt it
    // and still observe its eventual exit without anyone waiting on it
    // directly (we only assert the parent's own exit is observed here,
    // which would hang if the reap loop were wedged by the grandchild).
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg("(sleep 1 &) ; exit 3");
    let child = reaper.start_command(&mut cmd).unwrap();
    let outcome = child.wait();
    assert_eq!(outcome, ExitOutcome::Exited(3));
}

#[test]
fn multiple_concurrent_children_are_each_delivered_to_their_own_waiter() {
    let reaper = Reaper::start().unwrap();

    let mut children = Vec::new();
    for code in [1, 2, 3] {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("exit {code}"));
        children.push((code, reaper.start_command(&mut cmd).unwrap()));
    }

    for (code, child) in children {
        assert_eq!(child.wait(), ExitOutcome::Exited(code));
    }
}

#[test]
fn signaled_exit_is_reported_as_signaled() {
    let reaper = Reaper::start().unwrap();
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg("kill -TERM $$");
    let child = reaper.start_command(&mut cmd).unwrap();
    assert!(matches!(child.wait(), ExitOutcome::Signaled(_)));
    std::thread::sleep(Duration::from_millis(10));
}
