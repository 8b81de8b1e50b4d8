use std::collections::HashMap;
use std::time::{Duration, Instant};

use systemg_core::state::{NoticeFilter, NoticeKind, State};

#[test]
fn repeated_notices_dedupe_within_the_repeat_window() {
    let state = State::new();
    for _ in 0..5 {
        state.add_notice(
            NoticeKind::Warning,
            "disk-full",
            HashMap::new(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
    }
    let notices = state.notices(&NoticeFilter {
        kind: Some(NoticeKind::Warning),
        ..Default::default()
    });
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].occurrences, 5);
}

#[test]
fn distinct_keys_produce_distinct_notices() {
    let state = State::new();
    state.add_notice(
        NoticeKind::Custom,
        "a",
        HashMap::new(),
        Duration::from_secs(1),
        Duration::from_secs(60),
    );
    state.add_notice(
        NoticeKind::Custom,
        "b",
        HashMap::new(),
        Duration::from_secs(1),
        Duration::from_secs(60),
    );
    assert_eq!(state.notices(&NoticeFilter::default()).len(), 2);
}

#[test]
fn waiter_is_woken_by_a_notice_added_from_another_thread() {
    let state = std::sync::Arc::new(State::new());
    let state2 = std::sync::Arc::clone(&state);

    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        state2.add_notice(
            NoticeKind::Custom,
            "async-event",
            HashMap::new(),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    let got = state.wait_notices(
        NoticeFilter {
            key: Some("async-event".to_string()),
            ..Default::default()
        },
        Some(deadline),
    );
    handle.join().unwrap();

    assert_eq!(got.len(), 1);
    assert_eq!(got[0].key, "async-event");
}

#[test]
fn prune_drops_old_expired_notices_but_keeps_fresh_ones() {
    let state = State::new();
    state.add_notice(
        NoticeKind::Custom,
        "stale",
        HashMap::new(),
        Duration::from_secs(1),
        Duration::from_millis(1),
    );
    state.add_notice(
        NoticeKind::Custom,
        "fresh",
        HashMap::new(),
        Duration::from_secs(1),
        Duration::from_secs(3600),
    );
    std::thread::sleep(Duration::from_millis(20));

    state.prune(Duration::from_millis(1), Duration::from_secs(3600), 1000);

    let remaining = state.notices(&NoticeFilter::default());
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key, "fresh");
}
