//! Checkpointing the state tree to disk: a plain JSON snapshot written via
//! temp-file-then-rename, with an fsync of both the file and its parent
//! directory so a crash mid-write can never leave a corrupt checkpoint.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::notice::Notice;
use super::{Change, State, Task};
use crate::error::StateError;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Snapshot {
    data: HashMap<String, serde_json::Value>,
    changes: Vec<Change>,
    tasks: Vec<Task>,
    notices: Vec<Notice>,
    identities: serde_json::Value,
    pairing: serde_json::Value,
    last_task_id: u64,
    last_change_id: u64,
    last_lane_id: u32,
    last_notice_id: u64,
    last_boot_id: u64,
    pending_restart: Option<String>,
}

impl State {
    /// Serializes the entire state tree to `path`, writing to a sibling
    /// temp file first and renaming it into place so readers never see a
    /// partial write.
    pub fn checkpoint(&self, path: &Path) -> Result<(), StateError> {
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
        ));

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&json)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }
        Ok(())
    }

    /// Restores state from a checkpoint previously written by
    /// `checkpoint`. Recomputes id counters as the max seen across every
    /// retained change/task/lane/notice, and drops notices whose
    /// `expire_after` has already elapsed (after counting them toward the
    /// id recomputation).
    pub fn restore(path: &Path) -> Result<State, StateError> {
        let bytes = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;

        let state = State::new();
        let mut inner = state.inner.lock().unwrap_or_else(|e| e.into_inner());

        let mut max_change_id = 0u64;
        for change in snapshot.changes {
            max_change_id = max_change_id.max(change.id.0);
            inner.changes.insert(change.id, change);
        }
        let mut max_task_id = 0u64;
        let mut max_lane_id = 0u32;
        for task in snapshot.tasks {
            max_task_id = max_task_id.max(task.id.0);
            max_lane_id = task.lanes.iter().copied().fold(max_lane_id, u32::max);
            inner.tasks.insert(task.id, task);
        }
        inner.next_change_id = max_change_id.max(snapshot.last_change_id) + 1;
        inner.next_task_id = max_task_id.max(snapshot.last_task_id) + 1;
        inner.next_lane_id = max_lane_id.max(snapshot.last_lane_id) + 1;

        let now = std::time::SystemTime::now();
        let mut max_notice_id = 0u64;
        for notice in snapshot.notices {
            let expired = now
                .duration_since(notice.last_repeated)
                .map(|age| age >= notice.expire_after)
                .unwrap_or(false);
            max_notice_id = max_notice_id.max(notice.id);
            if !expired {
                inner
                    .notices
                    .insert((notice.kind, notice.key.clone()), notice);
            }
        }
        inner.next_notice_id = max_notice_id.max(snapshot.last_notice_id) + 1;

        inner.data = snapshot.data;
        inner.identities = snapshot.identities;
        inner.pairing = snapshot.pairing;
        inner.last_boot_id = snapshot.last_boot_id;
        inner.pending_restart = snapshot.pending_restart;
        drop(inner);
        Ok(state)
    }

    fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Snapshot {
            data: inner.data.clone(),
            changes: inner.changes.values().cloned().collect(),
            tasks: inner.tasks.values().cloned().collect(),
            notices: inner.notices.values().cloned().collect(),
            identities: inner.identities.clone(),
            pairing: inner.pairing.clone(),
            last_task_id: inner.next_task_id.saturating_sub(1),
            last_change_id: inner.next_change_id.saturating_sub(1),
            last_lane_id: inner.next_lane_id.saturating_sub(1),
            last_notice_id: inner.next_notice_id.saturating_sub(1),
            last_boot_id: inner.last_boot_id,
            pending_restart: inner.pending_restart.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::notice::NoticeKind;
    use crate::state::Status;
    use std::time::Duration;

    #[test]
    fn checkpoint_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = State::new();
        let change = state.new_change("start-service", "start web");
        let task = state
            .new_task(change, "start", "start web", serde_json::json!({"service": "web"}))
            .unwrap();
        state.set_task_status(task, Status::Done);
        state.add_notice(
            NoticeKind::Change,
            "1",
            HashMap::new(),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );

        state.checkpoint(&path).unwrap();
        let restored = State::restore(&path).unwrap();

        assert_eq!(restored.change(change).unwrap().tasks, vec![task]);
        assert_eq!(restored.task(task).unwrap().status, Status::Done);
        assert_eq!(restored.notices(&Default::default()).len(), 1);
    }

    #[test]
    fn restore_drops_expired_notices_but_advances_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = State::new();
        state.add_notice(
            NoticeKind::Change,
            "old",
            HashMap::new(),
            Duration::from_secs(1),
            Duration::from_millis(1),
        );
        std::thread::sleep(Duration::from_millis(20));
        state.checkpoint(&path).unwrap();

        let restored = State::restore(&path).unwrap();
        assert!(restored.notices(&Default::default()).is_empty());
    }

    #[test]
    fn new_ids_after_restore_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = State::new();
        let change = state.new_change("k", "s");
        state
            .new_task(change, "k", "s", serde_json::json!({}))
            .unwrap();
        state.checkpoint(&path).unwrap();

        let restored = State::restore(&path).unwrap();
        let next_change = restored.new_change("k", "s");
        assert!(next_change.0 > change.0);
    }

    #[test]
    fn identities_pairing_boot_and_restart_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = State::new();
        state.set_identities(serde_json::json!({"device": "abc"}));
        state.set_pairing(serde_json::json!({"paired": true}));
        state.record_boot();
        state.record_boot();
        state.set_pending_restart(Some("service-failure".to_string()));
        state.checkpoint(&path).unwrap();

        let restored = State::restore(&path).unwrap();
        assert_eq!(restored.identities(), serde_json::json!({"device": "abc"}));
        assert_eq!(restored.pairing(), serde_json::json!({"paired": true}));
        assert_eq!(restored.last_boot_id(), 2);
        assert_eq!(restored.pending_restart(), Some("service-failure".to_string()));
    }

    #[test]
    fn lane_and_notice_ids_do_not_collide_after_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = State::new();
        let change = state.new_change("k", "s");
        let task = state
            .new_task(change, "k", "s", serde_json::json!({}))
            .unwrap();
        let lane = state.next_lane_id();
        state.set_lanes(task, vec![lane]);
        state.add_notice(
            NoticeKind::Change,
            "n",
            HashMap::new(),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        state.checkpoint(&path).unwrap();

        let restored = State::restore(&path).unwrap();
        assert!(restored.next_lane_id() > lane);
        let notice_id = restored.notices(&Default::default())[0].id;
        assert!(notice_id >= 1);
    }
}
