//! The durable state and task engine: changes, tasks, lanes and notices,
//! guarded by a single coarse lock and checkpointed to disk as JSON.

pub mod notice;
pub mod persist;

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::constants::NOTICE_KEY_MAX_LEN;
use crate::error::StateError;

pub use notice::{Notice, NoticeFilter, NoticeKind};

/// A change's or task's status (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Newly created, not yet examined by `Ensure`.
    Default,
    /// Held back; will not be run until explicitly released.
    Hold,
    /// Ready to run.
    Do,
    /// Currently executing.
    Doing,
    /// Finished successfully.
    Done,
    /// Asked to stop; will transition to `Undo`/`Undoing` if reversible.
    Abort,
    /// Ready to be undone.
    Undo,
    /// Currently being undone.
    Undoing,
    /// Finished with an error.
    Error,
}

impl Status {
    /// Whether this status represents a final, non-runnable state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }

    /// Whether this status represents a task actively executing work.
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Doing | Status::Undoing)
    }
}

/// Opaque identifier for a [`Change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeId(pub u64);

/// Opaque identifier for a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

/// A group of related tasks submitted and tracked as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    /// This change's id.
    pub id: ChangeId,
    /// The kind of change, e.g. `"start-service"` or `"replan"`.
    pub kind: String,
    /// A one-line human summary.
    pub summary: String,
    /// The change's aggregate status, derived from its tasks.
    pub status: Status,
    /// The tasks belonging to this change, in submission order.
    pub tasks: Vec<TaskId>,
    /// When this change was created.
    pub spawn_time: SystemTime,
    /// When this change reached a terminal status, if it has.
    pub ready_time: Option<SystemTime>,
    /// Arbitrary data attached to the change.
    pub data: HashMap<String, serde_json::Value>,
}

/// A single unit of work within a [`Change`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// This task's id.
    pub id: TaskId,
    /// The change this task belongs to.
    pub change: ChangeId,
    /// The task kind, used to look up its handler in the [`crate::taskrunner::TaskRunner`].
    pub kind: String,
    /// A one-line human summary.
    pub summary: String,
    /// The task's current status.
    pub status: Status,
    /// Tasks that must complete before this one may run.
    pub wait_tasks: Vec<TaskId>,
    /// Tasks that must complete (successfully or not) before this one's
    /// undo may run.
    pub halt_tasks: Vec<TaskId>,
    /// Lane ids this task belongs to; a failure in one lane does not halt
    /// independent lanes.
    pub lanes: Vec<u32>,
    /// Handler-specific setup data.
    pub setup: serde_json::Value,
    /// Append-only human-readable progress log.
    pub log: Vec<String>,
    /// Accumulated time spent executing `do`.
    pub doing_duration: Duration,
    /// Accumulated time spent executing `undo`.
    pub undoing_duration: Duration,
}

impl Task {
    /// Appends a line to this task's log.
    pub fn log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }
}

struct Waiter {
    id: u64,
    filter: NoticeFilter,
    delivered: bool,
}

struct StateInner {
    data: HashMap<String, serde_json::Value>,
    changes: HashMap<ChangeId, Change>,
    tasks: HashMap<TaskId, Task>,
    notices: HashMap<(NoticeKind, String), Notice>,
    /// Opaque identity-backend passthrough, persisted but not interpreted by
    /// this crate (identity resolution itself lives in `identity.rs`).
    identities: serde_json::Value,
    /// Opaque device-pairing passthrough, persisted but not interpreted by
    /// this crate.
    pairing: serde_json::Value,
    /// Set by `Overlord::handle_restart` when a restart has been requested
    /// but the embedding process hasn't yet restarted; cleared on the next
    /// successful boot.
    pending_restart: Option<String>,
    last_boot_id: u64,
    next_change_id: u64,
    next_task_id: u64,
    next_lane_id: u32,
    next_notice_id: u64,
    next_waiter_id: u64,
    waiters: Vec<Waiter>,
}

impl StateInner {
    fn new() -> Self {
        StateInner {
            data: HashMap::new(),
            changes: HashMap::new(),
            tasks: HashMap::new(),
            notices: HashMap::new(),
            identities: serde_json::json!({}),
            pairing: serde_json::json!({}),
            pending_restart: None,
            last_boot_id: 0,
            next_change_id: 1,
            next_task_id: 1,
            next_lane_id: 1,
            next_notice_id: 1,
            next_waiter_id: 1,
            waiters: Vec::new(),
        }
    }

    fn recompute_change_status(&mut self, change_id: ChangeId) {
        let task_statuses: Vec<Status> = {
            let change = &self.changes[&change_id];
            change.tasks.iter().map(|t| self.tasks[t].status).collect()
        };
        let all_done = task_statuses.iter().all(|s| *s == Status::Done);
        let any_error = task_statuses.iter().any(|s| *s == Status::Error);
        let any_running = task_statuses.iter().any(|s| s.is_running());
        let change = self.changes.get_mut(&change_id).unwrap();
        change.status = if any_error {
            Status::Error
        } else if all_done {
            Status::Done
        } else if any_running {
            Status::Doing
        } else {
            change.status
        };
        if change.status.is_terminal() && change.ready_time.is_none() {
            change.ready_time = Some(SystemTime::now());
        }
    }
}

/// The durable, lock-guarded state tree shared by the task runner, service
/// manager, and the rest of the supervisor core.
pub struct State {
    inner: Mutex<StateInner>,
    condvar: Condvar,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Creates an empty state tree.
    pub fn new() -> Self {
        State {
            inner: Mutex::new(StateInner::new()),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reads a namespaced value from the free-form data tree.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().data.get(key).cloned()
    }

    /// Writes a namespaced value into the free-form data tree.
    pub fn set(&self, key: &str, value: serde_json::Value) {
        self.lock().data.insert(key.to_string(), value);
    }

    /// Creates a new change with no tasks yet.
    pub fn new_change(&self, kind: impl Into<String>, summary: impl Into<String>) -> ChangeId {
        let mut inner = self.lock();
        let id = ChangeId(inner.next_change_id);
        inner.next_change_id += 1;
        inner.changes.insert(
            id,
            Change {
                id,
                kind: kind.into(),
                summary: summary.into(),
                status: Status::Default,
                tasks: Vec::new(),
                spawn_time: SystemTime::now(),
                ready_time: None,
                data: HashMap::new(),
            },
        );
        id
    }

    /// Creates a new task within `change`, initially in `Do` status with no
    /// wait edges. Callers add wait/lane edges before releasing the change.
    pub fn new_task(
        &self,
        change: ChangeId,
        kind: impl Into<String>,
        summary: impl Into<String>,
        setup: serde_json::Value,
    ) -> Result<TaskId, StateError> {
        let mut inner = self.lock();
        if !inner.changes.contains_key(&change) {
            return Err(StateError::UnknownChange(change.0));
        }
        let id = TaskId(inner.next_task_id);
        inner.next_task_id += 1;
        inner.tasks.insert(
            id,
            Task {
                id,
                change,
                kind: kind.into(),
                summary: summary.into(),
                status: Status::Do,
                wait_tasks: Vec::new(),
                halt_tasks: Vec::new(),
                lanes: Vec::new(),
                setup,
                log: Vec::new(),
                doing_duration: Duration::ZERO,
                undoing_duration: Duration::ZERO,
            },
        );
        inner.changes.get_mut(&change).unwrap().tasks.push(id);
        Ok(id)
    }

    /// Adds a wait edge: `task` will not be promoted out of `Do` until
    /// `predecessor` reaches a terminal status.
    pub fn add_wait(&self, task: TaskId, predecessor: TaskId) {
        self.lock()
            .tasks
            .get_mut(&task)
            .expect("unknown task")
            .wait_tasks
            .push(predecessor);
    }

    /// Assigns `task` to the given lane ids.
    pub fn set_lanes(&self, task: TaskId, lanes: Vec<u32>) {
        self.lock().tasks.get_mut(&task).expect("unknown task").lanes = lanes;
    }

    /// Allocates a fresh lane id, for grouping the tasks of one lane of a
    /// replan change so they run independently of other lanes.
    pub fn next_lane_id(&self) -> u32 {
        let mut inner = self.lock();
        let id = inner.next_lane_id;
        inner.next_lane_id += 1;
        id
    }

    /// The opaque identity-backend passthrough.
    pub fn identities(&self) -> serde_json::Value {
        self.lock().identities.clone()
    }

    /// Replaces the opaque identity-backend passthrough.
    pub fn set_identities(&self, value: serde_json::Value) {
        self.lock().identities = value;
    }

    /// The opaque device-pairing passthrough.
    pub fn pairing(&self) -> serde_json::Value {
        self.lock().pairing.clone()
    }

    /// Replaces the opaque device-pairing passthrough.
    pub fn set_pairing(&self, value: serde_json::Value) {
        self.lock().pairing = value;
    }

    /// The id of the most recently recorded boot, or 0 if none yet.
    pub fn last_boot_id(&self) -> u64 {
        self.lock().last_boot_id
    }

    /// Records a boot, incrementing and returning the new boot id.
    pub fn record_boot(&self) -> u64 {
        let mut inner = self.lock();
        inner.last_boot_id += 1;
        inner.last_boot_id
    }

    /// The reason a restart is pending, if one has been requested but not
    /// yet observed through a fresh boot.
    pub fn pending_restart(&self) -> Option<String> {
        self.lock().pending_restart.clone()
    }

    /// Sets or clears the pending-restart marker.
    pub fn set_pending_restart(&self, reason: Option<String>) {
        self.lock().pending_restart = reason;
    }

    /// Returns a snapshot of a task.
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&id).cloned()
    }

    /// Returns a snapshot of a change.
    pub fn change(&self, id: ChangeId) -> Option<Change> {
        self.lock().changes.get(&id).cloned()
    }

    /// Updates a task's status and recomputes its change's aggregate
    /// status.
    pub fn set_task_status(&self, id: TaskId, status: Status) {
        let mut inner = self.lock();
        let change_id = match inner.tasks.get_mut(&id) {
            Some(t) => {
                t.status = status;
                t.change
            }
            None => return,
        };
        inner.recompute_change_status(change_id);
    }

    /// Appends a log line to a task.
    pub fn log_task(&self, id: TaskId, line: impl Into<String>) {
        if let Some(t) = self.lock().tasks.get_mut(&id) {
            t.log(line);
        }
    }

    /// Aborts `change`: non-terminal, non-`Doing` tasks move to `Hold`
    /// (already-`Doing` tasks are left for the task runner's cancellation
    /// mechanism to stop), and already-`Done` tasks move to `Undo` so their
    /// effects can be rolled back. A `Done` task's `halt_tasks` is set to
    /// its successors within the same change (the tasks that waited on it),
    /// so undo runs in the reverse of the order `do` ran in.
    pub fn abort_change(&self, change: ChangeId) {
        let mut inner = self.lock();
        let task_ids: Vec<TaskId> = match inner.changes.get(&change) {
            Some(c) => c.tasks.clone(),
            None => return,
        };
        let mut successors: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for &id in &task_ids {
            for &waited_on in &inner.tasks[&id].wait_tasks {
                successors.entry(waited_on).or_default().push(id);
            }
        }
        for id in &task_ids {
            let t = inner.tasks.get_mut(id).unwrap();
            if t.status == Status::Done {
                t.halt_tasks = successors.remove(id).unwrap_or_default();
                t.status = Status::Undo;
            } else if !t.status.is_terminal() && t.status != Status::Doing {
                t.status = Status::Hold;
            }
        }
        inner.recompute_change_status(change);
    }

    /// Returns every task currently in `Undo` status whose halt edges are
    /// all terminal, eligible for the task runner to promote to `Undoing`.
    pub fn runnable_undo_tasks(&self) -> Vec<TaskId> {
        let inner = self.lock();
        inner
            .tasks
            .values()
            .filter(|t| {
                t.status == Status::Undo
                    && t.halt_tasks
                        .iter()
                        .all(|h| inner.tasks.get(h).map(|ht| ht.status.is_terminal()).unwrap_or(true))
            })
            .map(|t| t.id)
            .collect()
    }

    /// Adds `elapsed` to a task's accumulated `do` execution time.
    pub fn add_doing_duration(&self, id: TaskId, elapsed: Duration) {
        if let Some(t) = self.lock().tasks.get_mut(&id) {
            t.doing_duration += elapsed;
        }
    }

    /// Adds `elapsed` to a task's accumulated `undo` execution time.
    pub fn add_undoing_duration(&self, id: TaskId, elapsed: Duration) {
        if let Some(t) = self.lock().tasks.get_mut(&id) {
            t.undoing_duration += elapsed;
        }
    }

    /// Returns every task currently in `Do` status whose wait edges are all
    /// terminal, eligible for the task runner to promote to `Doing`.
    pub fn runnable_tasks(&self) -> Vec<TaskId> {
        let inner = self.lock();
        inner
            .tasks
            .values()
            .filter(|t| {
                t.status == Status::Do
                    && t.wait_tasks
                        .iter()
                        .all(|w| inner.tasks.get(w).map(|wt| wt.status.is_terminal()).unwrap_or(true))
            })
            .map(|t| t.id)
            .collect()
    }

    /// Adds or refreshes a notice, per the repeat/occurrence rules of
    /// spec §4.4. Panics if `key` exceeds the maximum notice key length,
    /// matching the "invalid input is a programmer error" design note.
    pub fn add_notice(
        &self,
        kind: NoticeKind,
        key: impl Into<String>,
        data: HashMap<String, String>,
        repeat_after: Duration,
        expire_after: Duration,
    ) {
        let key = key.into();
        assert!(
            key.len() <= NOTICE_KEY_MAX_LEN,
            "notice key '{key}' exceeds {NOTICE_KEY_MAX_LEN} bytes"
        );
        let now = SystemTime::now();
        let mut inner = self.lock();
        let map_key = (kind, key.clone());
        if !inner.notices.contains_key(&map_key) {
            let id = inner.next_notice_id;
            inner.next_notice_id += 1;
            inner.notices.insert(
                map_key.clone(),
                Notice {
                    id,
                    kind,
                    key: key.clone(),
                    first_occurred: now,
                    last_occurred: now,
                    last_repeated: now,
                    occurrences: 0,
                    last_data: HashMap::new(),
                    repeat_after,
                    expire_after,
                },
            );
        }
        let entry = inner.notices.get_mut(&map_key).expect("just inserted");
        entry.occurrences += 1;
        entry.last_occurred = now;
        entry.last_data = data;
        entry.expire_after = expire_after;
        let should_repeat = now
            .duration_since(entry.last_repeated)
            .map(|d| d >= repeat_after)
            .unwrap_or(true);
        if should_repeat {
            entry.last_repeated = now;
            entry.repeat_after = repeat_after;
        }
        drop(inner);
        self.condvar.notify_all();
    }

    /// Returns notices matching `filter`, sorted by `last_repeated`
    /// ascending.
    pub fn notices(&self, filter: &NoticeFilter) -> Vec<Notice> {
        let inner = self.lock();
        let mut matches: Vec<Notice> = inner
            .notices
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        matches.sort_by_key(|n| n.last_repeated);
        matches
    }

    /// Blocks until a notice matching `filter` exists (returning
    /// immediately if one already does), or `deadline` passes. Each
    /// logical waiter is delivered at most once.
    pub fn wait_notices(&self, filter: NoticeFilter, deadline: Option<Instant>) -> Vec<Notice> {
        let mut inner = self.lock();
        let existing: Vec<Notice> = inner
            .notices
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        if !existing.is_empty() {
            return existing;
        }

        let waiter_id = inner.next_waiter_id;
        inner.next_waiter_id += 1;
        inner.waiters.push(Waiter {
            id: waiter_id,
            filter: filter.clone(),
            delivered: false,
        });

        loop {
            let timed_out_guard = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        None
                    } else {
                        let (g, _timeout) = self
                            .condvar
                            .wait_timeout(inner, remaining)
                            .unwrap_or_else(|e| e.into_inner());
                        Some(g)
                    }
                }
                None => Some(self.condvar.wait(inner).unwrap_or_else(|e| e.into_inner())),
            };
            inner = match timed_out_guard {
                Some(g) => g,
                None => {
                    self.inner.lock().unwrap_or_else(|e| e.into_inner())
                }
            };

            let matches: Vec<Notice> = inner
                .notices
                .values()
                .filter(|n| filter.matches(n))
                .cloned()
                .collect();
            if !matches.is_empty() {
                if let Some(w) = inner.waiters.iter_mut().find(|w| w.id == waiter_id) {
                    w.delivered = true;
                }
                inner.waiters.retain(|w| w.id != waiter_id);
                return matches;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    inner.waiters.retain(|w| w.id != waiter_id);
                    return Vec::new();
                }
            }
        }
    }

    /// Removes expired notices and resolved changes older than their
    /// retention windows.
    pub fn prune(&self, notice_expire_after: Duration, change_abort_after: Duration, max_changes: usize) {
        let now = SystemTime::now();
        let mut inner = self.lock();
        inner.notices.retain(|_, n| {
            now.duration_since(n.last_repeated)
                .map(|age| age < n.expire_after.max(notice_expire_after))
                .unwrap_or(true)
        });

        let mut resolved: Vec<ChangeId> = inner
            .changes
            .values()
            .filter(|c| {
                c.status.is_terminal()
                    && c.ready_time
                        .and_then(|t| now.duration_since(t).ok())
                        .map(|age| age >= change_abort_after)
                        .unwrap_or(false)
            })
            .map(|c| c.id)
            .collect();
        resolved.sort();
        let total_terminal = inner.changes.values().filter(|c| c.status.is_terminal()).count();
        let overflow = total_terminal.saturating_sub(max_changes);
        resolved.truncate(overflow.max(resolved.len().min(overflow)));
        for id in &resolved {
            if let Some(c) = inner.changes.remove(id) {
                for t in c.tasks {
                    inner.tasks.remove(&t);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_in_do_and_change_tracks_it() {
        let state = State::new();
        let change = state.new_change("start-service", "start web");
        let task = state
            .new_task(change, "start", "start web", serde_json::json!({}))
            .unwrap();
        assert_eq!(state.task(task).unwrap().status, Status::Do);
        assert!(state.change(change).unwrap().tasks.contains(&task));
    }

    #[test]
    fn change_status_aggregates_from_tasks() {
        let state = State::new();
        let change = state.new_change("k", "s");
        let t1 = state.new_task(change, "k", "s", serde_json::json!({})).unwrap();
        let t2 = state.new_task(change, "k", "s", serde_json::json!({})).unwrap();
        state.set_task_status(t1, Status::Done);
        state.set_task_status(t2, Status::Done);
        assert_eq!(state.change(change).unwrap().status, Status::Done);
    }

    #[test]
    fn one_error_marks_change_errored() {
        let state = State::new();
        let change = state.new_change("k", "s");
        let t1 = state.new_task(change, "k", "s", serde_json::json!({})).unwrap();
        let t2 = state.new_task(change, "k", "s", serde_json::json!({})).unwrap();
        state.set_task_status(t1, Status::Done);
        state.set_task_status(t2, Status::Error);
        assert_eq!(state.change(change).unwrap().status, Status::Error);
    }

    #[test]
    fn runnable_tasks_wait_for_predecessors() {
        let state = State::new();
        let change = state.new_change("k", "s");
        let t1 = state.new_task(change, "k", "s", serde_json::json!({})).unwrap();
        let t2 = state.new_task(change, "k", "s", serde_json::json!({})).unwrap();
        state.add_wait(t2, t1);
        assert_eq!(state.runnable_tasks(), vec![t1]);
        state.set_task_status(t1, Status::Done);
        assert!(state.runnable_tasks().contains(&t2));
    }

    #[test]
    fn notice_repeats_collapse_within_window() {
        let state = State::new();
        state.add_notice(
            NoticeKind::Change,
            "k1",
            HashMap::new(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        state.add_notice(
            NoticeKind::Change,
            "k1",
            HashMap::new(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let notices = state.notices(&NoticeFilter::default());
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].occurrences, 2);
    }

    #[test]
    fn wait_notices_returns_immediately_if_already_present() {
        let state = State::new();
        state.add_notice(
            NoticeKind::Custom,
            "k",
            HashMap::new(),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        let got = state.wait_notices(NoticeFilter::default(), Some(Instant::now()));
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn wait_notices_times_out_when_nothing_arrives() {
        let state = State::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        let got = state.wait_notices(NoticeFilter::default(), Some(deadline));
        assert!(got.is_empty());
    }

    #[test]
    fn abort_change_holds_pending_tasks() {
        let state = State::new();
        let change = state.new_change("k", "s");
        let t1 = state.new_task(change, "k", "s", serde_json::json!({})).unwrap();
        state.abort_change(change);
        assert_eq!(state.task(t1).unwrap().status, Status::Hold);
    }

    #[test]
    fn abort_change_schedules_undo_for_done_tasks_in_reverse_order() {
        let state = State::new();
        let change = state.new_change("k", "s");
        let t1 = state.new_task(change, "k", "s", serde_json::json!({})).unwrap();
        let t2 = state.new_task(change, "k", "s", serde_json::json!({})).unwrap();
        state.add_wait(t2, t1);
        state.set_task_status(t1, Status::Done);
        state.set_task_status(t2, Status::Done);

        state.abort_change(change);
        assert_eq!(state.task(t1).unwrap().status, Status::Undo);
        assert_eq!(state.task(t2).unwrap().status, Status::Undo);
        // t1's undo must wait for t2's, mirroring the reverse of `do` order.
        assert_eq!(state.task(t1).unwrap().halt_tasks, vec![t2]);
        assert!(state.task(t2).unwrap().halt_tasks.is_empty());
        assert_eq!(state.runnable_undo_tasks(), vec![t2]);
    }
}
