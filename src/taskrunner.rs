//! Dispatches runnable tasks to registered handlers and drives them through
//! `Do` -> `Doing` -> terminal, respecting wait edges and lanes.
//!
//! Grounded on the match-based command dispatch in the teacher's
//! `supervisor.rs::handle_command`, generalized from a fixed command enum
//! into a registered-handler map so new task kinds don't require editing a
//! central match statement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::TaskError;
use crate::state::{State, Status, Task, TaskId};

/// What a task handler reports after running.
pub enum TaskOutcome {
    /// The task completed successfully.
    Done,
    /// The task failed with the given error.
    Failed(Box<dyn std::error::Error + Send + Sync>),
    /// The task isn't finished; re-examine it on the next `Ensure` pass.
    Retry,
}

/// A cooperative cancellation flag passed to running handlers so
/// `abort_change` can ask them to stop early.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A task handler: given the task's current snapshot and a cancellation
/// token, performs the work and reports the outcome.
pub type HandlerFn =
    dyn Fn(&Task, &CancellationToken) -> TaskOutcome + Send + Sync + 'static;

type HandlerPair = (Arc<HandlerFn>, Option<Arc<HandlerFn>>);

/// Dispatches runnable tasks from a [`State`] to registered handlers on a
/// worker thread pool.
pub struct TaskRunner {
    state: Arc<State>,
    handlers: Mutex<HashMap<String, HandlerPair>>,
    catch_all: Mutex<Option<HandlerPair>>,
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    pool: threadpool::ThreadPool,
}

/// A minimal fixed-size worker pool, grounded on the same "spawn a fixed
/// number of long-lived worker threads that pull from a shared queue" idea
/// used by the teacher's background ticker threads, generalized here into a
/// reusable pool rather than one-off `thread::spawn` calls.
mod threadpool {
    use std::sync::mpsc::{self, Sender};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    type Job = Box<dyn FnOnce() + Send + 'static>;

    pub struct ThreadPool {
        sender: Option<Sender<Job>>,
        workers: Vec<JoinHandle<()>>,
    }

    impl ThreadPool {
        pub fn new(size: usize) -> Self {
            let (sender, receiver) = mpsc::channel::<Job>();
            let receiver = Arc::new(Mutex::new(receiver));
            let mut workers = Vec::with_capacity(size);
            for _ in 0..size.max(1) {
                let receiver = Arc::clone(&receiver);
                workers.push(std::thread::spawn(move || loop {
                    let job = {
                        let rx = receiver.lock().unwrap_or_else(|e| e.into_inner());
                        rx.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                }));
            }
            ThreadPool {
                sender: Some(sender),
                workers,
            }
        }

        pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
            if let Some(sender) = &self.sender {
                let _ = sender.send(Box::new(job));
            }
        }
    }

    impl Drop for ThreadPool {
        fn drop(&mut self) {
            self.sender.take();
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

impl TaskRunner {
    /// Creates a task runner over `state` with `workers` dispatch threads.
    pub fn new(state: Arc<State>, workers: usize) -> TaskRunner {
        TaskRunner {
            state,
            handlers: Mutex::new(HashMap::new()),
            catch_all: Mutex::new(None),
            tokens: Mutex::new(HashMap::new()),
            pool: threadpool::ThreadPool::new(workers),
        }
    }

    /// Registers a `do`-only handler for tasks of the given `kind`, with no
    /// undo counterpart (the task simply can't be rolled back).
    pub fn register(
        &self,
        kind: impl Into<String>,
        do_fn: impl Fn(&Task, &CancellationToken) -> TaskOutcome + Send + Sync + 'static,
    ) {
        self.register_with_undo(kind, do_fn, None::<fn(&Task, &CancellationToken) -> TaskOutcome>);
    }

    /// Registers a handler pair for tasks of the given `kind`: `do_fn` runs
    /// the task, and `undo_fn`, if given, reverses it when the task's
    /// change is aborted after `do_fn` already completed.
    pub fn register_with_undo<D, U>(&self, kind: impl Into<String>, do_fn: D, undo_fn: Option<U>)
    where
        D: Fn(&Task, &CancellationToken) -> TaskOutcome + Send + Sync + 'static,
        U: Fn(&Task, &CancellationToken) -> TaskOutcome + Send + Sync + 'static,
    {
        let pair: HandlerPair = (
            Arc::new(do_fn),
            undo_fn.map(|f| Arc::new(f) as Arc<HandlerFn>),
        );
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.into(), pair);
    }

    /// Registers a handler pair used for any task kind with no specific
    /// registration, matching the spec's "optional catch-all handler".
    pub fn register_catch_all<D, U>(&self, do_fn: D, undo_fn: Option<U>)
    where
        D: Fn(&Task, &CancellationToken) -> TaskOutcome + Send + Sync + 'static,
        U: Fn(&Task, &CancellationToken) -> TaskOutcome + Send + Sync + 'static,
    {
        let pair: HandlerPair = (
            Arc::new(do_fn),
            undo_fn.map(|f| Arc::new(f) as Arc<HandlerFn>),
        );
        *self.catch_all.lock().unwrap_or_else(|e| e.into_inner()) = Some(pair);
    }

    fn lookup_do(&self, kind: &str) -> Result<Arc<HandlerFn>, TaskError> {
        if let Some((do_fn, _)) = self.handlers.lock().unwrap_or_else(|e| e.into_inner()).get(kind) {
            return Ok(Arc::clone(do_fn));
        }
        if let Some((do_fn, _)) = self.catch_all.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Ok(Arc::clone(do_fn));
        }
        Err(TaskError::UnknownKind(kind.to_string()))
    }

    fn lookup_undo(&self, kind: &str) -> Option<Arc<HandlerFn>> {
        if let Some((_, Some(undo_fn))) = self.handlers.lock().unwrap_or_else(|e| e.into_inner()).get(kind) {
            return Some(Arc::clone(undo_fn));
        }
        self.catch_all
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|(_, undo_fn)| undo_fn.clone())
    }

    fn arm_token(&self, task_id: TaskId) -> CancellationToken {
        let token = CancellationToken::default();
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id, token.clone());
        token
    }

    /// Scans for runnable `do` and `undo` tasks and dispatches each to its
    /// handler on the worker pool. Returns immediately; handlers report
    /// their outcome asynchronously via `State::set_task_status`.
    pub fn ensure(&self) -> Result<(), TaskError> {
        for task_id in self.state.runnable_tasks() {
            let Some(task) = self.state.task(task_id) else {
                continue;
            };
            let handler = self.lookup_do(&task.kind)?;

            self.state.set_task_status(task_id, Status::Doing);
            let token = self.arm_token(task_id);
            let state = Arc::clone(&self.state);
            self.pool.execute(move || {
                let started = Instant::now();
                let outcome = handler(&task, &token);
                let elapsed = started.elapsed();
                state.add_doing_duration(task_id, elapsed);
                match outcome {
                    TaskOutcome::Done => {
                        debug!(task = task_id.0, elapsed_ms = elapsed.as_millis(), "task done");
                        state.set_task_status(task_id, Status::Done);
                    }
                    TaskOutcome::Failed(err) => {
                        warn!(task = task_id.0, error = %err, "task failed");
                        state.log_task(task_id, format!("error: {err}"));
                        state.set_task_status(task_id, Status::Error);
                    }
                    TaskOutcome::Retry => {
                        state.set_task_status(task_id, Status::Do);
                    }
                }
            });
        }

        for task_id in self.state.runnable_undo_tasks() {
            let Some(task) = self.state.task(task_id) else {
                continue;
            };
            let Some(handler) = self.lookup_undo(&task.kind) else {
                // Nothing registered to reverse this task; treat it as
                // already rolled back so the rest of the undo chain can
                // keep unwinding.
                self.state.set_task_status(task_id, Status::Done);
                continue;
            };

            self.state.set_task_status(task_id, Status::Undoing);
            let token = self.arm_token(task_id);
            let state = Arc::clone(&self.state);
            self.pool.execute(move || {
                let started = Instant::now();
                let outcome = handler(&task, &token);
                let elapsed = started.elapsed();
                state.add_undoing_duration(task_id, elapsed);
                match outcome {
                    TaskOutcome::Done => {
                        debug!(task = task_id.0, elapsed_ms = elapsed.as_millis(), "undo done");
                        state.set_task_status(task_id, Status::Done);
                    }
                    TaskOutcome::Failed(err) => {
                        warn!(task = task_id.0, error = %err, "undo failed");
                        state.log_task(task_id, format!("undo error: {err}"));
                        state.set_task_status(task_id, Status::Error);
                    }
                    TaskOutcome::Retry => {
                        state.set_task_status(task_id, Status::Undo);
                    }
                }
            });
        }
        Ok(())
    }

    /// Requests cancellation of a currently-`Doing` or `Undoing` task, if
    /// one is registered.
    pub fn cancel(&self, task: TaskId) {
        if let Some(token) = self.tokens.lock().unwrap_or_else(|e| e.into_inner()).get(&task) {
            token.cancel();
        }
    }
}
