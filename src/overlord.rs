//! Boots the supervisor core, drives its periodic `Ensure`/prune loops, and
//! coordinates restart requests with the embedding process.
//!
//! Grounded on `supervisor.rs::run_internal`'s overall shape (load config,
//! start services, spawn background tickers, accept loop) with the
//! socket/IPC listener removed, and on the same file's cron-checker thread
//! for the ticker-thread pattern (`thread::spawn(move || loop { sleep;
//! ...})`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::constants::{
    DEFAULT_BOOT_CHANGE_TIMEOUT, DEFAULT_CHANGE_ABORT_AFTER, DEFAULT_ENSURE_INTERVAL,
    DEFAULT_LANE_WAIT_TIMEOUT, DEFAULT_NOTICE_EXPIRE_AFTER, DEFAULT_PRUNE_INTERVAL,
};
use crate::error::Error;
use crate::plan::{Lane, Plan, Startup};
use crate::reaper::Reaper;
use crate::service::{ServiceManager, ServiceStatus};
use crate::state::{ChangeId, State};
use crate::taskrunner::TaskRunner;

/// Why the embedding process is being asked to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    /// The supervisor itself is restarting (e.g. after a self-update).
    Daemon,
    /// A service's exit action requested a restart.
    ServiceFailure,
    /// A check's failure action requested a restart.
    CheckFailure,
    /// Every service can standby and there is no pending work.
    Socket,
}

/// Implemented by the embedding process to actually perform a restart;
/// this crate only decides when one is warranted.
pub trait Restarter: Send + Sync {
    /// Called when the overlord wants the process to restart.
    fn restart(&self, kind: RestartKind);
}

/// Filters `lanes` down to members whose `startup` is `enabled`, preserving
/// each lane's relative order and dropping lanes left empty by the filter.
fn enabled_only(lanes: &[Lane], plan: &Plan) -> Vec<Lane> {
    lanes
        .iter()
        .map(|lane| {
            Lane(
                lane.0
                    .iter()
                    .filter(|name| {
                        plan.services()
                            .get(*name)
                            .map(|cfg| matches!(cfg.startup, Startup::Enabled))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect(),
            )
        })
        .filter(|lane| !lane.0.is_empty())
        .collect()
}

/// A `Restarter` that only logs; used when no embedder is supplied, e.g.
/// in tests or library use where the caller drives restarts itself.
pub struct LoggingRestarter;

impl Restarter for LoggingRestarter {
    fn restart(&self, kind: RestartKind) {
        warn!(?kind, "restart requested with no embedding restarter configured");
    }
}

/// Owns the state tree, task runner, and service manager, and drives their
/// periodic maintenance loops.
pub struct Overlord {
    state: Arc<State>,
    task_runner: Arc<TaskRunner>,
    service_manager: Arc<ServiceManager>,
    reaper: &'static Reaper,
    restarter: Arc<dyn Restarter>,
    state_path: PathBuf,
    running: Arc<AtomicBool>,
    ensure_interval: Duration,
    prune_interval: Duration,
}

impl Overlord {
    /// Boots the overlord: restores state if a checkpoint exists, applies
    /// `plan`, starts every `startup: enabled` service in dependency order,
    /// and starts the background `Ensure`/prune tickers.
    pub fn boot(
        plan: Plan,
        state_path: PathBuf,
        restarter: Arc<dyn Restarter>,
    ) -> Result<Arc<Overlord>, Error> {
        let state = Arc::new(if state_path.exists() {
            State::restore(&state_path)?
        } else {
            State::new()
        });
        let reaper = Reaper::start()?;
        let service_manager = Arc::new(ServiceManager::new(reaper));
        let task_runner = Arc::new(TaskRunner::new(Arc::clone(&state), 4));

        let overlord = Arc::new(Overlord {
            state,
            task_runner,
            service_manager,
            reaper,
            restarter,
            state_path,
            running: Arc::new(AtomicBool::new(true)),
            ensure_interval: DEFAULT_ENSURE_INTERVAL,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        });

        overlord.register_handlers();

        let plan = Arc::new(plan);
        let outcome = overlord.service_manager.replan(Arc::clone(&plan));
        let start_lanes = enabled_only(&outcome.start_lanes, &plan);
        if !start_lanes.is_empty() {
            let change = overlord.submit_replan_change(&[], &start_lanes);
            overlord.drive_change_to_completion(change, DEFAULT_BOOT_CHANGE_TIMEOUT);
        }

        overlord.spawn_tickers();
        overlord.state.record_boot();
        overlord.state.set_pending_restart(None);
        info!("overlord booted");
        Ok(overlord)
    }

    fn register_handlers(self: &Arc<Self>) {
        let service_manager = Arc::clone(&self.service_manager);
        self.task_runner.register("start-service", move |task, _token| {
            let Some(name) = task.setup.get("service").and_then(|v| v.as_str()) else {
                return crate::taskrunner::TaskOutcome::Failed("missing service name".into());
            };
            if let Err(e) = service_manager.start(name) {
                return crate::taskrunner::TaskOutcome::Failed(Box::new(e));
            }
            // A lane's wait edge is only meaningful if it waits for the
            // predecessor service to actually come up, not just for `start`
            // to return (which only initiates the spawn).
            match service_manager.wait_for_status(name, DEFAULT_LANE_WAIT_TIMEOUT) {
                Some(ServiceStatus::Active) => crate::taskrunner::TaskOutcome::Done,
                Some(status) => crate::taskrunner::TaskOutcome::Failed(
                    format!("service {name} settled into {status} instead of running").into(),
                ),
                None => crate::taskrunner::TaskOutcome::Failed(
                    format!("service {name} did not reach running within the lane wait timeout").into(),
                ),
            }
        });

        let service_manager = Arc::clone(&self.service_manager);
        self.task_runner.register("stop-service", move |task, _token| {
            let Some(name) = task.setup.get("service").and_then(|v| v.as_str()) else {
                return crate::taskrunner::TaskOutcome::Failed("missing service name".into());
            };
            match service_manager.stop(name) {
                Ok(()) => crate::taskrunner::TaskOutcome::Done,
                Err(e) => crate::taskrunner::TaskOutcome::Failed(Box::new(e)),
            }
        });
    }

    /// Submits a change that stops `stop_lanes` and then starts
    /// `start_lanes`, wiring wait edges within each lane per Open Question
    /// 1 (each non-first task waits on its lane predecessor).
    pub fn submit_replan_change(
        &self,
        stop_lanes: &[crate::plan::Lane],
        start_lanes: &[crate::plan::Lane],
    ) -> crate::state::ChangeId {
        let change = self.state.new_change("replan", "apply updated plan");
        let mut previous_stop: Option<crate::state::TaskId> = None;
        for lane in stop_lanes {
            let lane_id = self.state.next_lane_id();
            let mut lane_prev = None;
            for name in &lane.0 {
                let task = self
                    .state
                    .new_task(change, "stop-service", format!("stop {name}"), serde_json::json!({"service": name}))
                    .expect("change just created");
                self.state.set_lanes(task, vec![lane_id]);
                if let Some(prev) = lane_prev {
                    self.state.add_wait(task, prev);
                }
                lane_prev = Some(task);
            }
            previous_stop = lane_prev.or(previous_stop);
        }
        for lane in start_lanes {
            let lane_id = self.state.next_lane_id();
            let mut lane_prev = None;
            for name in &lane.0 {
                let task = self
                    .state
                    .new_task(change, "start-service", format!("start {name}"), serde_json::json!({"service": name}))
                    .expect("change just created");
                self.state.set_lanes(task, vec![lane_id]);
                if let Some(prev) = previous_stop {
                    self.state.add_wait(task, prev);
                }
                if let Some(prev) = lane_prev {
                    self.state.add_wait(task, prev);
                }
                lane_prev = Some(task);
            }
        }
        change
    }

    /// Repeatedly runs the task runner's `Ensure` pass until `change` reaches
    /// a terminal status or `timeout` elapses, whichever comes first. Used at
    /// boot so startup actually waits on the lane wait-edges it just wired,
    /// instead of racing ahead of them.
    fn drive_change_to_completion(self: &Arc<Self>, change: ChangeId, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if let Err(e) = self.task_runner.ensure() {
                warn!(error = %e, "ensure pass failed while driving boot change");
            }
            match self.state.change(change) {
                Some(c) if c.status.is_terminal() => return,
                Some(_) => {}
                None => return,
            }
            if Instant::now() >= deadline {
                warn!(?change, "boot change did not settle within the boot timeout");
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn spawn_tickers(self: &Arc<Self>) {
        let this = Arc::clone(self);
        std::thread::spawn(move || {
            while this.running.load(Ordering::SeqCst) {
                std::thread::sleep(this.ensure_interval);
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = this.task_runner.ensure() {
                    warn!(error = %e, "ensure pass failed");
                }
            }
        });

        let this = Arc::clone(self);
        std::thread::spawn(move || {
            while this.running.load(Ordering::SeqCst) {
                std::thread::sleep(this.prune_interval);
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.state.prune(
                    DEFAULT_NOTICE_EXPIRE_AFTER,
                    DEFAULT_CHANGE_ABORT_AFTER,
                    1000,
                );
                if let Err(e) = this.state.checkpoint(&this.state_path) {
                    warn!(error = %e, "failed to checkpoint state during prune");
                }
            }
        });
    }

    /// The supervisor's state tree.
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// The supervisor's task runner.
    pub fn task_runner(&self) -> &Arc<TaskRunner> {
        &self.task_runner
    }

    /// The supervisor's service manager.
    pub fn service_manager(&self) -> &Arc<ServiceManager> {
        &self.service_manager
    }

    /// Forwards a restart request to the embedding process, first marking
    /// the restart as pending so a checkpoint taken mid-restart records why
    /// the next boot is happening.
    pub fn handle_restart(&self, kind: RestartKind) {
        self.state.set_pending_restart(Some(format!("{kind:?}")));
        if let Err(e) = self.state.checkpoint(&self.state_path) {
            warn!(error = %e, "failed to checkpoint state before restart");
        }
        self.restarter.restart(kind);
    }

    /// Stops issuing new work, stops every running service, stops the
    /// reaper, and checkpoints state one last time.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let plan = self.service_manager.plan();
        let names: Vec<String> = plan.services().keys().cloned().collect();
        if let Ok(lanes) = plan.stop_order(&names) {
            for lane in lanes {
                for name in lane.0 {
                    let _ = self.service_manager.stop(&name);
                }
            }
        }
        self.reaper.stop();
        if let Err(e) = self.state.checkpoint(&self.state_path) {
            warn!(error = %e, "failed to checkpoint state during shutdown");
        }
        info!("overlord shut down");
    }
}
