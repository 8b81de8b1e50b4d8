//! The per-service state machine and the manager that owns every running
//! service's handle (spec §4.2).
//!
//! Grounded primarily on Horust's `ServiceHandler`/`ServiceStatus` shape
//! (`other_examples/465163a5_...service_handler.rs.rs`) for the
//! state-enum-plus-handle pattern and restart bookkeeping, and on the
//! teacher's `daemon.rs` for the basic start/stop/restart control flow,
//! generalized from bare `std::process::Child` to `nix`-based process-group
//! signaling.

pub mod backoff;

use std::collections::HashMap;
use std::io::Read;
use std::process::Command as StdCommand;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::constants::{
    DEFAULT_FAIL_DELAY, DEFAULT_KILL_DELAY, DEFAULT_LANG, DEFAULT_OKAY_DELAY, DEFAULT_PATH,
    DEFAULT_RING_LOG_CAPACITY,
};
use crate::error::ServiceError;
use crate::identity::{Identity, SystemUserLookup, UserLookup};
use crate::plan::{Plan, ReplanOutcome, ServiceAction, ServiceConfig};
use crate::reaper::{ExitOutcome, ReapedChild, Reaper};
use crate::ringlog::RingLog;

use self::backoff::Backoff;

/// A service's lifecycle state (spec §3/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ServiceState {
    /// Not yet started since the supervisor booted.
    Initial,
    /// Spawned, waiting out the okay-delay.
    Starting,
    /// Survived the okay-delay; considered up.
    Running,
    /// Sent SIGTERM, waiting out the kill-delay.
    Terminating,
    /// Sent SIGKILL, waiting out the fail-delay.
    Killing,
    /// Stopped deliberately (not going to auto-restart).
    Stopped,
    /// Exited and waiting out a backoff delay before restarting.
    Backoff,
    /// Exited and not going to restart (e.g. `on_failure: ignore`).
    Exited,
}

/// The externally-visible status derived from a [`ServiceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ServiceStatus {
    /// Up and running, or transitioning between up states.
    Active,
    /// Down, waiting to retry.
    Backoff,
    /// Down and not retrying, due to a failure.
    Error,
    /// Down and not retrying, deliberately.
    Inactive,
}

/// Maps a lifecycle state to its externally-visible status.
pub fn derive_status(state: ServiceState) -> ServiceStatus {
    match state {
        ServiceState::Starting | ServiceState::Running | ServiceState::Terminating | ServiceState::Killing => {
            ServiceStatus::Active
        }
        ServiceState::Backoff => ServiceStatus::Backoff,
        ServiceState::Exited => ServiceStatus::Error,
        ServiceState::Initial | ServiceState::Stopped => ServiceStatus::Inactive,
    }
}

struct ServiceHandle {
    config: ServiceConfig,
    state: ServiceState,
    pid: Option<Pid>,
    ringlog: Arc<RingLog>,
    backoff: Backoff,
    restart_on_stop: bool,
    start_count: u64,
    last_transition: Instant,
}

impl ServiceHandle {
    fn new(config: ServiceConfig) -> ServiceHandle {
        let backoff = Backoff::new(
            config.backoff_delay,
            config.backoff_factor,
            config.backoff_limit,
            crate::constants::BACKOFF_RESET_AFTER,
        );
        ServiceHandle {
            config,
            state: ServiceState::Initial,
            pid: None,
            ringlog: RingLog::new(DEFAULT_RING_LOG_CAPACITY),
            backoff,
            restart_on_stop: false,
            start_count: 0,
            last_transition: Instant::now(),
        }
    }

    fn transition(&mut self, state: ServiceState) {
        tracing::trace!(from = %self.state, to = %state, "service state transition");
        self.state = state;
        self.last_transition = Instant::now();
    }
}

/// Owns every service's runtime handle plus the currently-combined plan.
/// Per spec §5, the service map and the plan are guarded by separate locks
/// so a long-running plan read never blocks a status query.
pub struct ServiceManager {
    services: Mutex<HashMap<String, ServiceHandle>>,
    services_changed: Condvar,
    plan: RwLock<Arc<Plan>>,
    reaper: &'static Reaper,
    user_lookup: Box<dyn UserLookup + Send + Sync>,
}

impl ServiceManager {
    /// Creates a manager with an empty plan. Call `replan` to populate it.
    pub fn new(reaper: &'static Reaper) -> ServiceManager {
        ServiceManager {
            services: Mutex::new(HashMap::new()),
            services_changed: Condvar::new(),
            plan: RwLock::new(Arc::new(Plan::combine(&[]).expect("empty plan always combines"))),
            reaper,
            user_lookup: Box::new(SystemUserLookup),
        }
    }

    /// The currently active plan.
    pub fn plan(&self) -> Arc<Plan> {
        Arc::clone(&self.plan.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Applies a new plan, diffing it against what's currently running and
    /// returning the stop/start lanes the caller (the Overlord) should turn
    /// into tasks.
    pub fn replan(&self, new_plan: Arc<Plan>) -> ReplanOutcome {
        let running: Vec<String> = {
            let services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            services
                .iter()
                .filter(|(_, h)| derive_status(h.state) == ServiceStatus::Active)
                .map(|(n, _)| n.clone())
                .collect()
        };
        let old_plan = self.plan();
        let outcome = old_plan.replan(&new_plan, &running);
        *self.plan.write().unwrap_or_else(|e| e.into_inner()) = new_plan;
        outcome
    }

    /// The current externally-visible status of a service, if known.
    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|h| derive_status(h.state))
    }

    /// The service's output ring log, if it has been started at least once.
    pub fn ringlog(&self, name: &str) -> Option<Arc<RingLog>> {
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|h| Arc::clone(&h.ringlog))
    }

    /// Starts `name`, spawning its process in its own group and arming the
    /// okay-delay timer.
    pub fn start(self: &Arc<Self>, name: &str) -> Result<(), ServiceError> {
        let plan = self.plan();
        let config = plan
            .services()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownService(name.to_string()))?;

        let identity = config
            .identity
            .resolve(self.user_lookup.as_ref())
            .map_err(|_| ServiceError::UnknownService(name.to_string()))?;

        let mut cmd = build_command(&config, &identity);
        let mut reaped = self
            .reaper
            .start_command(&mut cmd)
            .map_err(|e| ServiceError::Spawn {
                service: name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;
        let pid = reaped.pid();
        let stdout = reaped.take_stdout();
        let stderr = reaped.take_stderr();

        let ringlog = {
            let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            let handle = services
                .entry(name.to_string())
                .or_insert_with(|| ServiceHandle::new(config.clone()));
            handle.config = config.clone();
            handle.pid = Some(pid);
            handle.start_count += 1;
            handle.backoff.record_start();
            handle.transition(ServiceState::Starting);
            Arc::clone(&handle.ringlog)
        };
        self.services_changed.notify_all();
        info!(service = name, pid = pid.as_raw(), "service starting");

        if let Some(out) = stdout {
            let log = Arc::clone(&ringlog);
            std::thread::spawn(move || pump_into_ringlog(out, log));
        }
        if let Some(err) = stderr {
            let log = Arc::clone(&ringlog);
            std::thread::spawn(move || pump_into_ringlog(err, log));
        }

        let this = Arc::clone(self);
        let watch_target = name.to_string();
        std::thread::spawn(move || this.watch(watch_target, pid, reaped));

        let this = Arc::clone(self);
        std::thread::spawn(move || this.promote_after_okay_delay(pid));
        Ok(())
    }

    /// Blocks until `name` reaches `running`, settles into a terminal or
    /// backoff status, or `timeout` elapses. Used by the task handler that
    /// drives `start-service` so a lane's wait edges mean what they say:
    /// the predecessor service actually came up, not just that `start` was
    /// called on it.
    pub fn wait_for_status(self: &Arc<Self>, name: &str, timeout: Duration) -> Option<ServiceStatus> {
        let deadline = Instant::now() + timeout;
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let settled = match services.get(name) {
                None => return None,
                Some(handle) => match handle.state {
                    ServiceState::Running
                    | ServiceState::Stopped
                    | ServiceState::Backoff
                    | ServiceState::Exited => Some(derive_status(handle.state)),
                    _ => None,
                },
            };
            if let Some(status) = settled {
                return Some(status);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return services.get(name).map(|h| derive_status(h.state));
            }
            let (guard, _) = self
                .services_changed
                .wait_timeout(services, remaining)
                .unwrap_or_else(|e| e.into_inner());
            services = guard;
        }
    }

    fn promote_after_okay_delay(self: Arc<Self>, pid: Pid) {
        std::thread::sleep(DEFAULT_OKAY_DELAY);
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = services.values_mut().find(|h| h.pid == Some(pid)) {
            if handle.state == ServiceState::Starting {
                handle.transition(ServiceState::Running);
            }
        }
        drop(services);
        self.services_changed.notify_all();
    }

    fn watch(self: Arc<Self>, name: String, pid: Pid, reaped: ReapedChild) {
        let outcome = reaped.wait();
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = services.get_mut(&name) else {
            return;
        };
        if handle.pid != Some(pid) {
            // Superseded by a newer start; this exit is stale.
            return;
        }
        handle.pid = None;

        match handle.state {
            ServiceState::Terminating | ServiceState::Killing => {
                if handle.restart_on_stop {
                    handle.transition(ServiceState::Backoff);
                    let delay = handle.backoff.next();
                    drop(services);
                    self.services_changed.notify_all();
                    self.schedule_restart(name, delay);
                    return;
                } else {
                    handle.transition(ServiceState::Stopped);
                }
            }
            ServiceState::Starting => {
                warn!(service = %name, "service exited before the okay delay elapsed");
                let action = if outcome.is_success() {
                    handle.config.on_success
                } else {
                    handle.config.on_failure
                };
                self.apply_exit_action(handle, &name, action, outcome);
            }
            ServiceState::Running => {
                let action = if outcome.is_success() {
                    handle.config.on_success
                } else {
                    handle.config.on_failure
                };
                self.apply_exit_action(handle, &name, action, outcome);
            }
            _ => {}
        }
        drop(services);
        self.services_changed.notify_all();
    }

    fn apply_exit_action(
        self: &Arc<Self>,
        handle: &mut ServiceHandle,
        name: &str,
        action: ServiceAction,
        outcome: ExitOutcome,
    ) {
        match action {
            ServiceAction::Restart | ServiceAction::Unset => {
                handle.transition(ServiceState::Backoff);
                let delay = handle.backoff.next();
                let this = Arc::clone(self);
                let name = name.to_string();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    let _ = this.start(&name);
                });
            }
            ServiceAction::Ignore => {
                handle.transition(ServiceState::Exited);
            }
            ServiceAction::Shutdown => {
                handle.transition(ServiceState::Exited);
                warn!(service = name, "service exit requested supervisor shutdown");
            }
            ServiceAction::SuccessShutdown => {
                handle.transition(ServiceState::Exited);
                if outcome.is_success() {
                    warn!(service = name, "successful exit requested supervisor shutdown");
                }
            }
            ServiceAction::FailureShutdown => {
                handle.transition(ServiceState::Exited);
                if !outcome.is_success() {
                    warn!(service = name, "failing exit requested supervisor shutdown");
                }
            }
        }
    }

    fn schedule_restart(self: &Arc<Self>, name: String, delay: std::time::Duration) {
        let this = Arc::clone(self);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let _ = this.start(&name);
        });
    }

    /// Stops `name`: SIGTERM the process group, escalate to SIGKILL after
    /// the kill-delay, give up after the fail-delay.
    pub fn stop(self: &Arc<Self>, name: &str) -> Result<(), ServiceError> {
        let pid = {
            let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            let handle = services
                .get_mut(name)
                .ok_or_else(|| ServiceError::UnknownService(name.to_string()))?;
            match handle.state {
                ServiceState::Starting | ServiceState::Running => {
                    handle.restart_on_stop = false;
                    handle.transition(ServiceState::Terminating);
                    handle.pid
                }
                _ => return Ok(()),
            }
        };
        self.services_changed.notify_all();
        let Some(pid) = pid else { return Ok(()) };

        signal::killpg(pid, Signal::SIGTERM).map_err(|e| ServiceError::Signal {
            service: name.to_string(),
            source: e,
        })?;

        let this = Arc::clone(self);
        let name = name.to_string();
        std::thread::spawn(move || this.escalate(name, pid));
        Ok(())
    }

    fn escalate(self: Arc<Self>, name: String, pid: Pid) {
        std::thread::sleep(DEFAULT_KILL_DELAY);
        {
            let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            let Some(handle) = services.get_mut(&name) else {
                return;
            };
            if handle.pid != Some(pid) || handle.state != ServiceState::Terminating {
                return;
            }
            handle.transition(ServiceState::Killing);
        }
        self.services_changed.notify_all();
        let _ = signal::killpg(pid, Signal::SIGKILL);

        std::thread::sleep(DEFAULT_FAIL_DELAY);
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = services.get_mut(&name) {
            if handle.pid == Some(pid) && handle.state == ServiceState::Killing {
                warn!(
                    service = %name,
                    "still running after SIGTERM and SIGKILL; marking stopped"
                );
                handle.transition(ServiceState::Stopped);
            }
        }
        drop(services);
        self.services_changed.notify_all();
    }

    /// Notifies the manager that a named check failed for `name`, applying
    /// the service's configured `on_check_failure` action (spec §4.2
    /// "Restart-after-check-failure").
    pub fn check_failed(self: &Arc<Self>, name: &str, check: &str) {
        let (action, pid, state) = {
            let services = self.services.lock().unwrap_or_else(|e| e.into_inner());
            let Some(handle) = services.get(name) else {
                return;
            };
            let action = handle
                .config
                .on_check_failure
                .get(check)
                .copied()
                .unwrap_or(ServiceAction::Restart);
            (action, handle.pid, handle.state)
        };

        if state != ServiceState::Running {
            return;
        }
        if action == ServiceAction::Restart {
            {
                let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(handle) = services.get_mut(name) {
                    handle.restart_on_stop = true;
                    handle.transition(ServiceState::Terminating);
                }
            }
            self.services_changed.notify_all();
            if let Some(pid) = pid {
                let _ = signal::killpg(pid, Signal::SIGTERM);
                let this = Arc::clone(self);
                let name = name.to_string();
                std::thread::spawn(move || this.escalate(name, pid));
            }
        }
    }
}

fn build_command(config: &ServiceConfig, identity: &crate::identity::ResolvedIdentity) -> StdCommand {
    let mut cmd = StdCommand::new(crate::constants::DEFAULT_SHELL);
    cmd.arg(crate::constants::SHELL_COMMAND_FLAG)
        .arg(config.command.argv().join(" "));

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    // Inherits the daemon's own environment (no env_clear), then layers the
    // plan's env on top, falling back to defaults only for vars the daemon
    // itself doesn't have set.
    if std::env::var_os("PATH").is_none() {
        cmd.env("PATH", DEFAULT_PATH);
    }
    if std::env::var_os("LANG").is_none() {
        cmd.env("LANG", DEFAULT_LANG);
    }
    for (k, v) in &config.environment {
        cmd.env(k, v);
    }
    if !config.environment.contains_key("HOME") {
        if let Some(uid) = identity.uid {
            if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
                cmd.env("HOME", user.dir);
                if !config.environment.contains_key("USER") {
                    cmd.env("USER", user.name);
                }
            }
        }
    }

    if let Some(uid) = identity.uid {
        cmd.uid(uid);
    }
    if let Some(gid) = identity.gid {
        cmd.gid(gid);
    }

    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    cmd
}

use std::os::unix::process::CommandExt;

/// Reads `src` until EOF, writing each chunk into `log`. Runs on its own
/// thread for the lifetime of the pipe; exits once the child closes it.
fn pump_into_ringlog(mut src: impl Read, log: Arc<RingLog>) {
    let mut buf = [0u8; 4096];
    loop {
        match src.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => log.write(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_status_maps_states() {
        assert_eq!(derive_status(ServiceState::Running), ServiceStatus::Active);
        assert_eq!(derive_status(ServiceState::Backoff), ServiceStatus::Backoff);
        assert_eq!(derive_status(ServiceState::Exited), ServiceStatus::Error);
        assert_eq!(derive_status(ServiceState::Stopped), ServiceStatus::Inactive);
        assert_eq!(derive_status(ServiceState::Initial), ServiceStatus::Inactive);
    }
}
