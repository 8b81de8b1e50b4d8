//! Reaps exited child processes, including orphaned grandchildren, without
//! letting a slow-to-wait caller block anyone else.
//!
//! Grounded on the polling `waitpid(..., WNOHANG)` idiom the teacher uses
//! while waiting on cron jobs, generalized into a dedicated background
//! thread that owns the single blocking wait loop for the whole process.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::{ChildStderr, ChildStdout, Command as StdCommand};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::error::ReaperError;

/// How a reaped process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited normally with the given status code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(i32),
}

impl ExitOutcome {
    /// Whether this outcome counts as a successful exit (status 0).
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

/// A handle to a process started through the reaper; `wait` blocks until
/// the reaper's background thread observes its exit.
pub struct ReapedChild {
    pub(crate) pid: Pid,
    rx: Receiver<ExitOutcome>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl ReapedChild {
    /// The child's pid.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Blocks until the process exits and returns how it exited.
    pub fn wait(&self) -> ExitOutcome {
        self.rx
            .recv()
            .expect("reaper thread dropped the exit sender before sending")
    }

    /// Non-blocking check for an already-delivered exit.
    pub fn try_wait(&self) -> Option<ExitOutcome> {
        self.rx.try_recv().ok()
    }

    /// Takes the child's stdout pipe, if `start_command` was given a command
    /// configured with `Stdio::piped()` for it. Each call returns it once.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Takes the child's stderr pipe, if `start_command` was given a command
    /// configured with `Stdio::piped()` for it. Each call returns it once.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }
}

struct Waiter {
    tx: Sender<ExitOutcome>,
}

struct ReaperInner {
    waiters: Mutex<HashMap<i32, Waiter>>,
    running: std::sync::atomic::AtomicBool,
}

/// Process-wide reaper. Must be started explicitly before spawning
/// supervised services and stopped explicitly at shutdown; there is no
/// hidden lazy initialization.
pub struct Reaper {
    inner: Arc<ReaperInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

static REAPER: OnceLock<Reaper> = OnceLock::new();

impl Reaper {
    /// Starts the reaper's background wait thread, enabling subreaper
    /// behavior on Linux so orphaned grandchildren reparent here instead of
    /// to pid 1.
    pub fn start() -> Result<&'static Reaper, ReaperError> {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: PR_SET_CHILD_SUBREAPER takes no pointer arguments.
            let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
            if rc != 0 {
                return Err(ReaperError::Subreaper(nix::errno::Errno::last()));
            }
        }

        let reaper = REAPER.get_or_init(|| {
            let inner = Arc::new(ReaperInner {
                waiters: Mutex::new(HashMap::new()),
                running: std::sync::atomic::AtomicBool::new(true),
            });
            let wait_inner = Arc::clone(&inner);
            let thread = std::thread::spawn(move || reap_loop(wait_inner));
            Reaper {
                inner,
                thread: Mutex::new(Some(thread)),
            }
        });
        reaper
            .inner
            .running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(reaper)
    }

    /// Returns the running reaper, if `start` has been called.
    pub fn get() -> Option<&'static Reaper> {
        REAPER.get().filter(|r| r.is_running())
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Stops accepting new commands. The background wait thread keeps
    /// running for the process lifetime since `waitpid(-1, ...)` cannot be
    /// cleanly interrupted; already-registered waiters are unaffected.
    pub fn stop(&self) {
        self.inner
            .running
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Spawns `cmd` in its own session/process group and registers it for
    /// reaping. The caller is responsible for signaling the returned pid's
    /// process group (negative pid) to stop it.
    pub fn start_command(&self, cmd: &mut StdCommand) -> Result<ReapedChild, ReaperError> {
        if !self.is_running() {
            return Err(ReaperError::NotRunning);
        }

        // SAFETY: setsid is async-signal-safe and valid to call in the
        // pre_exec hook; it only affects the child process's own session.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel();
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid.as_raw(), Waiter { tx });
        trace!(pid = pid.as_raw(), "registered process for reaping");
        Ok(ReapedChild {
            pid,
            rx,
            stdout,
            stderr,
        })
    }
}

fn reap_loop(inner: Arc<ReaperInner>) {
    loop {
        match waitpid(None, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                deliver(&inner, pid, ExitOutcome::Exited(code));
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                deliver(&inner, pid, ExitOutcome::Signaled(sig as i32));
            }
            Ok(_) => {
                // Stopped/Continued/PtraceEvent: not a terminal exit, ignore.
            }
            Err(nix::errno::Errno::ECHILD) => {
                // No children at all right now; brief backoff to avoid a
                // hot spin loop when the supervisor is idle.
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "unexpected waitpid error in reaper loop");
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        }
    }
}

fn deliver(inner: &Arc<ReaperInner>, pid: Pid, outcome: ExitOutcome) {
    let waiter = inner
        .waiters
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&pid.as_raw());
    match waiter {
        Some(w) => {
            debug!(pid = pid.as_raw(), ?outcome, "reaped supervised process");
            let _ = w.tx.send(outcome);
        }
        None => {
            trace!(pid = pid.as_raw(), "reaped orphaned grandchild");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn reaps_a_simple_exit() {
        let reaper = Reaper::start().unwrap();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 7");
        let child = reaper.start_command(&mut cmd).unwrap();
        let outcome = child.wait();
        assert_eq!(outcome, ExitOutcome::Exited(7));
    }

    #[test]
    fn success_exit_is_success() {
        let reaper = Reaper::start().unwrap();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 0");
        let child = reaper.start_command(&mut cmd).unwrap();
        assert!(child.wait().is_success());
    }
}
