//! Timing defaults and small shared enums used throughout the supervisor.

use std::time::Duration;

// ============================================================================
// Service lifecycle timing defaults (spec §4.2, §6)
// ============================================================================

/// Time a service must stay alive after spawn before it's considered `Running`.
pub const DEFAULT_OKAY_DELAY: Duration = Duration::from_secs(1);

/// Time to wait after SIGTERM before escalating to SIGKILL.
pub const DEFAULT_KILL_DELAY: Duration = Duration::from_secs(5);

/// Time to wait after SIGKILL before giving up and marking the service stopped.
pub const DEFAULT_FAIL_DELAY: Duration = Duration::from_secs(5);

/// Initial backoff delay before the first automatic restart.
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(500);

/// Multiplier applied to the backoff delay on each consecutive failure.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Ceiling the backoff delay grows toward.
pub const DEFAULT_BACKOFF_LIMIT: Duration = Duration::from_secs(30);

/// Fraction of the computed backoff delay used as the uniform jitter window.
pub const BACKOFF_JITTER_FRACTION: f64 = 0.1;

/// A service run continuously for at least this long resets its backoff counter.
pub const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(10);

// ============================================================================
// Overlord ticker defaults (spec §4.5)
// ============================================================================

/// Interval between unsolicited `Ensure` passes.
pub const DEFAULT_ENSURE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval between state-pruning passes.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default retention window for resolved changes during pruning.
pub const DEFAULT_CHANGE_ABORT_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Default retention window for expired-but-unpruned notices.
pub const DEFAULT_NOTICE_EXPIRE_AFTER: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long the `start-service` task handler waits for a service to reach
/// `running` (or settle into a terminal status) before failing the task.
pub const DEFAULT_LANE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `Overlord::boot` waits for the boot-time replan change to reach
/// a terminal status before giving up and booting anyway.
pub const DEFAULT_BOOT_CHANGE_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// State and plan file conventions (spec §6)
// ============================================================================

/// Name of the durable state checkpoint file.
pub const STATE_FILE_NAME: &str = "state.json";

/// Permission bits required of the state directory.
pub const STATE_DIR_MODE: u32 = 0o700;

/// Default shell used to execute a service's command string.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell flag for executing a command string.
pub const SHELL_COMMAND_FLAG: &str = "-c";

/// Default `PATH` applied to a service's environment when it doesn't set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Default `LANG` applied to a service's environment when it doesn't set one.
pub const DEFAULT_LANG: &str = "C.UTF-8";

// ============================================================================
// Notice constraints (spec §4.4)
// ============================================================================

/// Maximum byte length of a notice key.
pub const NOTICE_KEY_MAX_LEN: usize = 255;

// ============================================================================
// Ring log defaults
// ============================================================================

/// Default capacity, in bytes, of a service's in-memory output ring buffer.
pub const DEFAULT_RING_LOG_CAPACITY: usize = 64 * 1024;
