//! Error types for systemg-core.
use thiserror::Error;

/// Errors raised while parsing or combining plan layers.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Error reading a layer file or its containing directory from disk.
    #[error("failed to read plan layer: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing a single layer's YAML.
    #[error("invalid layer YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A non-first occurrence of an entry was missing an `override` key.
    #[error("entry '{0}' appears in more than one layer without an override mode")]
    MissingOverride(String),

    /// A service referenced a workload that no layer defines.
    #[error("service '{service}' references unknown workload '{workload}'")]
    UnknownWorkload {
        /// The service doing the referencing.
        service: String,
        /// The missing workload name.
        workload: String,
    },

    /// A service's `requires`/`before`/`after` referenced an undefined service.
    #[error("service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The service with the invalid reference.
        service: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {cycle}")]
    DependencyCycle {
        /// Human-readable remaining-nodes description.
        cycle: String,
    },

    /// An identity could not be resolved against the environment's user database.
    #[error("cannot resolve identity for service '{service}': {reason}")]
    UnresolvedIdentity {
        /// The service whose identity failed to resolve.
        service: String,
        /// Why resolution failed.
        reason: String,
    },
}

/// Errors raised by the durable state and task engine.
#[derive(Debug, Error)]
pub enum StateError {
    /// Error reading the checkpoint file from disk.
    #[error("failed to read state checkpoint: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing the checkpoint's JSON contents.
    #[error("failed to parse state checkpoint: {0}")]
    Parse(#[from] serde_json::Error),

    /// A referenced change does not exist.
    #[error("change {0} not found")]
    UnknownChange(u64),

    /// A referenced task does not exist.
    #[error("task {0} not found")]
    UnknownTask(u64),

    /// A notice key exceeded the maximum allowed length.
    #[error("notice key '{0}' exceeds 255 bytes")]
    NoticeKeyTooLong(String),
}

/// Errors raised while dispatching or running tasks.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No handler was registered for a task's kind.
    #[error("no handler registered for task kind '{0}'")]
    UnknownKind(String),

    /// The task's handler returned an error during execution.
    #[error("task {task} failed: {source}")]
    HandlerFailed {
        /// The failing task id.
        task: u64,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A lane wait was aborted because a predecessor failed.
    #[error("lane aborted: predecessor task {0} did not complete")]
    LaneAborted(u64),
}

/// Errors raised by the service manager and its state machine.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Failed to spawn the service's process.
    #[error("failed to start service '{service}': {source}")]
    Spawn {
        /// The service that failed to start.
        service: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to signal a running service's process group.
    #[error("failed to signal service '{service}': {source}")]
    Signal {
        /// The service that could not be signaled.
        service: String,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// The named service is not known to the manager.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// The service's identity (uid/gid) could not be applied.
    #[error("failed to apply identity for service '{service}': {source}")]
    Identity {
        /// The service whose identity could not be applied.
        service: String,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// A mutex guarding service state was poisoned by a panicking holder.
    #[error("service state lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for ServiceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ServiceError::LockPoisoned(err.to_string())
    }
}

/// Errors raised by the reaper.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// A command was issued before `Reaper::start` or after `Reaper::stop`.
    #[error("reaper is not running")]
    NotRunning,

    /// Failed to spawn the requested command.
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    /// Failed to establish the child's own session/process group.
    #[error("failed to create process group: {0}")]
    Setsid(#[source] nix::errno::Errno),

    /// Failed to enable subreaper behavior on this platform.
    #[error("failed to register as subreaper: {0}")]
    Subreaper(#[source] nix::errno::Errno),
}

/// Crate-wide error type composed from each subsystem's error.
#[derive(Debug, Error)]
pub enum Error {
    /// An error in the plan combiner.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// An error in the state and task engine.
    #[error(transparent)]
    State(#[from] StateError),

    /// An error in the task runner.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// An error in the service manager.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// An error in the reaper.
    #[error(transparent)]
    Reaper(#[from] ReaperError),
}
