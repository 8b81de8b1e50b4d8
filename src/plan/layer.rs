//! A single plan layer as parsed from YAML, before combination.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::identity::Identity;

/// How an entry that also appears in an earlier layer should be combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Override {
    /// Field-level union with the earlier layer's entry.
    Merge,
    /// Discard the earlier layer's entry entirely.
    Replace,
}

/// What to do when a service's process exits or a check against it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceAction {
    /// Restart the service (subject to backoff).
    Restart,
    /// Leave the service stopped; take no further action.
    Ignore,
    /// Shut down the whole supervisor.
    Shutdown,
    /// Shut down the whole supervisor, but only on a non-error exit.
    SuccessShutdown,
    /// Shut down the whole supervisor, but only on an error exit.
    FailureShutdown,
    /// No action configured; caller falls back to its own default.
    Unset,
}

impl Default for ServiceAction {
    fn default() -> Self {
        ServiceAction::Unset
    }
}

/// Whether a service starts automatically when the supervisor boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Startup {
    /// Started automatically at boot and by `Ensure`.
    Enabled,
    /// Only started when explicitly requested.
    Disabled,
}

impl Default for Startup {
    fn default() -> Self {
        Startup::Enabled
    }
}

/// The command a service runs, split into the configured base and any
/// caller-supplied extra arguments (kept separate so `user_args` can be
/// replaced independently during a merge).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// The argv used to exec the service, e.g. `["nginx", "-g", "daemon off;"]`.
    #[serde(default)]
    pub base: Vec<String>,
    /// Extra arguments appended after `base`.
    #[serde(default)]
    pub user_args: Vec<String>,
}

impl Command {
    /// The full argv.
    pub fn argv(&self) -> Vec<String> {
        self.base.iter().chain(self.user_args.iter()).cloned().collect()
    }
}

/// One service's configuration as it appears in a single layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Merge discipline relative to earlier layers. Required unless this is
    /// the entry's first appearance.
    #[serde(rename = "override")]
    pub override_mode: Option<Override>,
    /// The command to run.
    #[serde(default)]
    pub command: Command,
    /// Working directory, if not the supervisor's own.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Environment variables merged over the supervisor's own environment.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// The identity to run the service's process as.
    #[serde(default)]
    pub identity: Option<Identity>,
    /// A named workload table entry to source identity/environment from.
    #[serde(default)]
    pub workload: Option<String>,
    /// Whether this service starts automatically.
    #[serde(default)]
    pub startup: Option<Startup>,
    /// Services that must reach `Running` before this one starts.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Services this one must start after, without requiring them.
    #[serde(default)]
    pub after: Vec<String>,
    /// Services this one must start before.
    #[serde(default)]
    pub before: Vec<String>,
    /// Action on a successful exit.
    #[serde(default)]
    pub on_success: ServiceAction,
    /// Action on a failing exit.
    #[serde(default)]
    pub on_failure: ServiceAction,
    /// Action per named check failure.
    #[serde(default)]
    pub on_check_failure: HashMap<String, ServiceAction>,
    /// Initial backoff delay, in seconds.
    #[serde(default)]
    pub backoff_delay_secs: Option<f64>,
    /// Backoff growth factor.
    #[serde(default)]
    pub backoff_factor: Option<f64>,
    /// Backoff ceiling, in seconds.
    #[serde(default)]
    pub backoff_limit_secs: Option<f64>,
    /// Delay before escalating SIGTERM to SIGKILL, in seconds.
    #[serde(default)]
    pub kill_delay_secs: Option<f64>,
}

/// A named check as it appears in a layer. Execution lives outside this
/// crate; only enough shape is kept to validate references to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckEntry {
    /// Merge discipline relative to earlier layers.
    #[serde(rename = "override")]
    pub override_mode: Option<Override>,
    /// Free-form check configuration, opaque to this crate.
    #[serde(flatten)]
    pub config: HashMap<String, serde_yaml::Value>,
}

/// A named log target as it appears in a layer. Forwarding lives outside
/// this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTargetEntry {
    /// Merge discipline relative to earlier layers.
    #[serde(rename = "override")]
    pub override_mode: Option<Override>,
    /// Free-form log target configuration, opaque to this crate.
    #[serde(flatten)]
    pub config: HashMap<String, serde_yaml::Value>,
}

/// A named workload: a reusable identity + environment bundle a service can
/// reference by name instead of repeating inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadEntry {
    /// The identity processes using this workload run as.
    #[serde(default)]
    pub identity: Option<Identity>,
    /// Environment variables contributed by this workload.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// A single parsed layer file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Layer {
    /// One-line human summary of the layer.
    #[serde(default)]
    pub summary: Option<String>,
    /// Longer free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Service entries this layer contributes.
    #[serde(default)]
    pub services: HashMap<String, ServiceEntry>,
    /// Check entries this layer contributes.
    #[serde(default)]
    pub checks: HashMap<String, CheckEntry>,
    /// Log target entries this layer contributes.
    #[serde(default)]
    pub log_targets: HashMap<String, LogTargetEntry>,
    /// Named workload bundles this layer contributes.
    #[serde(default)]
    pub workloads: HashMap<String, WorkloadEntry>,
}

impl Layer {
    /// Parses one layer file's contents.
    pub fn parse_yaml(raw: &str) -> Result<Layer, PlanError> {
        let layer: Layer = serde_yaml::from_str(raw)?;
        Ok(layer)
    }
}
