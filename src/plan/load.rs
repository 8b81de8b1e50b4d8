//! Discovers plan layer files on disk and combines them into a [`Plan`].
//!
//! Grounded on `config.rs::load_config`'s shape (read file -> expand env
//! vars -> deserialize), generalized from a single config file to a
//! directory of numerically-prefixed layer files (`00-base.yaml`,
//! `10-overrides.yaml`, ...), combined in filename order.

use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::PlanError;

use super::{Layer, Plan};

/// Expands `$VAR` / `${VAR}` references against the process environment,
/// mirroring `config.rs::expand_env_vars`. Missing variables are left
/// untouched rather than panicking, since plan layers may be validated
/// outside the environment they'll eventually run in.
fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let name = &caps[1];
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

/// Reads and parses a single layer file, expanding environment variables
/// first.
pub fn load_layer_file(path: &Path) -> Result<Layer, PlanError> {
    let content = fs::read_to_string(path)?;
    let expanded = expand_env_vars(&content);
    Layer::parse_yaml(&expanded)
}

/// Discovers `*.yaml`/`*.yml` files directly under `dir`, orders them by
/// filename (so a `00-base.yaml`/`10-overrides.yaml` naming convention
/// controls layer precedence), and combines them into one [`Plan`].
pub fn load_dir(dir: &Path) -> Result<Plan, PlanError> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")))
        .collect();
    paths.sort();

    let mut layers = Vec::with_capacity(paths.len());
    for path in &paths {
        layers.push(load_layer_file(path)?);
    }
    Plan::combine(&layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn expands_braced_and_bare_vars() {
        unsafe {
            std::env::set_var("SYSTEMG_CORE_TEST_VAR", "value");
        }
        let out = expand_env_vars("port: ${SYSTEMG_CORE_TEST_VAR}, alt: $SYSTEMG_CORE_TEST_VAR");
        assert_eq!(out, "port: value, alt: value");
        unsafe {
            std::env::remove_var("SYSTEMG_CORE_TEST_VAR");
        }
    }

    #[test]
    fn leaves_unknown_vars_untouched() {
        let out = expand_env_vars("x: ${SYSTEMG_CORE_DEFINITELY_UNSET}");
        assert_eq!(out, "x: ${SYSTEMG_CORE_DEFINITELY_UNSET}");
    }

    #[test]
    fn loads_layers_in_filename_order() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("00-base.yaml"),
            "services:\n  web:\n    command: { base: [\"nginx\"] }\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("10-override.yaml"),
            "services:\n  web:\n    override: merge\n    environment: { A: \"1\" }\n",
        )
        .unwrap();

        let plan = load_dir(dir.path()).unwrap();
        let web = &plan.services()["web"];
        assert_eq!(web.command.base, vec!["nginx"]);
        assert_eq!(web.environment.get("A").unwrap(), "1");
    }
}
