//! The interface contract between the service manager and an external
//! check engine. Check execution (scheduling, timeouts, HTTP/exec/TCP
//! probes) is an out-of-scope external collaborator per the project's
//! scope; this module only specifies the shape the collaborator talks to.

use std::sync::Arc;

use crate::service::ServiceManager;

/// Implemented by whatever runs checks, to report a failure back into the
/// service manager so `on_check_failure` actions can apply.
pub trait CheckFailureSink {
    /// Reports that `check` failed against `service`.
    fn check_failed(&self, service: &str, check: &str);
}

impl CheckFailureSink for Arc<ServiceManager> {
    fn check_failed(&self, service: &str, check: &str) {
        ServiceManager::check_failed(self, service, check);
    }
}
