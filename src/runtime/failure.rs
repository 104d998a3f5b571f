//! Failure routing boundary
//!
//! Corruption is detected, never repaired: any internal recovery would act on
//! possibly-corrupted data. Every fault raised inside a dispatch is caught
//! once, at the top, and handed to the runtime's [`FailureHandler`]. The
//! default handler treats corruption as locally non-recoverable and
//! terminates the process — only an external restart or failover is safe.

use tracing::error;

use super::error::RuntimeError;

/// Boundary hook receiving every fault raised during dispatch.
pub trait FailureHandler: Send {
    /// React to a detected fault. Called at most once per dispatch.
    fn handle_failure(&self, error: RuntimeError);
}

/// Default failure handler: log the fault and terminate the process.
#[derive(Debug, Default)]
pub struct CrashFailureHandler;

impl FailureHandler for CrashFailureHandler {
    fn handle_failure(&self, error: RuntimeError) {
        error!(%error, "corruption detected, terminating process");
        std::process::exit(1);
    }
}
