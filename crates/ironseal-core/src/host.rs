//! Host-side effects the runtime needs: networking, power and signal policy.

use crate::error::IronsealResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Host operations driven by the unlock state machine.
///
/// Callers treat networking toggles and power-off as best-effort: failures
/// are logged, never propagated to the user.
pub trait HostControl: Send + Sync {
    fn set_networking(&self, enabled: bool) -> IronsealResult<()>;

    fn power_off(&self) -> IronsealResult<()>;

    /// Hypervisor name, or `None` on bare metal.
    fn virtualization(&self) -> IronsealResult<Option<String>>;
}

/// How the process reacts to a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Shut down cleanly.
    Handle,
    /// Drop the request; an image is being applied.
    Ignore,
}

/// Shared switch read by the signal handler and flipped around apply jobs.
#[derive(Debug, Clone, Default)]
pub struct TerminationControl(Arc<AtomicBool>);

impl TerminationControl {
    pub fn mode(&self) -> TerminationMode {
        if self.0.load(Ordering::SeqCst) {
            TerminationMode::Ignore
        } else {
            TerminationMode::Handle
        }
    }

    /// Switch to `Ignore` until the returned guard drops.
    pub fn ignore(&self) -> TerminationGuard {
        self.0.store(true, Ordering::SeqCst);
        TerminationGuard(self.clone())
    }
}

pub struct TerminationGuard(TerminationControl);

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        (self.0).0.store(false, Ordering::SeqCst);
    }
}
