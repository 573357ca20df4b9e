//! Per-phase reentrancy guards.
//!
//! Each pipeline phase owns one flag. A tick that finds the flag set skips
//! the phase instead of waiting for it, so a slow phase only blocks its own
//! next run.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct PhaseGuard {
    name: &'static str,
    busy: AtomicBool,
}

impl PhaseGuard {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enter the phase, or `None` if it is already running.
    pub fn try_enter(&self) -> Option<PhaseToken<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PhaseToken { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held while a phase runs. Dropping it releases the phase.
#[derive(Debug)]
pub struct PhaseToken<'a> {
    guard: &'a PhaseGuard,
}

impl Drop for PhaseToken<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// The guarded phases of one workflow.
#[derive(Debug)]
pub struct PhaseGuards {
    pub stage: PhaseGuard,
    pub claim: PhaseGuard,
    pub alert: PhaseGuard,
}

impl Default for PhaseGuards {
    fn default() -> Self {
        Self {
            stage: PhaseGuard::new("stage"),
            claim: PhaseGuard::new("claim"),
            alert: PhaseGuard::new("alert"),
        }
    }
}
