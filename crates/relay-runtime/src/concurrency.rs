//! Single-active-run guard.

use parking_lot::Mutex;
use relay_core::{RelayError, Result};
use std::sync::Arc;

use crate::session::RunStateManager;

#[derive(Default)]
struct GuardState {
    running: bool,
    latest: Option<RunStateManager>,
}

/// Admits at most one run of an agent instance at a time.
///
/// The flag is read and set under one lock; a second caller is refused rather
/// than queued.
#[derive(Clone, Default)]
pub struct RunGuard {
    state: Arc<Mutex<GuardState>>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the agent for a run whose state is tracked by `run_state`.
    pub fn try_acquire(&self, agent_id: &str, run_state: &RunStateManager) -> Result<RunPermit> {
        let mut state = self.state.lock();
        if state.running {
            return Err(RelayError::AlreadyRunning {
                agent_id: agent_id.to_string(),
            });
        }
        state.running = true;
        state.latest = Some(run_state.clone());
        Ok(RunPermit {
            state: Arc::clone(&self.state),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// State of the most recently admitted run.
    pub fn latest(&self) -> Option<RunStateManager> {
        self.state.lock().latest.clone()
    }
}

/// Proof of admission. Dropping it clears the running flag.
pub struct RunPermit {
    state: Arc<Mutex<GuardState>>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.state.lock().running = false;
    }
}
