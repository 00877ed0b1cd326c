//! Per-session run state machine (SPEC_FULL §4.4): `Idle → Running →
//! {Paused ↔ Running} → (Stopped | Done)`.

use tabline_core::RunState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Done,
}

/// Wraps `tabline_core::RunState`, enforcing the invariant that every
/// mutator keeps `stopped ⇒ !running` true by construction rather than by
/// caller discipline.
#[derive(Default)]
pub struct SessionRunState {
    inner: RunState,
}

impl SessionRunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> LoopStatus {
        if self.inner.stopped {
            LoopStatus::Stopped
        } else if self.inner.paused {
            LoopStatus::Paused
        } else if self.inner.running {
            LoopStatus::Running
        } else {
            LoopStatus::Idle
        }
    }

    pub fn inner(&self) -> &RunState {
        &self.inner
    }

    /// `setRunning(sessionId, true)` (SPEC_FULL §4.4).
    pub fn set_running(&mut self, running: bool) {
        self.inner.running = running;
        self.inner.assert_invariant();
    }

    pub fn pause(&mut self) {
        self.inner.paused = true;
    }

    pub fn resume(&mut self) {
        self.inner.paused = false;
    }

    /// `stopped` is a latch: forbids all further steps until `restart`.
    pub fn stop(&mut self) {
        self.inner.stopped = true;
        self.inner.running = false;
        self.inner.assert_invariant();
    }

    pub fn restart(&mut self) {
        self.inner.stopped = false;
        self.inner.paused = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused && !self.inner.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_always_clears_running() {
        let mut s = SessionRunState::new();
        s.set_running(true);
        s.stop();
        assert_eq!(s.status(), LoopStatus::Stopped);
        assert!(!s.inner().running);
    }

    #[test]
    fn restart_clears_stopped_and_paused() {
        let mut s = SessionRunState::new();
        s.stop();
        s.pause();
        s.restart();
        assert!(!s.is_stopped());
        assert!(!s.is_paused());
    }

    #[test]
    fn paused_while_stopped_reports_stopped() {
        let mut s = SessionRunState::new();
        s.set_running(true);
        s.pause();
        s.stop();
        assert_eq!(s.status(), LoopStatus::Stopped);
    }
}
