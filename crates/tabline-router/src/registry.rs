//! Per-session runtime handles that must outlive any single `brain.run.*`
//! call: the shared `SessionControl` (so a queued steer/follow-up/stop
//! survives between runs, SPEC_FULL §4.4) and a single-flight run lock (so
//! two concurrent `brain.run.start` calls for the same session cannot both
//! drive the loop at once, SPEC_FULL §5 Concurrency).

use std::sync::Arc;

use dashmap::DashMap;
use tabline_agent::SessionControl;
use tabline_core::SessionId;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct SessionRuntimeRegistry {
    controls: DashMap<SessionId, Arc<AsyncMutex<SessionControl>>>,
    run_locks: DashMap<SessionId, Arc<AsyncMutex<()>>>,
}

impl SessionRuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared control handle for a session, creating one on first use.
    pub fn control_for(&self, id: &SessionId) -> Arc<AsyncMutex<SessionControl>> {
        self.controls
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(SessionControl::new())))
            .clone()
    }

    /// The run-lock handle for a session, creating one on first use. Callers
    /// take this with `try_lock_owned()` to get a single-flight guard that
    /// can be held across a spawned task without borrowing the registry.
    pub fn run_lock_for(&self, id: &SessionId) -> Arc<AsyncMutex<()>> {
        self.run_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn forget(&self, id: &SessionId) {
        self.controls.remove(id);
        self.run_locks.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_for_returns_the_same_handle_across_calls() {
        let registry = SessionRuntimeRegistry::new();
        let id = SessionId::new("s1");
        let a = registry.control_for(&id);
        let b = registry.control_for(&id);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn run_lock_rejects_a_second_concurrent_holder() {
        let registry = SessionRuntimeRegistry::new();
        let id = SessionId::new("s1");
        let lock = registry.run_lock_for(&id);
        let _guard = lock.clone().try_lock_owned().unwrap();
        assert!(lock.try_lock_owned().is_err());
    }

    #[test]
    fn forget_drops_both_handles() {
        let registry = SessionRuntimeRegistry::new();
        let id = SessionId::new("s1");
        let a = registry.control_for(&id);
        registry.forget(&id);
        let b = registry.control_for(&id);
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
