//! Per-session run registry.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::run::RunHandle;

/// Tracks the current run of every session, plus a lane lock that
/// serializes start/cancel/resume for the same session.
#[derive(Default)]
pub struct RunRegistry {
    /// Current run per session.
    runs: DashMap<String, Arc<RunHandle>>,
    /// Per-session operation lanes. Evicted once nobody holds or awaits them.
    lanes: DashMap<String, Arc<Mutex<()>>>,
    /// Last producer epoch handed out per session.
    epochs: DashMap<String, u64>,
}

/// Exclusive hold on a session lane. Dropping it releases the lane and
/// evicts it when no other task is waiting.
pub struct LaneGuard<'a> {
    registry: &'a RunRegistry,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.registry
            .lanes
            .remove_if(&self.session_id, |_, lane| Arc::strong_count(lane) == 1);
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.get(session_id).map(|h| Arc::clone(h.value()))
    }

    /// Install `handle` as the session's run, returning the one it replaced.
    pub fn set(&self, session_id: &str, handle: Arc<RunHandle>) -> Option<Arc<RunHandle>> {
        self.runs.insert(session_id.to_string(), handle)
    }

    /// Remove the session's run only if it is still `handle`. A run that
    /// was superseded must not remove its successor.
    pub fn remove_if_current(&self, session_id: &str, handle: &Arc<RunHandle>) -> bool {
        self.runs
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    /// Acquire the lock serializing lifecycle operations on one session.
    pub async fn lock_lane(&self, session_id: &str) -> LaneGuard<'_> {
        let lane = Arc::clone(
            self.lanes
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        LaneGuard {
            registry: self,
            session_id: session_id.to_string(),
            guard: Some(lane.lock_owned().await),
        }
    }

    /// Next producer epoch for the session. Epochs only grow, also across
    /// a delete, so a recreated stream never sees a reused epoch.
    pub fn next_epoch(&self, session_id: &str) -> u64 {
        let mut epoch = self.epochs.entry(session_id.to_string()).or_insert(0);
        *epoch += 1;
        *epoch
    }

    pub fn active_runs(&self) -> Vec<Arc<RunHandle>> {
        self.runs.iter().map(|h| Arc::clone(h.value())).collect()
    }

    pub fn active_count(&self) -> usize {
        self.runs.len()
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}
