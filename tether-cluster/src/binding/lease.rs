//! Presence lease state
//!
//! ```text
//! Idle --grant--> Granted --first keep-alive ack--> Active
//!                                                     |
//!              +------- keep-alive stream ends -------+
//!              v
//!        Rebootstrapping --re-grant + ack--> Active
//!
//! any state --stop signal--> Shutdown
//! ```

use parking_lot::Mutex;

use crate::store::LeaseId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePhase {
    Idle,
    Granted,
    Active,
    Rebootstrapping,
    Shutdown,
}

#[derive(Debug)]
struct Snapshot {
    phase: LeasePhase,
    id: Option<LeaseId>,
}

/// Lease id and phase, written by the lease task and read by binding writes
#[derive(Debug)]
pub(crate) struct LeaseTracker {
    inner: Mutex<Snapshot>,
}

impl LeaseTracker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Snapshot {
                phase: LeasePhase::Idle,
                id: None,
            }),
        }
    }

    pub(crate) fn phase(&self) -> LeasePhase {
        self.inner.lock().phase
    }

    pub(crate) fn id(&self) -> Option<LeaseId> {
        self.inner.lock().id
    }

    pub(crate) fn granted(&self, id: LeaseId) {
        let mut snapshot = self.inner.lock();
        if snapshot.phase != LeasePhase::Shutdown {
            snapshot.phase = LeasePhase::Granted;
        }
        snapshot.id = Some(id);
    }

    pub(crate) fn activate(&self) {
        self.transition(LeasePhase::Active);
    }

    pub(crate) fn rebootstrapping(&self) {
        self.transition(LeasePhase::Rebootstrapping);
    }

    pub(crate) fn shutdown(&self) {
        self.inner.lock().phase = LeasePhase::Shutdown;
    }

    /// Shutdown is terminal
    fn transition(&self, phase: LeasePhase) {
        let mut snapshot = self.inner.lock();
        if snapshot.phase != LeasePhase::Shutdown {
            snapshot.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_transitions() {
        let tracker = LeaseTracker::new();
        assert_eq!(tracker.phase(), LeasePhase::Idle);
        assert_eq!(tracker.id(), None);

        tracker.granted(LeaseId(1));
        assert_eq!(tracker.phase(), LeasePhase::Granted);
        assert_eq!(tracker.id(), Some(LeaseId(1)));

        tracker.activate();
        assert_eq!(tracker.phase(), LeasePhase::Active);

        tracker.rebootstrapping();
        // The old id stays readable until a new lease is granted
        assert_eq!(tracker.id(), Some(LeaseId(1)));
        tracker.granted(LeaseId(2));
        tracker.activate();
        assert_eq!(tracker.id(), Some(LeaseId(2)));
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let tracker = LeaseTracker::new();
        tracker.shutdown();
        tracker.granted(LeaseId(3));
        tracker.activate();
        tracker.rebootstrapping();
        assert_eq!(tracker.phase(), LeasePhase::Shutdown);
    }
}
