// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deadlock-detector interface as seen by the RM.
//!
//! Detection itself (wait-for graph maintenance, cycle search, victim
//! selection) lives outside the RM; the RM only reports transaction
//! completion so the detector can purge wait edges. Victim decisions come
//! back through the ordinary lock-grant channel as `ErrCode::Victim`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::Xid;

/// Completion sink for the wait-for graph.
pub trait DeadlockDetector: Send + Sync {
    /// Called exactly once when a transaction reaches its terminal state.
    fn tx_finish(&self, xid: Xid);
}

/// Detector that ignores completions (deadlock handling by timeout only).
#[derive(Debug, Default)]
pub struct NoopDeadlockDetector;

impl DeadlockDetector for NoopDeadlockDetector {
    fn tx_finish(&self, _xid: Xid) {}
}

/// Detector that counts completions, for tests asserting exactly-once
/// notification.
#[derive(Debug, Default)]
pub struct CountingDeadlockDetector {
    finished: AtomicU64,
}

impl CountingDeadlockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished_count(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }
}

impl DeadlockDetector for CountingDeadlockDetector {
    fn tx_finish(&self, _xid: Xid) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }
}
