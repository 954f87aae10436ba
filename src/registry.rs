// SPDX-License-Identifier: MIT OR Apache-2.0
//! Live-RM registry and the periodic timeout sweeper.
//!
//! The registry maps xid to a weak context handle so a node can route TM
//! decisions and DSB responses, and so the sweeper can visit every live
//! transaction without keeping finished ones alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::context::{RmState, TxContext};
use crate::Xid;

/// Weak map of live RMs on one node.
#[derive(Default)]
pub struct RmRegistry {
    rms: DashMap<Xid, Weak<TxContext>>,
}

impl RmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ctx: &Arc<TxContext>) {
        self.rms.insert(ctx.xid(), Arc::downgrade(ctx));
    }

    pub fn remove(&self, xid: Xid) {
        self.rms.remove(&xid);
    }

    pub fn get(&self, xid: Xid) -> Option<Arc<TxContext>> {
        self.rms.get(&xid).and_then(|weak| weak.upgrade())
    }

    pub fn len(&self) -> usize {
        self.rms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rms.is_empty()
    }

    /// Fire `timeout_clean_up` on every live, unfinished RM.
    pub fn sweep_timeouts(&self) {
        for entry in self.rms.iter() {
            if let Some(ctx) = entry.value().upgrade() {
                if ctx.state() != RmState::Ended {
                    ctx.timeout_clean_up();
                }
            }
        }
    }

    /// Drop entries whose RM is gone or ended. Returns how many were removed.
    pub fn purge_ended(&self) -> usize {
        let before = self.rms.len();
        self.rms.retain(|_, weak| {
            weak.upgrade()
                .is_some_and(|ctx| ctx.state() != RmState::Ended)
        });
        before - self.rms.len()
    }
}

/// Control handle for a running sweeper task.
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    running: Arc<AtomicBool>,
}

impl SweeperHandle {
    /// Stop the sweeper after its current tick.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Start a background task that sweeps the registry every `interval_ms`.
pub fn start_timeout_sweeper(registry: Arc<RmRegistry>, interval_ms: u64) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    registry.sweep_timeouts();
                    registry.purge_ended();
                }
                _ = shutdown_rx.recv() => {
                    running_clone.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    });

    SweeperHandle {
        shutdown_tx,
        running,
    }
}
