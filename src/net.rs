// SPDX-License-Identifier: MIT OR Apache-2.0
//! Network service interface and a recording in-memory implementation.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, TxError};
use crate::msg::Message;
use crate::NodeId;

/// Typed message send to a peer node. Fire-and-forget: the RM logs a send
/// failure and relies on timers to recover, it never blocks or retries.
pub trait NetService: Send + Sync {
    fn send(&self, dest: NodeId, msg: Message) -> Result<()>;
}

/// Records every outbound message for inspection; can inject send failures.
#[derive(Default)]
pub struct MemoryNetService {
    sent: Mutex<Vec<(NodeId, Message)>>,
    fail_sends: AtomicBool,
}

impl MemoryNetService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Every message sent so far, in order.
    pub fn sent(&self) -> Vec<(NodeId, Message)> {
        self.sent.lock().clone()
    }

    /// Drain the outbox.
    pub fn take(&self) -> Vec<(NodeId, Message)> {
        std::mem::take(&mut self.sent.lock())
    }

    /// Messages addressed to one node.
    pub fn sent_to(&self, dest: NodeId) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|(d, _)| *d == dest)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl NetService for MemoryNetService {
    fn send(&self, dest: NodeId, msg: Message) -> Result<()> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(TxError::Network(format!(
                "send to node {dest} failed (injected)"
            )));
        }
        self.sent.lock().push((dest, msg));
        Ok(())
    }
}
