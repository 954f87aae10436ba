// SPDX-License-Identifier: MIT OR Apache-2.0
//! Write-ahead log handoff for RM phase transitions.
//!
//! The RM stages operations and a terminal command per phase, converts the
//! stage to binary form, and hands it to the log. Durability is signalled
//! back asynchronously via `RmHandle::on_log_entry_commit`; the RM never
//! blocks on the log.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::context::RmHandle;
use crate::error::Result;
use crate::msg::TxOperation;
use crate::Xid;

/// Terminal command stamped on a staged log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxCmdType {
    RmCommit,
    RmAbort,
    RmPrepareCommit,
    RmPrepareAbort,
}

impl TxCmdType {
    pub fn as_str(self) -> &'static str {
        match self {
            TxCmdType::RmCommit => "RM_COMMIT",
            TxCmdType::RmAbort => "RM_ABORT",
            TxCmdType::RmPrepareCommit => "RM_PREPARE_COMMIT",
            TxCmdType::RmPrepareAbort => "RM_PREPARE_ABORT",
        }
    }
}

/// A staged log entry: buffered write operations plus, once the phase is
/// decided, exactly one terminal command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLogEntry {
    pub xid: Xid,
    pub cmd: Option<TxCmdType>,
    pub operations: Vec<TxOperation>,
}

impl TxLogEntry {
    /// Binary form handed to the log.
    pub fn encode(&self) -> Result<TxLogBinary> {
        Ok(TxLogBinary {
            xid: self.xid,
            cmd: self.cmd,
            data: bincode::serialize(self)?,
        })
    }
}

/// Binary log record. `xid` and `cmd` ride alongside the payload so the log
/// can route its commit callback without decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLogBinary {
    pub xid: Xid,
    pub cmd: Option<TxCmdType>,
    pub data: Vec<u8>,
}

impl TxLogBinary {
    pub fn decode(&self) -> Result<TxLogEntry> {
        Ok(bincode::deserialize(&self.data)?)
    }
}

/// Write-ahead log interface as seen by the RM.
///
/// `append` is fire-and-forget; the log invokes
/// `waiter.on_log_entry_commit(cmd, ts)` once per entry carrying a terminal
/// command, after that entry is durable.
pub trait WriteAheadLog: Send + Sync {
    fn append(&self, entries: Vec<TxLogBinary>, waiter: RmHandle);
}

/// In-memory log for tests and single-process deployments.
///
/// In auto-commit mode every appended entry is immediately durable and the
/// waiter is notified inline. In manual mode entries queue until the test
/// drives `commit_next` / `commit_all`, which is how slow-durability
/// interleavings (duplicate TM decisions, timeouts mid-phase) are exercised.
pub struct MemoryWal {
    auto_commit: bool,
    pending: Mutex<VecDeque<(TxLogBinary, RmHandle)>>,
    committed: Mutex<Vec<TxLogBinary>>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self {
            auto_commit: true,
            pending: Mutex::new(VecDeque::new()),
            committed: Mutex::new(Vec::new()),
        }
    }

    /// A log whose entries only become durable when the test says so.
    pub fn manual() -> Self {
        Self {
            auto_commit: false,
            ..Self::new()
        }
    }

    /// Durable entries, in append order.
    pub fn entries(&self) -> Vec<TxLogBinary> {
        self.committed.lock().clone()
    }

    /// Entries appended but not yet durable (manual mode).
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Make the oldest pending entry durable and notify its waiter.
    /// Returns false when nothing is pending.
    pub fn commit_next(&self) -> bool {
        let Some((entry, waiter)) = self.pending.lock().pop_front() else {
            return false;
        };
        let cmd = entry.cmd;
        self.committed.lock().push(entry);
        if let Some(cmd) = cmd {
            waiter.on_log_entry_commit(cmd, Instant::now());
        }
        true
    }

    /// Drain every pending entry in order.
    pub fn commit_all(&self) {
        while self.commit_next() {}
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteAheadLog for MemoryWal {
    fn append(&self, entries: Vec<TxLogBinary>, waiter: RmHandle) {
        if self.auto_commit {
            for entry in entries {
                let cmd = entry.cmd;
                self.committed.lock().push(entry);
                if let Some(cmd) = cmd {
                    waiter.on_log_entry_commit(cmd, Instant::now());
                }
            }
        } else {
            let mut pending = self.pending.lock();
            for entry in entries {
                pending.push_back((entry, waiter.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{OpType, TupleRow};
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    fn entry(xid: Xid, cmd: Option<TxCmdType>) -> TxLogEntry {
        let mut op = TxOperation::new(OpType::Update, TupleRow::new(1, 1, 7, vec![1]));
        op.xid = xid;
        TxLogEntry {
            xid,
            cmd,
            operations: vec![op],
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let e = entry(9, Some(TxCmdType::RmCommit));
        let binary = e.encode().unwrap();
        assert_eq!(binary.xid, 9);
        assert_eq!(binary.cmd, Some(TxCmdType::RmCommit));
        assert_eq!(binary.decode().unwrap(), e);
    }

    #[test]
    fn test_cmd_type_as_str() {
        assert_eq!(TxCmdType::RmPrepareAbort.as_str(), "RM_PREPARE_ABORT");
        assert_eq!(TxCmdType::RmCommit.as_str(), "RM_COMMIT");
    }

    #[test]
    fn test_auto_commit_records_entries() {
        let wal = MemoryWal::new();
        let binary = entry(1, Some(TxCmdType::RmAbort)).encode().unwrap();
        let log = Arc::new(PlMutex::new(Vec::new()));

        wal.append(vec![binary], RmHandle::recording(Arc::clone(&log)));

        assert_eq!(wal.entries().len(), 1);
        assert_eq!(wal.pending_count(), 0);
    }

    #[test]
    fn test_manual_mode_queues_until_committed() {
        let wal = MemoryWal::manual();
        let binary = entry(1, Some(TxCmdType::RmCommit)).encode().unwrap();
        let log = Arc::new(PlMutex::new(Vec::new()));

        wal.append(vec![binary], RmHandle::recording(Arc::clone(&log)));
        assert_eq!(wal.pending_count(), 1);
        assert!(wal.entries().is_empty());

        assert!(wal.commit_next());
        assert_eq!(wal.pending_count(), 0);
        assert_eq!(wal.entries().len(), 1);
        assert!(!wal.commit_next());
    }

    #[test]
    fn test_commit_all_drains_in_order() {
        let wal = MemoryWal::manual();
        let log = Arc::new(PlMutex::new(Vec::new()));
        let handle = RmHandle::recording(Arc::clone(&log));

        wal.append(
            vec![
                entry(1, Some(TxCmdType::RmPrepareCommit)).encode().unwrap(),
                entry(1, Some(TxCmdType::RmCommit)).encode().unwrap(),
            ],
            handle,
        );
        wal.commit_all();

        let entries = wal.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cmd, Some(TxCmdType::RmPrepareCommit));
        assert_eq!(entries[1].cmd, Some(TxCmdType::RmCommit));
    }
}
