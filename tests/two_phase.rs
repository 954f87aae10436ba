// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration tests for 2PC cohort participation.
//!
//! Covers:
//! - Prepare-commit vote, TM commit decision, final ACK
//! - Prepare-abort vote after a failed operation
//! - Duplicate TM decisions re-sending the appropriate reply
//! - Victim escalation to the TM
//! - Timeout-driven phase-2 abort

use std::sync::Arc;

use shard_tx::{
    AccessCache, ErrCode, MemoryAccessCache, MemoryLockManager, MemoryNetService, MemoryWal,
    Message, OpType, RmConfig, RmServices, RmState, TupleRow, TxCmdType, TxContext, TxOperation,
    TxRequest, TxTmAbort, TxTmCommit,
};

const TM: u32 = 9;
const DSB: u32 = 5;

struct Node {
    lock_mgr: Arc<MemoryLockManager>,
    access: Arc<MemoryAccessCache>,
    net: Arc<MemoryNetService>,
    wal: Arc<MemoryWal>,
}

impl Node {
    fn new() -> Self {
        Self::with_wal(MemoryWal::new())
    }

    fn manual() -> Self {
        Self::with_wal(MemoryWal::manual())
    }

    fn with_wal(wal: MemoryWal) -> Self {
        Self {
            lock_mgr: Arc::new(MemoryLockManager::new()),
            access: Arc::new(MemoryAccessCache::new()),
            net: Arc::new(MemoryNetService::new()),
            wal: Arc::new(wal),
        }
    }

    fn rm(&self, xid: u64) -> Arc<TxContext> {
        TxContext::new(
            RmConfig::new(xid, 2).with_dsb_node(DSB).with_distributed(true),
            RmServices {
                lock_mgr: Arc::clone(&self.lock_mgr) as _,
                access: Arc::clone(&self.access) as _,
                service: Arc::clone(&self.net) as _,
                wal: Arc::clone(&self.wal) as _,
                detector: None,
            },
            None,
        )
    }

    fn prepares(&self) -> Vec<(bool, bool)> {
        self.net
            .sent_to(TM)
            .into_iter()
            .filter_map(|m| match m {
                Message::TxRmPrepare(p) => Some((p.commit, p.telemetry.is_some())),
                _ => None,
            })
            .collect()
    }

    fn acks(&self) -> Vec<bool> {
        self.net
            .sent_to(TM)
            .into_iter()
            .filter_map(|m| match m {
                Message::TxRmAck(a) => Some(a.commit),
                _ => None,
            })
            .collect()
    }

    fn victims(&self) -> usize {
        self.net
            .sent_to(TM)
            .into_iter()
            .filter(|m| matches!(m, Message::TxVictim(_)))
            .count()
    }
}

fn op(op_type: OpType, key: u64, tuple: Vec<u8>) -> TxOperation {
    TxOperation::new(op_type, TupleRow::new(1, 1, key, tuple))
}

fn request(ops: Vec<TxOperation>) -> TxRequest {
    TxRequest {
        source: TM,
        distributed: true,
        oneshot: true,
        read_only: false,
        operations: ops,
    }
}

#[test]
fn test_distributed_commit_flow() {
    let node = Node::new();
    node.access.put(1, 1, 7, vec![1]);
    let rm = node.rm(1);

    // Phase 1: all operations succeed, prepare is logged and voted.
    rm.process_tx_request(request(vec![op(OpType::Update, 7, vec![2])]));
    assert_eq!(rm.state(), RmState::PrepareCommitting);
    assert_eq!(node.prepares(), vec![(true, true)]);
    assert!(node.acks().is_empty());

    // Phase 2: the TM says commit.
    rm.handle_tx_tm_commit(&TxTmCommit { xid: 1 });
    assert_eq!(rm.state(), RmState::Ended);
    assert_eq!(node.acks(), vec![true]);

    // Log order: prepare entry with the buffered update, then the commit.
    let entries = node.wal.entries();
    assert_eq!(entries.len(), 2);
    let prepare = entries[0].decode().unwrap();
    assert_eq!(prepare.cmd, Some(TxCmdType::RmPrepareCommit));
    assert_eq!(prepare.operations.len(), 1);
    assert_eq!(prepare.operations[0].tuple_row.tuple, vec![2]);
    assert_eq!(entries[1].cmd, Some(TxCmdType::RmCommit));

    assert_eq!(node.lock_mgr.active_lock_count(), 0);
}

#[test]
fn test_failed_op_votes_prepare_abort() {
    let node = Node::new();
    node.access.put(1, 1, 7, vec![1]);
    let rm = node.rm(1);

    // Insert hits a cached duplicate: phase 1 votes abort, without telemetry.
    rm.process_tx_request(request(vec![op(OpType::Insert, 7, vec![2])]));
    assert_eq!(rm.state(), RmState::PrepareAborting);
    assert_eq!(node.prepares(), vec![(false, false)]);

    // The TM broadcasts abort; the RM logs it and ACKs.
    rm.handle_tx_tm_abort(&TxTmAbort { xid: 1 });
    assert_eq!(rm.state(), RmState::Ended);
    assert_eq!(rm.error_code(), ErrCode::Duplication);
    assert_eq!(node.acks(), vec![false]);

    let entries = node.wal.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].cmd, Some(TxCmdType::RmPrepareAbort));
    assert_eq!(entries[1].cmd, Some(TxCmdType::RmAbort));
    assert_eq!(node.lock_mgr.active_lock_count(), 0);
}

#[test]
fn test_duplicate_tm_commit_resends_ack() {
    let node = Node::manual();
    node.access.put(1, 1, 7, vec![1]);
    let rm = node.rm(1);

    rm.process_tx_request(request(vec![op(OpType::Update, 7, vec![2])]));
    // Prepare appended but not yet durable.
    assert_eq!(rm.state(), RmState::PrepareCommitting);
    assert!(node.prepares().is_empty());

    assert!(node.wal.commit_next());
    assert_eq!(node.prepares(), vec![(true, true)]);

    rm.handle_tx_tm_commit(&TxTmCommit { xid: 1 });
    assert_eq!(rm.state(), RmState::Committing);

    // The decision arrives again while the commit log is still in flight:
    // the RM re-acks, state unchanged.
    rm.handle_tx_tm_commit(&TxTmCommit { xid: 1 });
    assert_eq!(rm.state(), RmState::Committing);
    assert_eq!(node.acks(), vec![true]);

    node.wal.commit_all();
    assert_eq!(rm.state(), RmState::Ended);
    assert_eq!(node.acks(), vec![true, true]);
}

#[test]
fn test_duplicate_tm_abort_resends_ack() {
    let node = Node::new();
    node.access.put(1, 1, 7, vec![1]);
    let rm = node.rm(1);

    rm.process_tx_request(request(vec![op(OpType::Insert, 7, vec![2])]));
    rm.handle_tx_tm_abort(&TxTmAbort { xid: 1 });
    assert_eq!(rm.state(), RmState::Ended);
    assert_eq!(node.acks(), vec![false]);

    // Abort decisions re-delivered after the end re-send the negative ACK.
    rm.handle_tx_tm_abort(&TxTmAbort { xid: 1 });
    assert_eq!(node.acks(), vec![false, false]);
    assert_eq!(rm.state(), RmState::Ended);
}

#[test]
fn test_victim_escalates_to_tm() {
    let node = Node::new();

    // A local transaction holds the row's write lock.
    let blocker = node.rm(8);
    blocker.process_tx_request(request(vec![op(OpType::Update, 7, vec![1])]));
    assert_eq!(node.lock_mgr.active_lock_count(), 1);

    // The distributed transaction queues behind it and is picked as victim.
    let rm = node.rm(1);
    rm.process_tx_request(request(vec![op(OpType::Update, 7, vec![2])]));
    assert_eq!(node.lock_mgr.waiting_count(), 1);

    rm.abort(ErrCode::Victim);
    // No local transition: the TM drives phase 2.
    assert_eq!(rm.state(), RmState::Idle);
    assert_eq!(node.victims(), 1);
    assert!(!rm.is_victim());

    rm.handle_tx_tm_abort(&TxTmAbort { xid: 1 });
    assert_eq!(rm.state(), RmState::Ended);
    assert_eq!(node.acks(), vec![false]);
    assert_eq!(node.lock_mgr.waiting_count(), 0);
}

#[test]
fn test_timeout_drives_phase2_abort() {
    let node = Node::new();

    let blocker = node.rm(8);
    blocker.process_tx_request(request(vec![op(OpType::Update, 7, vec![1])]));

    let rm = TxContext::new(
        RmConfig::new(1, 2)
            .with_dsb_node(DSB)
            .with_distributed(true)
            .with_timeout_ms(0),
        RmServices {
            lock_mgr: Arc::clone(&node.lock_mgr) as _,
            access: Arc::clone(&node.access) as _,
            service: Arc::clone(&node.net) as _,
            wal: Arc::clone(&node.wal) as _,
            detector: None,
        },
        None,
    );
    rm.process_tx_request(request(vec![op(OpType::Update, 7, vec![2])]));

    rm.timeout_clean_up();
    assert_eq!(rm.state(), RmState::Ended);
    assert_eq!(node.acks(), vec![false]);
}

#[test]
fn test_timeout_spares_prepared_transactions() {
    let node = Node::new();
    node.access.put(1, 1, 7, vec![1]);
    let rm = TxContext::new(
        RmConfig::new(1, 2)
            .with_dsb_node(DSB)
            .with_distributed(true)
            .with_timeout_ms(0),
        RmServices {
            lock_mgr: Arc::clone(&node.lock_mgr) as _,
            access: Arc::clone(&node.access) as _,
            service: Arc::clone(&node.net) as _,
            wal: Arc::clone(&node.wal) as _,
            detector: None,
        },
        None,
    );

    rm.process_tx_request(request(vec![op(OpType::Update, 7, vec![2])]));
    assert_eq!(rm.state(), RmState::PrepareCommitting);

    // The prepare vote is out: only the TM may decide now.
    rm.timeout_clean_up();
    assert_eq!(rm.state(), RmState::PrepareCommitting);
    assert!(node.acks().is_empty());
}

#[test]
fn test_read_only_distributed_prepare() {
    let node = Node::new();
    node.access.put(1, 1, 7, vec![1]);
    let rm = node.rm(1);

    rm.process_tx_request(TxRequest {
        read_only: true,
        ..request(vec![op(OpType::Read, 7, vec![])])
    });
    assert_eq!(rm.state(), RmState::PrepareCommitting);
    assert_eq!(node.prepares(), vec![(true, true)]);

    rm.handle_tx_tm_commit(&TxTmCommit { xid: 1 });
    assert_eq!(rm.state(), RmState::Ended);
    assert_eq!(node.acks(), vec![true]);
    // Read-only: the lock manager was never involved.
    assert_eq!(node.lock_mgr.grant_count(), 0);
}
