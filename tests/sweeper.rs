// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration tests for the registry-driven timeout sweeper.

use std::sync::Arc;
use std::time::Duration;

use shard_tx::{
    start_timeout_sweeper, ErrCode, MemoryAccessCache, MemoryLockManager, MemoryNetService,
    MemoryWal, Message, OpType, RmConfig, RmRegistry, RmServices, RmState, TupleRow, TxContext,
    TxOperation, TxRequest,
};

const CLIENT: u32 = 100;
const DSB: u32 = 5;

struct Node {
    lock_mgr: Arc<MemoryLockManager>,
    access: Arc<MemoryAccessCache>,
    net: Arc<MemoryNetService>,
    wal: Arc<MemoryWal>,
}

impl Node {
    fn new() -> Self {
        Self {
            lock_mgr: Arc::new(MemoryLockManager::new()),
            access: Arc::new(MemoryAccessCache::new()),
            net: Arc::new(MemoryNetService::new()),
            wal: Arc::new(MemoryWal::new()),
        }
    }

    fn services(&self) -> RmServices {
        RmServices {
            lock_mgr: Arc::clone(&self.lock_mgr) as _,
            access: Arc::clone(&self.access) as _,
            service: Arc::clone(&self.net) as _,
            wal: Arc::clone(&self.wal) as _,
            detector: None,
        }
    }

    fn rm(&self, xid: u64, timeout_ms: u64) -> Arc<TxContext> {
        TxContext::new(
            RmConfig::new(xid, 1)
                .with_dsb_node(DSB)
                .with_timeout_ms(timeout_ms),
            self.services(),
            None,
        )
    }
}

fn op(key: u64, tuple: Vec<u8>) -> TxOperation {
    TxOperation::new(OpType::Update, TupleRow::new(1, 1, key, tuple))
}

fn request(ops: Vec<TxOperation>) -> TxRequest {
    TxRequest {
        source: CLIENT,
        distributed: false,
        oneshot: true,
        read_only: false,
        operations: ops,
    }
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_aborts_stuck_transaction() {
    let node = Node::new();
    let registry = Arc::new(RmRegistry::new());

    // A transaction parked forever on a lock held by another one.
    let blocker = node.rm(9, 60_000);
    blocker.process_tx_request(request(vec![op(7, vec![1])]));

    let stuck = node.rm(1, 0);
    stuck.process_tx_request(request(vec![op(7, vec![2])]));
    assert_eq!(stuck.state(), RmState::Idle);

    registry.insert(&blocker);
    registry.insert(&stuck);

    let handle = start_timeout_sweeper(Arc::clone(&registry), 10);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(stuck.state(), RmState::Ended);
    let responses: Vec<_> = node
        .net
        .sent_to(CLIENT)
        .into_iter()
        .filter_map(|m| match m {
            Message::ClientTxResponse(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].ec, ErrCode::TxAbort);

    // The blocker is inside its deadline and untouched.
    assert_eq!(blocker.state(), RmState::Idle);

    // Ended transactions are purged from the registry.
    assert!(registry.get(1).is_none());
    assert_eq!(registry.len(), 1);

    assert!(handle.is_running());
    handle.shutdown().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_leaves_healthy_registry_alone() {
    let node = Node::new();
    let registry = Arc::new(RmRegistry::new());

    let rm = node.rm(1, 60_000);
    rm.process_tx_request(request(vec![op(7, vec![1])]));
    registry.insert(&rm);

    let handle = start_timeout_sweeper(Arc::clone(&registry), 10);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(rm.state(), RmState::Idle);
    assert_eq!(registry.len(), 1);
    handle.shutdown().await;
}
