// SPDX-License-Identifier: MIT OR Apache-2.0
//! shard_tx - resource-manager transaction contexts for a sharded OLTP database.
//!
//! One `TxContext` drives one transaction on one node from first operation
//! to final release: row-lock acquisition, cache reads with read-through to
//! the durable shard backend, write-ahead logging, and, for distributed
//! transactions, two-phase commit participation under a remote transaction
//! manager.
//!
//! # Architecture
//!
//! ```text
//! TxContext (one per xid per node)
//!   ├── LockManager      (row locks, async grant, early release)
//!   ├── AccessCache      (per-node tuple cache, read-through target)
//!   ├── NetService       (DSB reads, TM traffic, client reply)
//!   ├── WriteAheadLog    (phase durability, async commit callback)
//!   └── DeadlockDetector (completion purge)
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use shard_tx::{
//!     MemoryAccessCache, MemoryLockManager, MemoryNetService, MemoryWal, OpType, RmConfig,
//!     RmServices, RmState, TupleRow, TxContext, TxOperation, TxRequest,
//! };
//!
//! let access = Arc::new(MemoryAccessCache::new());
//! access.put(1, 1, 7, vec![1, 2, 3]);
//!
//! let rm = TxContext::new(
//!     RmConfig::new(/*xid=*/ 1, /*node_id=*/ 1),
//!     RmServices {
//!         lock_mgr: Arc::new(MemoryLockManager::new()),
//!         access,
//!         service: Arc::new(MemoryNetService::new()),
//!         wal: Arc::new(MemoryWal::new()),
//!         detector: None,
//!     },
//!     None,
//! );
//!
//! rm.process_tx_request(TxRequest {
//!     source: 100,
//!     distributed: false,
//!     oneshot: true,
//!     read_only: false,
//!     operations: vec![TxOperation::new(OpType::Read, TupleRow::new(1, 1, 7, vec![]))],
//! });
//! assert_eq!(rm.state(), RmState::Ended);
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod access;
pub mod context;
pub mod deadlock;
pub mod dependency;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod msg;
pub mod net;
pub mod registry;
pub mod wal;

// Re-exports
pub use access::{AccessCache, MemoryAccessCache};
pub use context::{RmConfig, RmHandle, RmServices, RmState, TxContext, TxStateCallback};
pub use deadlock::{CountingDeadlockDetector, DeadlockDetector, NoopDeadlockDetector};
pub use error::{ErrCode, Result, TxError};
pub use lock::{LockItem, LockManager, LockMode, MemoryLockManager, Predicate, Violation};
pub use metrics::{PhaseTimer, TxTelemetry};
pub use msg::{
    ClientTxResponse, DsbReadRequest, DsbReadResponse, Message, OpType, PrepareTelemetry,
    TupleRow, TxEnableViolate, TxOperation, TxRequest, TxRmAck, TxRmPrepare, TxTmAbort,
    TxTmCommit, TxVictim,
};
pub use net::{MemoryNetService, NetService};
pub use registry::{start_timeout_sweeper, RmRegistry, SweeperHandle};
pub use wal::{MemoryWal, TxCmdType, TxLogBinary, TxLogEntry, WriteAheadLog};

/// Transaction identifier, unique across the cluster.
pub type Xid = u64;
/// Node identifier; zero is reserved.
pub type NodeId = u32;
/// Table identifier.
pub type TableId = u32;
/// Shard identifier; each shard has exactly one owning node.
pub type ShardId = u32;
/// Row identifier within a table.
pub type TupleId = u64;
/// Per-transaction monotonic operation identifier.
pub type Oid = u32;
/// Configuration epoch stamped on DSB requests.
pub type Cno = u64;
/// Row payload bytes.
pub type Tuple = Vec<u8>;

/// Default time a transaction may run before the sweeper aborts it.
pub const TX_TIMEOUT_MILLIS: u64 = 10_000;

/// Replication group owning a node. Groups map 1:1 to nodes here;
/// topology-aware grouping belongs to the routing layer.
pub fn replication_group_of(node_id: NodeId) -> u32 {
    node_id
}

/// Deployment flavor, resolved at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmMode {
    /// Shards are partitioned across nodes with no shared storage;
    /// distributed transactions run 2PC.
    pub share_nothing: bool,
    /// Early lock release with dependency tracking and cascade abort.
    pub geo_rep_optimized: bool,
}

impl Default for RmMode {
    fn default() -> Self {
        Self {
            share_nothing: true,
            geo_rep_optimized: false,
        }
    }
}

impl RmMode {
    /// Default mode plus early lock release.
    pub fn geo_rep() -> Self {
        Self {
            geo_rep_optimized: true,
            ..Self::default()
        }
    }
}
