// SPDX-License-Identifier: MIT OR Apache-2.0
//! Row locks: the RM-side lock descriptors and the lock-manager interface.
//!
//! The lock manager itself lives outside the RM; the RM only installs a
//! waiter and is notified asynchronously on grant (or victim/deadlock).
//! `MemoryLockManager` is a single-node implementation with per-row FIFO
//! queues, shared read grants, and early release ("violation") support,
//! suitable for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::context::RmHandle;
use crate::error::ErrCode;
use crate::{Oid, ShardId, TableId, TupleId, Xid};

/// Lock mode for a single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    ReadRow,
    WriteRow,
}

/// Lock scope: a single-key predicate identifying one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Predicate {
    key: TupleId,
}

impl Predicate {
    pub fn new(key: TupleId) -> Self {
        Self { key }
    }

    pub fn key(&self) -> TupleId {
        self.key
    }
}

/// A lock owned by one RM. Immutable after creation; released exactly once
/// when the transaction ends.
#[derive(Debug, Clone)]
pub struct LockItem {
    xid: Xid,
    oid: Oid,
    mode: LockMode,
    table_id: TableId,
    shard_id: ShardId,
    predicate: Predicate,
}

impl LockItem {
    pub fn new(
        xid: Xid,
        oid: Oid,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        predicate: Predicate,
    ) -> Self {
        Self {
            xid,
            oid,
            mode,
            table_id,
            shard_id,
            predicate,
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn predicate(&self) -> Predicate {
        self.predicate
    }
}

/// Waiters granted by one early release, split by mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Violation {
    pub read_v: u32,
    pub write_v: u32,
}

/// Row-lock manager interface as seen by the RM.
///
/// Implementations must be internally thread-safe and must deliver grant
/// notifications through the waiter handle (which re-dispatches onto the
/// RM's executor).
pub trait LockManager: Send + Sync {
    /// Install a waiter for a row lock. The grant (or a victim/deadlock
    /// code) arrives later via `RmHandle::async_lock_acquire`.
    #[allow(clippy::too_many_arguments)]
    fn lock_row(
        &self,
        xid: Xid,
        oid: Oid,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        predicate: Predicate,
        waiter: RmHandle,
    );

    /// Release one previously granted (or still queued) lock.
    fn unlock(
        &self,
        xid: Xid,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        predicate: Predicate,
    );

    /// Release one lock early while the owning transaction is still live,
    /// reporting how many waiters the release let through.
    fn make_violable(
        &self,
        xid: Xid,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        predicate: Predicate,
    ) -> Violation;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RowKey {
    table_id: TableId,
    shard_id: ShardId,
    key: TupleId,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    xid: Xid,
    mode: LockMode,
}

struct Waiter {
    xid: Xid,
    oid: Oid,
    mode: LockMode,
    handle: RmHandle,
}

#[derive(Default)]
struct RowLock {
    holders: Vec<Holder>,
    waiters: VecDeque<Waiter>,
}

impl RowLock {
    fn admits(&self, xid: Xid, mode: LockMode) -> bool {
        self.holders.is_empty()
            || self.holders.iter().all(|h| h.xid == xid)
            || (mode == LockMode::ReadRow
                && self.holders.iter().all(|h| h.mode == LockMode::ReadRow))
    }

    /// Pop every front waiter that the current holders admit.
    fn promote(&mut self) -> Vec<Waiter> {
        let mut granted = Vec::new();
        while let Some(front) = self.waiters.front() {
            if !self.admits(front.xid, front.mode) {
                break;
            }
            let w = self.waiters.pop_front().expect("front checked");
            self.holders.push(Holder {
                xid: w.xid,
                mode: w.mode,
            });
            granted.push(w);
        }
        granted
    }
}

/// Single-node lock manager with per-row FIFO queues.
#[derive(Default)]
pub struct MemoryLockManager {
    rows: Mutex<HashMap<RowKey, RowLock>>,
    grants: AtomicU64,
    unlocks: AtomicU64,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently held row locks.
    pub fn active_lock_count(&self) -> usize {
        self.rows.lock().values().map(|r| r.holders.len()).sum()
    }

    /// Number of queued waiters.
    pub fn waiting_count(&self) -> usize {
        self.rows.lock().values().map(|r| r.waiters.len()).sum()
    }

    /// Total grants issued (immediate and promoted).
    pub fn grant_count(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    /// Total unlock calls that released a held lock.
    pub fn unlock_count(&self) -> u64 {
        self.unlocks.load(Ordering::Relaxed)
    }

    fn notify_all(&self, granted: Vec<Waiter>) {
        for w in granted {
            self.grants.fetch_add(1, Ordering::Relaxed);
            w.handle.async_lock_acquire(ErrCode::Ok, w.oid);
        }
    }
}

impl LockManager for MemoryLockManager {
    #[allow(clippy::too_many_arguments)]
    fn lock_row(
        &self,
        xid: Xid,
        oid: Oid,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        predicate: Predicate,
        waiter: RmHandle,
    ) {
        let key = RowKey {
            table_id,
            shard_id,
            key: predicate.key(),
        };
        let granted = {
            let mut rows = self.rows.lock();
            let row = rows.entry(key).or_default();
            if row.waiters.is_empty() && row.admits(xid, mode) {
                row.holders.push(Holder { xid, mode });
                true
            } else {
                row.waiters.push_back(Waiter {
                    xid,
                    oid,
                    mode,
                    handle: waiter.clone(),
                });
                false
            }
        };
        // Grant outside the table lock: the waiter callback re-enters the RM.
        if granted {
            self.grants.fetch_add(1, Ordering::Relaxed);
            waiter.async_lock_acquire(ErrCode::Ok, oid);
        }
    }

    fn unlock(
        &self,
        xid: Xid,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        predicate: Predicate,
    ) {
        let key = RowKey {
            table_id,
            shard_id,
            key: predicate.key(),
        };
        let granted = {
            let mut rows = self.rows.lock();
            let Some(row) = rows.get_mut(&key) else {
                return;
            };
            if let Some(pos) = row
                .holders
                .iter()
                .position(|h| h.xid == xid && h.mode == mode)
            {
                row.holders.remove(pos);
                self.unlocks.fetch_add(1, Ordering::Relaxed);
            } else {
                // A queued-but-never-granted request is released the same way.
                row.waiters.retain(|w| !(w.xid == xid && w.mode == mode));
            }
            let granted = row.promote();
            if row.holders.is_empty() && row.waiters.is_empty() {
                rows.remove(&key);
            }
            granted
        };
        self.notify_all(granted);
    }

    fn make_violable(
        &self,
        xid: Xid,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        predicate: Predicate,
    ) -> Violation {
        let key = RowKey {
            table_id,
            shard_id,
            key: predicate.key(),
        };
        let (granted, violation) = {
            let mut rows = self.rows.lock();
            let Some(row) = rows.get_mut(&key) else {
                return Violation::default();
            };
            let Some(pos) = row
                .holders
                .iter()
                .position(|h| h.xid == xid && h.mode == mode)
            else {
                return Violation::default();
            };
            row.holders.remove(pos);
            self.unlocks.fetch_add(1, Ordering::Relaxed);
            let granted = row.promote();
            let mut violation = Violation::default();
            for w in &granted {
                match w.mode {
                    LockMode::ReadRow => violation.read_v += 1,
                    LockMode::WriteRow => violation.write_v += 1,
                }
            }
            if row.holders.is_empty() && row.waiters.is_empty() {
                rows.remove(&key);
            }
            (granted, violation)
        };
        self.notify_all(granted);
        violation
    }
}
