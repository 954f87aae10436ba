// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dependency tracking for early lock release.
//!
//! With `RmMode::geo_rep_optimized` set, a transaction may release its row
//! locks before its outcome is durable ("violation"). Any transaction that
//! observed such state is registered as a dependent and must not deliver
//! its own commit (or prepare-commit) until every transaction it read from
//! has committed its log. An abort instead cascades into the dependents.
//!
//! The per-RM core mutex is the only inter-RM lock. Edge registration
//! acquires the two cores in ascending-xid order; everything else crosses
//! RM boundaries only by posting onto the target's executor.

use std::sync::Arc;

use crate::context::{RmCore, TxContext};
use crate::error::ErrCode;
use crate::msg::{Message, TxEnableViolate};
use crate::Xid;

impl TxContext {
    /// Record that `out` depends on this transaction: `out` read state this
    /// transaction wrote and released early, so `out` must not deliver its
    /// commit until this transaction has committed its log.
    ///
    /// No edge is added once either side is already committing or aborting.
    pub fn register_dependency(self: &Arc<Self>, out: &Arc<TxContext>) {
        if self.xid() == out.xid() {
            tracing::error!(xid = self.xid(), "cannot register a self dependency");
            return;
        }
        // Both cores, ascending xid, released together by the guards.
        let (mut self_core, mut out_core) = if self.xid() < out.xid() {
            let a = self.core.lock();
            let b = out.core.lock();
            (a, b)
        } else {
            let b = out.core.lock();
            let a = self.core.lock();
            (a, b)
        };

        if matches!(
            out_core.state,
            crate::context::RmState::Aborting | crate::context::RmState::Committing
        ) {
            return;
        }
        if matches!(
            self_core.state,
            crate::context::RmState::Committing | crate::context::RmState::Aborting
        ) {
            return;
        }
        if !self_core.dep_out.contains_key(&out.xid()) {
            out_core.dep_in_count += 1;
            self_core.dep_out.insert(out.xid(), Arc::clone(out));
            out_core.dep_in.insert(self.xid(), Arc::downgrade(self));
        }
    }

    /// This transaction's log is durable: release every dependent. The
    /// decrement is posted onto each dependent's executor, never applied
    /// directly, so no thread holds two cores at once.
    pub(crate) fn report_dependency(&self, core: &mut RmCore) {
        for out in core.dep_out.values() {
            out.post_dep_release(self.xid());
        }
    }

    /// A transaction this one depends on has committed.
    pub(crate) fn dep_release(&self, core: &mut RmCore, from_xid: Xid) {
        if core.dep_in.remove(&from_xid).is_none() {
            return;
        }
        if core.dep_in_count > 0 {
            core.dep_in_count -= 1;
            if core.dep_in_count == 0 {
                self.post_dependency_commit();
            }
        }
    }

    /// Every depended-on transaction has committed; deliver our own
    /// outcome if its log is already durable.
    pub(crate) fn dependency_commit(&self, core: &mut RmCore) {
        core.dependency_committed = true;
        if self.is_distributed() {
            self.dlv_try_tx_prepare_commit(core);
        } else {
            self.dlv_try_tx_commit(core);
        }
    }

    pub(crate) fn dlv_try_tx_commit(&self, core: &mut RmCore) {
        if core.dep_in_count == 0 && core.commit_log_synced && !core.dlv_commit {
            core.dlv_commit = true;
            self.tx_committed(core);
        }
    }

    pub(crate) fn dlv_try_tx_prepare_commit(&self, core: &mut RmCore) {
        if core.dep_in_count == 0 && core.prepare_commit_log_synced && !core.dlv_prepare {
            core.dlv_prepare = true;
            self.tx_prepare_committed(core);
        }
    }

    /// Cascade an abort into every dependent. Each visited transaction that
    /// still has uncommitted dependents records `ErrCode::Cascade`; the
    /// abort itself is driven by the TM or the timeout path.
    pub fn dlv_abort(&self) {
        if !self.mode().geo_rep_optimized {
            return;
        }
        let outs: Vec<Arc<TxContext>> = {
            let mut core = self.core.lock();
            if core.dlv_abort_invoked {
                return;
            }
            core.dlv_abort_invoked = true;
            if core.dep_in_count > 0 {
                core.ec = ErrCode::Cascade;
            }
            core.dep_out.values().cloned().collect()
        };
        for out in outs {
            out.dlv_abort();
        }
    }

    /// Ask the lock manager to release every held lock early, accumulating
    /// how many waiters each release let through.
    pub(crate) fn dlv_make_violable(&self, core: &mut RmCore) {
        let items: Vec<_> = core.locks.values().cloned().collect();
        for item in items {
            let v = self.lock_mgr().make_violable(
                item.xid(),
                item.mode(),
                item.table_id(),
                item.shard_id(),
                item.predicate(),
            );
            core.telemetry.num_read_violate += v.read_v;
            core.telemetry.num_write_violate += v.write_v;
        }
    }

    /// Report to the TM that this RM's locks may be violated.
    pub fn send_tx_enable_violate(&self) {
        let dest = self.core.lock().coord_node_id;
        let msg = TxEnableViolate {
            source: self.node_id(),
            dest,
            violable: true,
        };
        if let Err(e) = self.service().send(dest, Message::TxEnableViolate(msg)) {
            tracing::error!(xid = self.xid(), error = %e, "report RM enable violate error");
        }
    }
}
