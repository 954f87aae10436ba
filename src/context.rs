// SPDX-License-Identifier: MIT OR Apache-2.0
//! The RM transaction context: one instance drives one transaction on one
//! node from first operation to final release.
//!
//! The context coordinates five collaborators: the lock manager (row-range
//! locks), the access cache (read-through tuple cache), the net service
//! (DSB reads, TM traffic, client reply), the write-ahead log (phase
//! durability), and the deadlock detector (completion purge). For
//! distributed transactions it participates in two-phase commit as a cohort
//! under a remote TM.
//!
//! # Execution model
//!
//! Each context owns a logical strand: external entry points enqueue an
//! `RmEvent` and the queue is drained run-to-completion, one event at a
//! time, with the context's core locked per event. Collaborator callbacks
//! re-enter through the same queue, so there is no internal concurrency and
//! no recursion regardless of how collaborators deliver their
//! notifications. Events bound for *other* contexts (dependency releases,
//! lock grants after unlock) are deferred to a thread-local run queue and
//! drained only after the current context releases its core, so no thread
//! ever waits on a second core while holding one.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::access::AccessCache;
use crate::deadlock::DeadlockDetector;
use crate::error::ErrCode;
use crate::lock::{LockItem, LockManager, LockMode, Predicate};
use crate::metrics::TxTelemetry;
use crate::msg::{
    ClientTxResponse, DsbReadRequest, DsbReadResponse, Message, OpType, PrepareTelemetry,
    TupleRow, TxOperation, TxRequest, TxRmAck, TxRmPrepare, TxTmAbort, TxTmCommit, TxVictim,
};
use crate::net::NetService;
use crate::wal::{TxCmdType, TxLogEntry, WriteAheadLog};
use crate::{replication_group_of, Cno, NodeId, Oid, RmMode, ShardId, TableId, Tuple, TupleId, Xid};

/// RM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmState {
    /// Executing operations (or waiting for them).
    Idle,
    /// Phase-1 prepare logged or logging; awaiting TM decision.
    PrepareCommitting,
    /// Phase-1 abort logged or logging; awaiting TM abort.
    PrepareAborting,
    /// Commit decided; awaiting commit-log durability.
    Committing,
    /// Abort decided; awaiting abort-log durability.
    Aborting,
    /// Terminal: locks released, completion reported.
    Ended,
}

impl RmState {
    pub fn as_str(self) -> &'static str {
        match self {
            RmState::Idle => "RM_IDLE",
            RmState::PrepareCommitting => "RM_PREPARE_COMMITTING",
            RmState::PrepareAborting => "RM_PREPARE_ABORTING",
            RmState::Committing => "RM_COMMITTING",
            RmState::Aborting => "RM_ABORTING",
            RmState::Ended => "RM_ENDED",
        }
    }
}

impl std::fmt::Display for RmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked when the RM reaches `Ended`.
///
/// Runs on the RM's executor; it must not call back into the RM.
pub type TxStateCallback = Box<dyn Fn(Xid, RmState) + Send + Sync>;

/// Collaborator handles shared by every RM on a node.
pub struct RmServices {
    pub lock_mgr: Arc<dyn LockManager>,
    pub access: Arc<dyn AccessCache>,
    pub service: Arc<dyn NetService>,
    pub wal: Arc<dyn WriteAheadLog>,
    pub detector: Option<Arc<dyn DeadlockDetector>>,
}

/// Per-RM construction parameters.
#[derive(Debug, Clone)]
pub struct RmConfig {
    pub xid: Xid,
    pub node_id: NodeId,
    /// Fixed DSB node, overriding shard routing, when set.
    pub dsb_node_id: Option<NodeId>,
    /// Configuration epoch stamped on DSB requests.
    pub cno: Cno,
    pub distributed: bool,
    pub mode: RmMode,
    /// Shard routing snapshot taken at transaction start.
    pub shard2node: HashMap<ShardId, NodeId>,
    pub tx_timeout_ms: u64,
}

impl RmConfig {
    pub fn new(xid: Xid, node_id: NodeId) -> Self {
        Self {
            xid,
            node_id,
            dsb_node_id: None,
            cno: 0,
            distributed: false,
            mode: RmMode::default(),
            shard2node: HashMap::new(),
            tx_timeout_ms: crate::TX_TIMEOUT_MILLIS,
        }
    }

    pub fn with_distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    pub fn with_dsb_node(mut self, node: NodeId) -> Self {
        self.dsb_node_id = Some(node);
        self
    }

    pub fn with_cno(mut self, cno: Cno) -> Self {
        self.cno = cno;
        self
    }

    pub fn with_mode(mut self, mode: RmMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_shard2node(mut self, shard2node: HashMap<ShardId, NodeId>) -> Self {
        self.shard2node = shard2node;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.tx_timeout_ms = ms;
        self
    }
}

/// What to do once the pending row lock is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockFollowup {
    Read,
    Update,
    Insert,
    Remove,
}

/// The single in-flight lock continuation. At most one exists per RM.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingLock {
    pub(crate) oid: Oid,
    pub(crate) table_id: TableId,
    pub(crate) shard_id: ShardId,
    pub(crate) key: TupleId,
    pub(crate) kind: LockFollowup,
}

/// What to do with the `(ec, tuple)` outcome of an in-flight DSB read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DsbFollowup {
    Read,
    Update,
    Insert,
}

enum RmEvent {
    Request(TxRequest),
    LockAcquired { ec: ErrCode, oid: Oid },
    DsbResponse { response: DsbReadResponse, ts: Instant },
    OpDone { ec: ErrCode },
    LogCommitted { cmd: TxCmdType, ts: Instant },
    TmCommit,
    TmAbort,
    Abort { ec: ErrCode },
    TimeoutSweep,
    DepRelease { from_xid: Xid },
    DependencyCommit,
    EnableViolate,
}

#[derive(Default)]
struct EventQueue {
    queue: VecDeque<RmEvent>,
    draining: bool,
}

thread_local! {
    static THREAD_DRAINING: Cell<bool> = const { Cell::new(false) };
    static PENDED: RefCell<VecDeque<Arc<TxContext>>> = const { RefCell::new(VecDeque::new()) };
}

/// All mutable RM state. Guarded by the context's core mutex, which doubles
/// as the per-RM dependency mutex.
pub(crate) struct RmCore {
    pub(crate) state: RmState,
    pub(crate) ec: ErrCode,
    pub(crate) read_only: bool,
    pub(crate) oid: Oid,
    pub(crate) max_ops: usize,
    pub(crate) coord_node_id: NodeId,
    pub(crate) client_node_id: NodeId,
    pub(crate) ops: VecDeque<TxOperation>,
    pub(crate) locks: HashMap<Oid, LockItem>,
    pub(crate) pending_lock: Option<PendingLock>,
    pub(crate) ds_read_handlers: HashMap<Oid, DsbFollowup>,
    pub(crate) log_entries: Vec<TxLogEntry>,
    pub(crate) response_ops: Vec<TxOperation>,
    pub(crate) has_responded: bool,
    pub(crate) victim: bool,
    pub(crate) timeout_invoked: bool,
    pub(crate) prepare_commit_log_synced: bool,
    pub(crate) commit_log_synced: bool,
    pub(crate) dependency_committed: bool,
    pub(crate) dlv_commit: bool,
    pub(crate) dlv_prepare: bool,
    pub(crate) dlv_abort_invoked: bool,
    pub(crate) dep_out: HashMap<Xid, Arc<TxContext>>,
    pub(crate) dep_in: HashMap<Xid, Weak<TxContext>>,
    pub(crate) dep_in_count: u32,
    pub(crate) telemetry: TxTelemetry,
}

impl RmCore {
    fn new() -> Self {
        Self {
            state: RmState::Idle,
            ec: ErrCode::Ok,
            read_only: false,
            oid: 1,
            max_ops: 0,
            coord_node_id: 0,
            client_node_id: 0,
            ops: VecDeque::new(),
            locks: HashMap::new(),
            pending_lock: None,
            ds_read_handlers: HashMap::new(),
            log_entries: Vec::new(),
            response_ops: Vec::new(),
            has_responded: false,
            victim: false,
            timeout_invoked: false,
            prepare_commit_log_synced: false,
            commit_log_synced: false,
            dependency_committed: false,
            dlv_commit: false,
            dlv_prepare: false,
            dlv_abort_invoked: false,
            dep_out: HashMap::new(),
            dep_in: HashMap::new(),
            dep_in_count: 0,
            telemetry: TxTelemetry::new(),
        }
    }

    fn alloc_oid(&mut self) -> Oid {
        let oid = self.oid;
        self.oid += 1;
        oid
    }
}

/// Callback address of one RM, handed to collaborators.
///
/// Holds the context weakly: outstanding lock waits, WAL registrations and
/// DSB reads do not keep a finished transaction alive, and notifications
/// arriving after the owner dropped it are silently ignored.
#[derive(Clone)]
pub struct RmHandle {
    xid: Xid,
    target: HandleTarget,
}

#[derive(Clone)]
enum HandleTarget {
    Rm(Weak<TxContext>),
    #[cfg(test)]
    Recording(Arc<Mutex<Vec<(ErrCode, Oid)>>>),
}

impl RmHandle {
    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn is_live(&self) -> bool {
        match &self.target {
            HandleTarget::Rm(weak) => weak.strong_count() > 0,
            #[cfg(test)]
            HandleTarget::Recording(_) => true,
        }
    }

    /// Lock-manager grant (or victim/deadlock) notification.
    pub fn async_lock_acquire(&self, ec: ErrCode, oid: Oid) {
        match &self.target {
            HandleTarget::Rm(weak) => {
                if let Some(ctx) = weak.upgrade() {
                    ctx.notify_lock_acquire(ec, oid);
                }
            },
            #[cfg(test)]
            HandleTarget::Recording(log) => log.lock().push((ec, oid)),
        }
    }

    /// WAL durability notification for one log entry.
    pub fn on_log_entry_commit(&self, cmd: TxCmdType, ts: Instant) {
        match &self.target {
            HandleTarget::Rm(weak) => {
                if let Some(ctx) = weak.upgrade() {
                    ctx.on_log_entry_commit(cmd, ts);
                }
            },
            #[cfg(test)]
            HandleTarget::Recording(_) => {},
        }
    }

    /// DSB read-through response delivery.
    pub fn read_data_from_dsb_response(&self, response: DsbReadResponse, ts: Instant) {
        match &self.target {
            HandleTarget::Rm(weak) => {
                if let Some(ctx) = weak.upgrade() {
                    ctx.read_data_from_dsb_response(response, ts);
                }
            },
            #[cfg(test)]
            HandleTarget::Recording(_) => {},
        }
    }

    /// Handle that records lock grants instead of delivering them.
    #[cfg(test)]
    pub(crate) fn recording(log: Arc<Mutex<Vec<(ErrCode, Oid)>>>) -> Self {
        Self {
            xid: 0,
            target: HandleTarget::Recording(log),
        }
    }
}

/// One transaction's resource manager.
pub struct TxContext {
    xid: Xid,
    node_id: NodeId,
    node_name: String,
    dsb_node_id: Option<NodeId>,
    cno: Cno,
    distributed: bool,
    mode: RmMode,
    tx_timeout_ms: u64,
    shard2node: HashMap<ShardId, NodeId>,
    start: Instant,
    lock_mgr: Arc<dyn LockManager>,
    access: Arc<dyn AccessCache>,
    service: Arc<dyn NetService>,
    wal: Arc<dyn WriteAheadLog>,
    detector: Option<Arc<dyn DeadlockDetector>>,
    on_state: Option<TxStateCallback>,
    weak: Weak<TxContext>,
    events: Mutex<EventQueue>,
    pub(crate) core: Mutex<RmCore>,
}

impl TxContext {
    pub fn new(
        config: RmConfig,
        services: RmServices,
        on_state: Option<TxStateCallback>,
    ) -> Arc<Self> {
        debug_assert!(config.node_id != 0);
        let ctx = Arc::new_cyclic(|weak| Self {
            xid: config.xid,
            node_id: config.node_id,
            node_name: format!("node_{}", config.node_id),
            dsb_node_id: config.dsb_node_id,
            cno: config.cno,
            distributed: config.distributed,
            mode: config.mode,
            tx_timeout_ms: config.tx_timeout_ms,
            shard2node: config.shard2node,
            start: Instant::now(),
            lock_mgr: services.lock_mgr,
            access: services.access,
            service: services.service,
            wal: services.wal,
            detector: services.detector,
            on_state,
            weak: weak.clone(),
            events: Mutex::new(EventQueue::default()),
            core: Mutex::new(RmCore::new()),
        });
        ctx.core.lock().telemetry.part.begin();
        tracing::trace!(node = %ctx.node_name, xid = ctx.xid, "transaction RM construct");
        ctx
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn state(&self) -> RmState {
        self.core.lock().state
    }

    pub fn error_code(&self) -> ErrCode {
        self.core.lock().ec
    }

    pub fn has_responded(&self) -> bool {
        self.core.lock().has_responded
    }

    pub fn is_victim(&self) -> bool {
        self.core.lock().victim
    }

    /// Next operation id to be allocated.
    pub fn current_oid(&self) -> Oid {
        self.core.lock().oid
    }

    pub fn dep_in_count(&self) -> u32 {
        self.core.lock().dep_in_count
    }

    pub fn dependency_committed(&self) -> bool {
        self.core.lock().dependency_committed
    }

    pub(crate) fn mode(&self) -> RmMode {
        self.mode
    }

    pub(crate) fn lock_mgr(&self) -> &dyn LockManager {
        self.lock_mgr.as_ref()
    }

    pub(crate) fn service(&self) -> &dyn NetService {
        self.service.as_ref()
    }

    /// Callback address for collaborators.
    pub fn handle(&self) -> RmHandle {
        RmHandle {
            xid: self.xid,
            target: HandleTarget::Rm(self.weak.clone()),
        }
    }

    /// Render state and age for diagnostics.
    pub fn debug_tx(&self, os: &mut String) {
        let state = self.state();
        let _ = writeln!(os, "{} RM : {} state: {}", self.node_name, self.xid, state);
        let _ = writeln!(
            os,
            "    -> after begin: {}ms",
            self.start.elapsed().as_millis()
        );
    }

    /// Accumulate replication delay reported by the log layer.
    pub fn log_rep_delay(&self, us: u64) {
        self.core.lock().telemetry.log_rep_delay += us;
    }

    // ------------------------------------------------------------------
    // Entry points. Each enqueues onto the RM's strand.
    // ------------------------------------------------------------------

    /// Start executing a one-shot transaction request.
    pub fn process_tx_request(&self, req: TxRequest) {
        self.post(RmEvent::Request(req));
    }

    /// Lock-manager notification: the pending lock resolved with `ec`.
    pub fn notify_lock_acquire(&self, ec: ErrCode, oid: Oid) {
        self.post(RmEvent::LockAcquired { ec, oid });
    }

    /// DSB read-through response arrived.
    pub fn read_data_from_dsb_response(&self, response: DsbReadResponse, ts: Instant) {
        self.post(RmEvent::DsbResponse { response, ts });
    }

    /// WAL notification: one log entry with terminal command `cmd` is durable.
    pub fn on_log_entry_commit(&self, cmd: TxCmdType, ts: Instant) {
        self.post(RmEvent::LogCommitted { cmd, ts });
    }

    /// TM phase-2 commit decision.
    pub fn handle_tx_tm_commit(&self, msg: &TxTmCommit) {
        debug_assert_eq!(msg.xid, self.xid);
        if msg.xid != self.xid {
            return;
        }
        self.post(RmEvent::TmCommit);
    }

    /// TM phase-2 abort decision.
    pub fn handle_tx_tm_abort(&self, msg: &TxTmAbort) {
        debug_assert_eq!(msg.xid, self.xid);
        if msg.xid != self.xid {
            return;
        }
        self.post(RmEvent::TmAbort);
    }

    /// Abort the transaction (victim selection, client cancel, cascade).
    pub fn abort(&self, ec: ErrCode) {
        self.post(RmEvent::Abort { ec });
    }

    /// Periodic sweep: abort transactions stuck past their timeout.
    pub fn timeout_clean_up(&self) {
        self.post(RmEvent::TimeoutSweep);
    }

    /// TM grants permission to release this RM's locks early.
    pub fn handle_tx_enable_violate(&self) {
        self.post(RmEvent::EnableViolate);
    }

    pub(crate) fn post_dep_release(&self, from_xid: Xid) {
        self.post(RmEvent::DepRelease { from_xid });
    }

    pub(crate) fn post_dependency_commit(&self) {
        self.post(RmEvent::DependencyCommit);
    }

    // ------------------------------------------------------------------
    // Strand: enqueue, drain, defer.
    // ------------------------------------------------------------------

    fn post(&self, ev: RmEvent) {
        {
            let mut q = self.events.lock();
            q.queue.push_back(ev);
            if q.draining {
                // The active drainer picks it up.
                return;
            }
        }
        let Some(ctx) = self.weak.upgrade() else {
            return;
        };
        Self::run(ctx);
    }

    /// Drain `ctx` now unless this thread is already inside a drain, in
    /// which case it is pended and drained once the current context's core
    /// is released. Holding at most one core per thread keeps cross-RM
    /// notification chains deadlock-free.
    fn run(ctx: Arc<TxContext>) {
        if THREAD_DRAINING.with(|d| d.get()) {
            PENDED.with(|p| p.borrow_mut().push_back(ctx));
            return;
        }
        THREAD_DRAINING.with(|d| d.set(true));
        ctx.drain();
        loop {
            let next = PENDED.with(|p| p.borrow_mut().pop_front());
            match next {
                Some(c) => c.drain(),
                None => break,
            }
        }
        THREAD_DRAINING.with(|d| d.set(false));
    }

    fn drain(&self) {
        {
            let mut q = self.events.lock();
            if q.draining || q.queue.is_empty() {
                return;
            }
            q.draining = true;
        }
        loop {
            let ev = {
                let mut q = self.events.lock();
                match q.queue.pop_front() {
                    Some(ev) => ev,
                    None => {
                        q.draining = false;
                        return;
                    },
                }
            };
            self.dispatch(ev);
        }
    }

    fn dispatch(&self, ev: RmEvent) {
        let mut core = self.core.lock();
        match ev {
            RmEvent::Request(req) => self.on_request(&mut core, req),
            RmEvent::LockAcquired { ec, oid } => self.on_lock_acquired(&mut core, ec, oid),
            RmEvent::DsbResponse { response, ts } => self.on_dsb_response(&mut core, response, ts),
            RmEvent::OpDone { ec } => self.on_op_done(&mut core, ec),
            RmEvent::LogCommitted { cmd, ts } => self.on_log_committed(&mut core, cmd, ts),
            RmEvent::TmCommit => self.handle_finish_tx_phase2_commit(&mut core),
            RmEvent::TmAbort => self.abort_tx_2p(&mut core),
            RmEvent::Abort { ec } => self.on_abort(&mut core, ec),
            RmEvent::TimeoutSweep => self.on_timeout_sweep(&mut core),
            RmEvent::DepRelease { from_xid } => self.on_dep_release(&mut core, from_xid),
            RmEvent::DependencyCommit => self.on_dependency_commit(&mut core),
            RmEvent::EnableViolate => self.dlv_make_violable(&mut core),
        }
    }

    fn protocol_error(&self, what: &str) {
        tracing::error!(node = %self.node_name, xid = self.xid, what, "RM protocol error");
        debug_assert!(false, "RM protocol error: {what}");
    }

    // ------------------------------------------------------------------
    // Operation pipeline.
    // ------------------------------------------------------------------

    fn on_request(&self, core: &mut RmCore, req: TxRequest) {
        debug_assert_eq!(req.distributed, self.distributed);
        core.read_only = req.read_only;
        core.client_node_id = req.source;
        if req.distributed {
            core.coord_node_id = req.source;
        }
        core.max_ops = req.operations.len();
        if req.oneshot {
            core.ops.extend(req.operations);
            self.handle_next_operation(core);
        } else {
            tracing::warn!(xid = self.xid, "non-oneshot requests are not supported");
        }
    }

    /// The pump: runs only while `Idle`, executes the front operation, and
    /// once the queue empties (or an operation failed) enters the finish
    /// path for this RM's flavor.
    fn handle_next_operation(&self, core: &mut RmCore) {
        if core.state != RmState::Idle {
            return;
        }

        if core.ec.is_ok() {
            if let Some(op) = core.ops.front().cloned() {
                self.handle_operation(core, op);
            } else {
                debug_assert_eq!(core.oid as usize, core.max_ops + 1);
                if self.distributed {
                    if self.mode.share_nothing {
                        self.handle_finish_tx_phase1_prepare_commit(core);
                    }
                } else {
                    self.handle_finish_tx_phase1_commit(core);
                }
            }
        } else {
            tracing::trace!(xid = self.xid, ec = %core.ec, "abort");
            if self.distributed {
                if self.mode.share_nothing {
                    self.handle_finish_tx_phase1_prepare_abort(core);
                }
            } else {
                self.handle_finish_tx_phase1_abort(core);
            }
        }
    }

    fn handle_operation(&self, core: &mut RmCore, op: TxOperation) {
        let row = &op.tuple_row;
        let (table_id, shard_id, key) = (row.table_id, row.shard_id, row.tuple_id);
        match op.op_type {
            OpType::Read | OpType::ReadForWrite => {
                let mode = if op.op_type == OpType::ReadForWrite {
                    LockMode::WriteRow
                } else {
                    LockMode::ReadRow
                };
                self.acquire_row_lock(core, mode, table_id, shard_id, key, LockFollowup::Read);
            },
            OpType::Update => {
                self.acquire_row_lock(
                    core,
                    LockMode::WriteRow,
                    table_id,
                    shard_id,
                    key,
                    LockFollowup::Update,
                );
            },
            OpType::Insert => {
                self.acquire_row_lock(
                    core,
                    LockMode::WriteRow,
                    table_id,
                    shard_id,
                    key,
                    LockFollowup::Insert,
                );
            },
            OpType::Remove => {
                self.acquire_row_lock(
                    core,
                    LockMode::WriteRow,
                    table_id,
                    shard_id,
                    key,
                    LockFollowup::Remove,
                );
            },
        }
    }

    /// Allocate an oid, record the lock, install the one pending
    /// continuation, and hand the wait to the lock manager. Read-only RMs
    /// bypass the lock manager: the continuation resolves immediately.
    fn acquire_row_lock(
        &self,
        core: &mut RmCore,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        key: TupleId,
        kind: LockFollowup,
    ) {
        let oid = core.alloc_oid();
        if core.pending_lock.is_some() {
            self.protocol_error("lock continuation already installed");
            return;
        }
        let item = LockItem::new(self.xid, oid, mode, table_id, shard_id, Predicate::new(key));
        if core.locks.insert(oid, item).is_none() {
            core.telemetry.num_lock += 1;
        }
        core.pending_lock = Some(PendingLock {
            oid,
            table_id,
            shard_id,
            key,
            kind,
        });
        core.telemetry.lock_wait.begin();
        tracing::trace!(
            xid = self.xid,
            oid,
            table_id,
            key,
            "lock row"
        );
        if core.read_only {
            self.run_lock_continuation(core, ErrCode::Ok);
        } else {
            self.lock_mgr.lock_row(
                self.xid,
                oid,
                mode,
                table_id,
                shard_id,
                Predicate::new(key),
                self.handle(),
            );
        }
    }

    fn on_lock_acquired(&self, core: &mut RmCore, ec: ErrCode, oid: Oid) {
        match core.pending_lock {
            Some(pending) => {
                if pending.oid != oid {
                    tracing::warn!(
                        xid = self.xid,
                        expected = pending.oid,
                        got = oid,
                        "lock grant for stale oid"
                    );
                }
                self.run_lock_continuation(core, ec);
            },
            None => {
                // A grant can trail an abort that already tore the
                // continuation down; only a grant with no abort in flight is
                // a protocol error.
                if core.state == RmState::Idle {
                    self.protocol_error("lock grant without pending continuation");
                }
            },
        }
    }

    fn run_lock_continuation(&self, core: &mut RmCore, ec: ErrCode) {
        let Some(pending) = core.pending_lock.take() else {
            self.protocol_error("no pending lock continuation");
            return;
        };
        core.telemetry.lock_wait.end();
        let PendingLock {
            oid,
            table_id,
            shard_id,
            key,
            kind,
        } = pending;

        match kind {
            LockFollowup::Read => {
                if ec.is_ok() {
                    match self.access.get(table_id, shard_id, key) {
                        Some(tuple) => self.complete_read(core, table_id, shard_id, key, ec, tuple),
                        None => self.read_data_from_dsb(
                            core,
                            table_id,
                            shard_id,
                            key,
                            oid,
                            DsbFollowup::Read,
                        ),
                    }
                } else {
                    tracing::trace!(xid = self.xid, table_id, key, ec = %ec, "read lock not granted");
                    self.complete_read(core, table_id, shard_id, key, ec, Tuple::new());
                }
            },
            LockFollowup::Update => {
                if ec.is_ok() {
                    if self.access.get(table_id, shard_id, key).is_some() {
                        self.finish_write_op(core, ErrCode::Ok);
                    } else {
                        self.read_data_from_dsb(
                            core,
                            table_id,
                            shard_id,
                            key,
                            oid,
                            DsbFollowup::Update,
                        );
                    }
                } else {
                    self.post(RmEvent::OpDone { ec });
                }
            },
            LockFollowup::Insert => {
                if ec.is_ok() {
                    if self.access.get(table_id, shard_id, key).is_some() {
                        self.post(RmEvent::OpDone {
                            ec: ErrCode::Duplication,
                        });
                    } else {
                        self.read_data_from_dsb(
                            core,
                            table_id,
                            shard_id,
                            key,
                            oid,
                            DsbFollowup::Insert,
                        );
                    }
                } else {
                    self.post(RmEvent::OpDone { ec });
                }
            },
            LockFollowup::Remove => {
                if ec.is_ok() {
                    match self.access.get(table_id, shard_id, key) {
                        Some(tuple) => {
                            self.push_response_row(core, table_id, shard_id, key, tuple);
                            self.finish_write_op(core, ErrCode::Ok);
                        },
                        None => self.post(RmEvent::OpDone {
                            ec: ErrCode::NotFound,
                        }),
                    }
                } else {
                    self.post(RmEvent::OpDone { ec });
                }
            },
        }
    }

    fn push_response_row(
        &self,
        core: &mut RmCore,
        table_id: TableId,
        shard_id: ShardId,
        key: TupleId,
        tuple: Tuple,
    ) {
        let op_type = core
            .ops
            .front()
            .map(|o| o.op_type)
            .unwrap_or(OpType::Read);
        core.response_ops.push(TxOperation::new(
            op_type,
            TupleRow::new(table_id, shard_id, key, tuple),
        ));
    }

    /// Record the read result and complete the operation.
    fn complete_read(
        &self,
        core: &mut RmCore,
        table_id: TableId,
        shard_id: ShardId,
        key: TupleId,
        ec: ErrCode,
        tuple: Tuple,
    ) {
        debug_assert!(!(ec.is_ok() && tuple.is_empty()));
        if ec == ErrCode::NotFound {
            tracing::trace!(node = %self.node_name, xid = self.xid, table_id, key, "row not found");
        }
        self.push_response_row(core, table_id, shard_id, key, tuple);
        self.post(RmEvent::OpDone { ec });
    }

    /// Buffer the front operation into the staged log entry and complete it.
    fn finish_write_op(&self, core: &mut RmCore, ec: ErrCode) {
        let Some(op) = core.ops.front().cloned() else {
            self.protocol_error("write completion without an operation");
            return;
        };
        self.append_operation(core, op);
        self.post(RmEvent::OpDone { ec });
    }

    fn on_op_done(&self, core: &mut RmCore, ec: ErrCode) {
        core.ops.pop_front();
        // Read-only transactions tolerate missing rows.
        core.ec = if core.read_only && ec == ErrCode::NotFound {
            ErrCode::Ok
        } else {
            ec
        };
        self.handle_next_operation(core);
    }

    // ------------------------------------------------------------------
    // Read-through.
    // ------------------------------------------------------------------

    fn shard2node(&self, shard_id: ShardId) -> Option<NodeId> {
        self.dsb_node_id
            .or_else(|| self.shard2node.get(&shard_id).copied())
    }

    fn read_data_from_dsb(
        &self,
        core: &mut RmCore,
        table_id: TableId,
        shard_id: ShardId,
        key: TupleId,
        oid: Oid,
        followup: DsbFollowup,
    ) {
        tracing::trace!(node = %self.node_name, xid = self.xid, table_id, key, "read key from DSB");
        let Some(dest) = self.shard2node(shard_id) else {
            tracing::error!(xid = self.xid, shard_id, "no owning node for shard");
            self.post(RmEvent::OpDone {
                ec: ErrCode::Internal,
            });
            return;
        };
        let req = DsbReadRequest {
            source: self.node_id,
            dest,
            xid: self.xid,
            oid,
            cno: self.cno,
            table_id,
            shard_id,
            tuple_id: key,
        };
        core.ds_read_handlers.insert(oid, followup);
        core.telemetry.read.begin();
        if let Err(e) = self.service.send(dest, Message::DsbReadRequest(req)) {
            tracing::error!(node = dest, error = %e, "async send read request error");
        }
    }

    fn on_dsb_response(&self, core: &mut RmCore, response: DsbReadResponse, ts: Instant) {
        let DsbReadResponse {
            oid,
            ec,
            tuple_row,
            latency_read_dsb,
            ..
        } = response;
        let TupleRow {
            table_id,
            shard_id,
            tuple_id: key,
            tuple,
        } = tuple_row;
        let has_tuple = !tuple.is_empty();

        core.telemetry.latency_read_dsb += latency_read_dsb;
        core.telemetry.read.end_at(ts);

        debug_assert!(oid != 0);
        match core.ds_read_handlers.remove(&oid) {
            Some(DsbFollowup::Read) => {
                self.complete_read(core, table_id, shard_id, key, ec, tuple.clone());
            },
            Some(DsbFollowup::Update) => {
                if ec.is_ok() {
                    self.finish_write_op(core, ErrCode::Ok);
                } else {
                    if ec == ErrCode::NotFound {
                        tracing::debug!(node = %self.node_name, xid = self.xid, table_id, key, "cannot find row to update");
                    }
                    self.post(RmEvent::OpDone { ec });
                }
            },
            Some(DsbFollowup::Insert) => {
                if ec.is_ok() {
                    tracing::debug!(node = %self.node_name, xid = self.xid, table_id, key, "duplicate row on insert");
                    self.post(RmEvent::OpDone {
                        ec: ErrCode::Duplication,
                    });
                } else if ec == ErrCode::NotFound {
                    self.finish_write_op(core, ErrCode::Ok);
                } else {
                    self.post(RmEvent::OpDone { ec });
                }
            },
            None => {
                self.protocol_error("DSB response without handler");
                return;
            },
        }

        if ec.is_ok() {
            if has_tuple {
                self.access.put(table_id, shard_id, key, tuple);
                tracing::trace!(node = %self.node_name, table_id, key, "cached");
            } else {
                tracing::trace!(node = %self.node_name, table_id, key, "no tuple");
            }
        } else {
            tracing::trace!(node = %self.node_name, ec = %ec, table_id, key, "read error");
        }
    }

    // ------------------------------------------------------------------
    // Logging.
    // ------------------------------------------------------------------

    fn append_operation(&self, core: &mut RmCore, mut op: TxOperation) {
        if matches!(op.op_type, OpType::Insert | OpType::Update) {
            debug_assert!(!op.tuple_row.tuple.is_empty());
        }
        if core.log_entries.is_empty() {
            core.log_entries.push(TxLogEntry::default());
        }
        op.xid = self.xid;
        op.rg_id = replication_group_of(self.node_id);
        let entry = core.log_entries.last_mut().expect("entry exists");
        entry.operations.push(op);
    }

    fn set_tx_cmd_type(&self, core: &mut RmCore, cmd: TxCmdType) {
        if core.log_entries.is_empty() {
            core.log_entries.push(TxLogEntry::default());
        }
        let entry = core.log_entries.last_mut().expect("entry exists");
        entry.xid = self.xid;
        entry.cmd = Some(cmd);
    }

    fn async_force_log(&self, core: &mut RmCore) {
        tracing::trace!(node = %self.node_name, xid = self.xid, "force log");
        let mut binaries = Vec::with_capacity(core.log_entries.len());
        for entry in core.log_entries.drain(..) {
            match entry.encode() {
                Ok(binary) => binaries.push(binary),
                Err(e) => tracing::error!(xid = self.xid, error = %e, "log entry encode error"),
            }
        }
        core.telemetry.append.begin();
        self.wal.append(binaries, self.handle());
    }

    fn on_log_committed(&self, core: &mut RmCore, cmd: TxCmdType, ts: Instant) {
        core.log_entries.clear();
        match cmd {
            TxCmdType::RmCommit => {
                core.telemetry.append.end_at(ts);
                self.on_committed_log_commit(core);
            },
            TxCmdType::RmAbort => self.tx_aborted(core),
            TxCmdType::RmPrepareAbort => self.on_prepare_aborted_log_commit(core),
            TxCmdType::RmPrepareCommit => {
                core.telemetry.append.end_at(ts);
                self.on_prepare_committed_log_commit(core);
            },
        }
    }

    pub(crate) fn on_committed_log_commit(&self, core: &mut RmCore) {
        core.commit_log_synced = true;
        // The dependency gate applies where the commit decision is made
        // locally; a distributed RM was already gated at prepare and the TM
        // owns the phase-2 decision.
        if self.mode.geo_rep_optimized && !self.distributed {
            self.report_dependency(core);
            self.dlv_try_tx_commit(core);
        } else {
            self.tx_committed(core);
        }
    }

    fn on_prepare_committed_log_commit(&self, core: &mut RmCore) {
        core.prepare_commit_log_synced = true;
        if self.mode.geo_rep_optimized {
            self.report_dependency(core);
            self.dlv_try_tx_prepare_commit(core);
        } else {
            self.tx_prepare_committed(core);
        }
    }

    fn on_prepare_aborted_log_commit(&self, core: &mut RmCore) {
        self.tx_prepare_aborted(core);
    }

    // ------------------------------------------------------------------
    // Completion.
    // ------------------------------------------------------------------

    pub(crate) fn tx_committed(&self, core: &mut RmCore) {
        if !self.distributed {
            tracing::trace!(xid = self.xid, "commit");
            self.send_tx_response(core);
            self.release_lock(core);
        } else if self.mode.share_nothing {
            tracing::trace!(xid = self.xid, "phase 2 commit");
            self.send_ack_message(core, true);
            self.release_lock(core);
        }
    }

    fn tx_aborted(&self, core: &mut RmCore) {
        if !self.distributed {
            tracing::trace!(xid = self.xid, "phase 1 abort");
            if core.ec.is_ok() {
                core.ec = ErrCode::TxAbort;
            }
            self.send_tx_response(core);
            self.release_lock(core);
        } else if self.mode.share_nothing {
            tracing::trace!(xid = self.xid, "phase 2 abort");
            self.send_ack_message(core, false);
            self.release_lock(core);
        }
    }

    pub(crate) fn tx_prepare_committed(&self, core: &mut RmCore) {
        tracing::trace!(node = %self.node_name, xid = self.xid, "prepare commit");
        self.send_prepare_message(core, true);
    }

    fn tx_prepare_aborted(&self, core: &mut RmCore) {
        tracing::trace!(xid = self.xid, "prepare abort");
        self.send_prepare_message(core, false);
    }

    fn release_lock(&self, core: &mut RmCore) {
        if !core.read_only {
            for item in core.locks.values() {
                self.lock_mgr.unlock(
                    item.xid(),
                    item.mode(),
                    item.table_id(),
                    item.shard_id(),
                    item.predicate(),
                );
            }
        }
        if let Some(detector) = &self.detector {
            detector.tx_finish(self.xid);
        }
        self.tx_ended(core);
        core.locks.clear();
    }

    fn tx_ended(&self, core: &mut RmCore) {
        core.state = RmState::Ended;
        core.dep_out.clear();
        tracing::trace!(node = %self.node_name, xid = self.xid, "end");
        if let Some(cb) = &self.on_state {
            cb(self.xid, RmState::Ended);
        }
    }

    fn send_tx_response(&self, core: &mut RmCore) {
        if core.has_responded {
            return;
        }
        core.has_responded = true;
        core.telemetry.part.end();
        tracing::trace!(node = %self.node_name, xid = self.xid, ec = %core.ec, "send response");

        let t = &core.telemetry;
        let resp = ClientTxResponse {
            xid: self.xid,
            ec: core.ec,
            latency_append: t.append.microseconds(),
            latency_read: t.read.microseconds(),
            latency_read_dsb: t.latency_read_dsb,
            latency_lock_wait: t.lock_wait.microseconds(),
            latency_replicate: t.log_rep_delay,
            latency_part: t.part.microseconds(),
            access_part: 1,
            num_lock: t.num_lock,
            num_read_violate: t.num_read_violate,
            num_write_violate: t.num_write_violate,
            operations: std::mem::take(&mut core.response_ops),
        };
        if let Err(e) = self
            .service
            .send(core.client_node_id, Message::ClientTxResponse(resp))
        {
            tracing::error!(xid = self.xid, error = %e, "async send response error");
        }
    }

    fn send_prepare_message(&self, core: &mut RmCore, commit: bool) {
        core.telemetry.part.end();
        let t = &core.telemetry;
        let telemetry = commit.then(|| PrepareTelemetry {
            latency_append: t.append.microseconds(),
            latency_read: t.read.microseconds(),
            latency_lock_wait: t.lock_wait.microseconds(),
            latency_replicate: t.log_rep_delay,
            latency_part: t.part.microseconds(),
            num_lock: t.num_lock,
            num_read_violate: t.num_read_violate,
            num_write_violate: t.num_write_violate,
        });
        let msg = TxRmPrepare {
            xid: self.xid,
            source_node: self.node_id,
            source_rg: replication_group_of(self.node_id),
            dest_node: core.coord_node_id,
            dest_rg: replication_group_of(core.coord_node_id),
            commit,
            telemetry,
        };
        if let Err(e) = self
            .service
            .send(core.coord_node_id, Message::TxRmPrepare(msg))
        {
            tracing::error!(xid = self.xid, error = %e, "async send prepare error");
        }
    }

    fn send_ack_message(&self, core: &mut RmCore, commit: bool) {
        let msg = TxRmAck {
            xid: self.xid,
            source_node: self.node_id,
            source_rg: replication_group_of(self.node_id),
            dest_node: core.coord_node_id,
            dest_rg: replication_group_of(core.coord_node_id),
            commit,
        };
        if let Err(e) = self.service.send(core.coord_node_id, Message::TxRmAck(msg)) {
            tracing::error!(xid = self.xid, error = %e, "async send ACK error");
        }
    }

    // ------------------------------------------------------------------
    // Finish paths and the state machine.
    // ------------------------------------------------------------------

    fn handle_finish_tx_phase1_commit(&self, core: &mut RmCore) {
        match core.state {
            RmState::Idle | RmState::PrepareCommitting => {
                core.state = RmState::Committing;
                self.set_tx_cmd_type(core, TxCmdType::RmCommit);
                tracing::trace!(node = %self.node_name, xid = self.xid, "commit");
                if core.read_only {
                    // Read-only transactions skip the log entirely.
                    self.on_committed_log_commit(core);
                } else {
                    self.async_force_log(core);
                }
            },
            RmState::Committing => self.send_tx_response(core),
            _ => self.protocol_error("phase1 commit in invalid state"),
        }
    }

    fn handle_finish_tx_phase1_abort(&self, core: &mut RmCore) {
        self.abort_tx_1p(core);
    }

    fn abort_tx_1p(&self, core: &mut RmCore) {
        match core.state {
            RmState::Idle => {
                core.state = RmState::Aborting;
                self.set_tx_cmd_type(core, TxCmdType::RmAbort);
                tracing::trace!(node = %self.node_name, xid = self.xid, "phase1 aborted");
                self.async_force_log(core);
            },
            RmState::Aborting => self.send_tx_response(core),
            _ => self.protocol_error("phase1 abort in invalid state"),
        }
    }

    fn handle_finish_tx_phase1_prepare_commit(&self, core: &mut RmCore) {
        self.prepare_commit_tx(core);
        self.async_force_log(core);
    }

    fn handle_finish_tx_phase1_prepare_abort(&self, core: &mut RmCore) {
        self.prepare_abort_tx(core);
        self.async_force_log(core);
    }

    fn prepare_commit_tx(&self, core: &mut RmCore) {
        if core.state == RmState::Idle {
            core.state = RmState::PrepareCommitting;
            self.set_tx_cmd_type(core, TxCmdType::RmPrepareCommit);
            tracing::trace!(node = %self.node_name, xid = self.xid, "prepare commit");
        }
    }

    fn prepare_abort_tx(&self, core: &mut RmCore) {
        core.state = RmState::PrepareAborting;
        self.set_tx_cmd_type(core, TxCmdType::RmPrepareAbort);
        tracing::trace!(node = %self.node_name, xid = self.xid, "prepare abort");
    }

    fn handle_finish_tx_phase2_commit(&self, core: &mut RmCore) {
        match core.state {
            RmState::PrepareCommitting => {
                core.state = RmState::Committing;
                self.set_tx_cmd_type(core, TxCmdType::RmCommit);
                tracing::trace!(node = %self.node_name, xid = self.xid, "phase2 commit");
                self.async_force_log(core);
            },
            RmState::Committing => self.send_ack_message(core, true),
            _ => self.protocol_error("phase2 commit in invalid state"),
        }
    }

    fn abort_tx_2p(&self, core: &mut RmCore) {
        match core.state {
            RmState::Idle | RmState::PrepareAborting | RmState::PrepareCommitting => {
                core.state = RmState::Aborting;
                self.set_tx_cmd_type(core, TxCmdType::RmAbort);
                tracing::trace!(node = %self.node_name, xid = self.xid, "phase2 aborted");
                self.async_force_log(core);
            },
            RmState::Aborting | RmState::Ended => self.send_ack_message(core, false),
            RmState::Committing => self.protocol_error("phase2 abort while committing"),
        }
    }

    // ------------------------------------------------------------------
    // Victim and timeout.
    // ------------------------------------------------------------------

    fn on_abort(&self, core: &mut RmCore, ec: ErrCode) {
        if ec == ErrCode::Victim && !core.victim && !self.distributed {
            core.victim = true;
        }
        if !self.distributed {
            if core.state == RmState::Idle {
                core.ec = ec;
                self.abort_tx_1p(core);
            }
        } else {
            // A distributed RM does not abort locally: it escalates to the
            // TM, which drives phase 2.
            let msg = TxVictim {
                xid: self.xid,
                source: self.node_id,
                dest: core.coord_node_id,
            };
            if let Err(e) = self.service.send(core.coord_node_id, Message::TxVictim(msg)) {
                tracing::error!(xid = self.xid, error = %e, "async send victim error");
            }
        }
    }

    fn on_timeout_sweep(&self, core: &mut RmCore) {
        if self.start.elapsed().as_millis() < u128::from(self.tx_timeout_ms) {
            return;
        }
        if !core.timeout_invoked && !core.has_responded {
            core.timeout_invoked = true;
            tracing::warn!(
                node = %self.node_name,
                xid = self.xid,
                wait_ms = self.start.elapsed().as_millis() as u64,
                state = %core.state,
                "transaction exceeded timeout without responding"
            );
        }
        // A durable decision may still be pending; phase 2 belongs to the
        // TM (distributed) or to the commit path (local).
        if matches!(
            core.state,
            RmState::PrepareCommitting | RmState::Committing | RmState::Ended
        ) {
            return;
        }
        if !self.distributed {
            self.abort_tx_1p(core);
            self.send_tx_response(core);
        } else if self.mode.share_nothing {
            self.abort_tx_2p(core);
        }
    }

    // Dependency handlers live in dependency.rs.
    fn on_dep_release(&self, core: &mut RmCore, from_xid: Xid) {
        self.dep_release(core, from_xid);
    }

    fn on_dependency_commit(&self, core: &mut RmCore) {
        self.dependency_commit(core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemoryAccessCache;
    use crate::deadlock::NoopDeadlockDetector;
    use crate::lock::MemoryLockManager;
    use crate::net::MemoryNetService;
    use crate::wal::MemoryWal;

    struct Fixture {
        lock_mgr: Arc<MemoryLockManager>,
        access: Arc<MemoryAccessCache>,
        net: Arc<MemoryNetService>,
        wal: Arc<MemoryWal>,
    }

    impl Fixture {
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
                lock_mgr: Arc::clone(&self.lock_mgr) as Arc<dyn LockManager>,
                access: Arc::clone(&self.access) as Arc<dyn AccessCache>,
                service: Arc::clone(&self.net) as Arc<dyn NetService>,
                wal: Arc::clone(&self.wal) as Arc<dyn WriteAheadLog>,
                detector: Some(Arc::new(NoopDeadlockDetector) as Arc<dyn DeadlockDetector>),
            }
        }
    }

    fn read_op(key: TupleId) -> TxOperation {
        TxOperation::new(OpType::Read, TupleRow::new(1, 1, key, vec![]))
    }

    fn update_op(key: TupleId, tuple: Tuple) -> TxOperation {
        TxOperation::new(OpType::Update, TupleRow::new(1, 1, key, tuple))
    }

    fn request(ops: Vec<TxOperation>) -> TxRequest {
        TxRequest {
            source: 100,
            distributed: false,
            oneshot: true,
            read_only: false,
            operations: ops,
        }
    }

    #[test]
    fn test_state_as_str() {
        assert_eq!(RmState::Idle.as_str(), "RM_IDLE");
        assert_eq!(RmState::Ended.to_string(), "RM_ENDED");
    }

    #[test]
    fn test_construction_defaults() {
        let fx = Fixture::new();
        let rm = TxContext::new(RmConfig::new(1, 1), fx.services(), None);
        assert_eq!(rm.xid(), 1);
        assert_eq!(rm.state(), RmState::Idle);
        assert_eq!(rm.error_code(), ErrCode::Ok);
        assert_eq!(rm.current_oid(), 1);
        assert!(!rm.has_responded());
        assert!(!rm.is_victim());
        assert!(!rm.is_distributed());
    }

    #[test]
    fn test_empty_request_commits_immediately() {
        let fx = Fixture::new();
        let rm = TxContext::new(RmConfig::new(1, 1), fx.services(), None);
        rm.process_tx_request(request(vec![]));
        assert_eq!(rm.state(), RmState::Ended);
        assert!(rm.has_responded());
        assert_eq!(fx.net.sent_to(100).len(), 1);
    }

    #[test]
    fn test_cache_hit_read_commits() {
        let fx = Fixture::new();
        fx.access.put(1, 1, 7, vec![9, 9]);
        let rm = TxContext::new(RmConfig::new(1, 1), fx.services(), None);
        rm.process_tx_request(request(vec![read_op(7)]));

        assert_eq!(rm.state(), RmState::Ended);
        assert_eq!(rm.error_code(), ErrCode::Ok);
        assert_eq!(rm.current_oid(), 2);
        let sent = fx.net.sent_to(100);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::ClientTxResponse(r) => {
                assert_eq!(r.ec, ErrCode::Ok);
                assert_eq!(r.operations.len(), 1);
                assert_eq!(r.operations[0].tuple_row.tuple, vec![9, 9]);
                assert_eq!(r.num_lock, 1);
            },
            other => panic!("expected response, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_update_miss_issues_dsb_read() {
        let fx = Fixture::new();
        let config = RmConfig::new(1, 1).with_dsb_node(5);
        let rm = TxContext::new(config, fx.services(), None);
        rm.process_tx_request(request(vec![update_op(7, vec![1])]));

        // Waiting on the DSB; nothing decided yet.
        assert_eq!(rm.state(), RmState::Idle);
        let sent = fx.net.sent_to(5);
        assert_eq!(sent.len(), 1);
        let oid = match &sent[0] {
            Message::DsbReadRequest(r) => {
                assert_eq!(r.xid, 1);
                assert_eq!(r.tuple_id, 7);
                r.oid
            },
            other => panic!("expected read request, got {}", other.type_name()),
        };

        rm.read_data_from_dsb_response(
            DsbReadResponse {
                xid: 1,
                oid,
                ec: ErrCode::Ok,
                tuple_row: TupleRow::new(1, 1, 7, vec![2]),
                latency_read_dsb: 10,
            },
            Instant::now(),
        );

        assert_eq!(rm.state(), RmState::Ended);
        assert_eq!(rm.error_code(), ErrCode::Ok);
        // The read-through result was cached.
        assert_eq!(fx.access.get(1, 1, 7), Some(vec![2]));
    }

    #[test]
    fn test_missing_shard_owner_aborts() {
        let fx = Fixture::new();
        // No dsb node and no routing entry: the read cannot be issued.
        let rm = TxContext::new(RmConfig::new(1, 1), fx.services(), None);
        rm.process_tx_request(request(vec![read_op(7)]));
        assert_eq!(rm.state(), RmState::Ended);
        assert_eq!(rm.error_code(), ErrCode::Internal);
    }

    #[test]
    fn test_debug_tx_renders_state() {
        let fx = Fixture::new();
        let rm = TxContext::new(RmConfig::new(42, 3), fx.services(), None);
        let mut out = String::new();
        rm.debug_tx(&mut out);
        assert!(out.contains("node_3"));
        assert!(out.contains("42"));
        assert!(out.contains("RM_IDLE"));
    }

    #[test]
    fn test_log_rep_delay_accumulates() {
        let fx = Fixture::new();
        fx.access.put(1, 1, 7, vec![1]);
        let rm = TxContext::new(RmConfig::new(1, 1), fx.services(), None);
        rm.log_rep_delay(25);
        rm.log_rep_delay(17);
        rm.process_tx_request(request(vec![read_op(7)]));
        match &fx.net.sent_to(100)[0] {
            Message::ClientTxResponse(r) => assert_eq!(r.latency_replicate, 42),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_handle_survives_drop() {
        let fx = Fixture::new();
        let rm = TxContext::new(RmConfig::new(1, 1), fx.services(), None);
        let handle = rm.handle();
        assert!(handle.is_live());
        assert_eq!(handle.xid(), 1);
        drop(rm);
        assert!(!handle.is_live());
        // Notifications after drop are ignored.
        handle.async_lock_acquire(ErrCode::Ok, 1);
        handle.on_log_entry_commit(TxCmdType::RmCommit, Instant::now());
    }
}
