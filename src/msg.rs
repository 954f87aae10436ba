// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire messages exchanged between the RM, its client, the TM, and DSB nodes.
//!
//! Every message is a plain serde value; the node's transport frames and
//! routes them. Message types mirror the RM-facing protocol:
//! - read-through: `DsbReadRequest` / `DsbReadResponse`
//! - client completion: `ClientTxResponse`
//! - 2PC cohort traffic: `TxRmPrepare`, `TxRmAck`, `TxTmCommit`, `TxTmAbort`
//! - victim escalation: `TxVictim`
//! - early lock release: `TxEnableViolate`

use serde::{Deserialize, Serialize};

use crate::error::ErrCode;
use crate::{Cno, NodeId, Oid, ShardId, TableId, Tuple, TupleId, Xid};

/// Operation kind within a transaction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    /// Read a row under a read lock.
    Read,
    /// Read a row under a write lock.
    ReadForWrite,
    /// Overwrite an existing row.
    Update,
    /// Create a new row.
    Insert,
    /// Delete an existing row, returning it.
    Remove,
}

impl OpType {
    /// Whether this operation takes a write lock from the outset.
    pub fn is_write(self) -> bool {
        !matches!(self, OpType::Read)
    }
}

/// A row reference plus (for writes) its payload bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleRow {
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub tuple_id: TupleId,
    pub tuple: Tuple,
}

impl TupleRow {
    pub fn new(table_id: TableId, shard_id: ShardId, tuple_id: TupleId, tuple: Tuple) -> Self {
        Self {
            table_id,
            shard_id,
            tuple_id,
            tuple,
        }
    }
}

/// A single operation within a transaction request or log record.
///
/// `xid` and `rg_id` are zero on the wire from the client; the RM stamps
/// them when buffering the operation into a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOperation {
    pub op_type: OpType,
    pub tuple_row: TupleRow,
    pub xid: Xid,
    pub rg_id: u32,
}

impl TxOperation {
    pub fn new(op_type: OpType, tuple_row: TupleRow) -> Self {
        Self {
            op_type,
            tuple_row,
            xid: 0,
            rg_id: 0,
        }
    }
}

/// Client request starting a transaction on one RM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRequest {
    /// Requesting node (the client connection for local transactions, the
    /// coordinating TM node for distributed ones).
    pub source: NodeId,
    /// Whether this transaction spans multiple replication groups.
    pub distributed: bool,
    /// One-shot requests carry every operation up front.
    pub oneshot: bool,
    /// Read-only transactions bypass locking and the commit log.
    pub read_only: bool,
    /// Ordered operations to execute.
    pub operations: Vec<TxOperation>,
}

/// Read-through request from the RM to the shard-owning DSB node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsbReadRequest {
    pub source: NodeId,
    pub dest: NodeId,
    pub xid: Xid,
    pub oid: Oid,
    pub cno: Cno,
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub tuple_id: TupleId,
}

/// DSB reply to a read-through request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsbReadResponse {
    pub xid: Xid,
    pub oid: Oid,
    pub ec: ErrCode,
    pub tuple_row: TupleRow,
    /// Microseconds the DSB spent serving the read.
    pub latency_read_dsb: u64,
}

/// Final response to the client: definitive outcome plus telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTxResponse {
    pub xid: Xid,
    pub ec: ErrCode,
    pub latency_append: u64,
    pub latency_read: u64,
    pub latency_read_dsb: u64,
    pub latency_lock_wait: u64,
    pub latency_replicate: u64,
    pub latency_part: u64,
    pub access_part: u32,
    pub num_lock: u32,
    pub num_read_violate: u32,
    pub num_write_violate: u32,
    /// Read results, in operation order.
    pub operations: Vec<TxOperation>,
}

/// Telemetry attached to an affirmative prepare vote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareTelemetry {
    pub latency_append: u64,
    pub latency_read: u64,
    pub latency_lock_wait: u64,
    pub latency_replicate: u64,
    pub latency_part: u64,
    pub num_lock: u32,
    pub num_read_violate: u32,
    pub num_write_violate: u32,
}

/// Phase-1 vote from the RM to its TM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRmPrepare {
    pub xid: Xid,
    pub source_node: NodeId,
    pub source_rg: u32,
    pub dest_node: NodeId,
    pub dest_rg: u32,
    pub commit: bool,
    /// Present iff `commit` is true.
    pub telemetry: Option<PrepareTelemetry>,
}

/// Phase-2 acknowledgment from the RM to its TM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRmAck {
    pub xid: Xid,
    pub source_node: NodeId,
    pub source_rg: u32,
    pub dest_node: NodeId,
    pub dest_rg: u32,
    pub commit: bool,
}

/// Victim escalation from a distributed RM to its TM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxVictim {
    pub xid: Xid,
    pub source: NodeId,
    pub dest: NodeId,
}

/// Phase-2 commit decision from the TM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxTmCommit {
    pub xid: Xid,
}

/// Phase-2 abort decision from the TM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxTmAbort {
    pub xid: Xid,
}

/// Early-release permission report from the RM to its TM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxEnableViolate {
    pub source: NodeId,
    pub dest: NodeId,
    pub violable: bool,
}

/// RM-facing protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Read-through request to a DSB node.
    DsbReadRequest(DsbReadRequest),
    /// Read-through response from a DSB node.
    DsbReadResponse(DsbReadResponse),
    /// Final client response.
    ClientTxResponse(ClientTxResponse),
    /// Phase-1 vote to the TM.
    TxRmPrepare(TxRmPrepare),
    /// Phase-2 acknowledgment to the TM.
    TxRmAck(TxRmAck),
    /// Victim escalation to the TM.
    TxVictim(TxVictim),
    /// Phase-2 commit decision from the TM.
    TxTmCommit(TxTmCommit),
    /// Phase-2 abort decision from the TM.
    TxTmAbort(TxTmAbort),
    /// Early-release permission report.
    TxEnableViolate(TxEnableViolate),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::DsbReadRequest(_) => "DsbReadRequest",
            Message::DsbReadResponse(_) => "DsbReadResponse",
            Message::ClientTxResponse(_) => "ClientTxResponse",
            Message::TxRmPrepare(_) => "TxRmPrepare",
            Message::TxRmAck(_) => "TxRmAck",
            Message::TxVictim(_) => "TxVictim",
            Message::TxTmCommit(_) => "TxTmCommit",
            Message::TxTmAbort(_) => "TxTmAbort",
            Message::TxEnableViolate(_) => "TxEnableViolate",
        }
    }

    /// The transaction this message belongs to, where the protocol carries one.
    pub fn xid(&self) -> Option<Xid> {
        match self {
            Message::DsbReadRequest(m) => Some(m.xid),
            Message::DsbReadResponse(m) => Some(m.xid),
            Message::ClientTxResponse(m) => Some(m.xid),
            Message::TxRmPrepare(m) => Some(m.xid),
            Message::TxRmAck(m) => Some(m.xid),
            Message::TxVictim(m) => Some(m.xid),
            Message::TxTmCommit(m) => Some(m.xid),
            Message::TxTmAbort(m) => Some(m.xid),
            Message::TxEnableViolate(_) => None,
        }
    }
}
