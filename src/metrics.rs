// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-transaction phase timers and counters.
//!
//! Unlike node-wide stats these are single-writer: every mutation happens on
//! the owning RM's executor, so plain fields suffice. The accumulated
//! figures surface in the client response and in the prepare vote.

use std::time::Instant;

/// Accumulating stopwatch for one phase of a transaction.
///
/// `begin`/`end` pairs add to the running total; `end_at` closes the open
/// span against an externally observed timestamp (e.g. the instant a log
/// entry became durable). Unmatched `end`s are ignored.
#[derive(Debug, Default)]
pub struct PhaseTimer {
    accum_us: u64,
    started: Option<Instant>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn end(&mut self) {
        if let Some(start) = self.started.take() {
            self.accum_us += start.elapsed().as_micros() as u64;
        }
    }

    /// Close the open span at `ts` instead of now.
    pub fn end_at(&mut self, ts: Instant) {
        if let Some(start) = self.started.take() {
            self.accum_us += ts.saturating_duration_since(start).as_micros() as u64;
        }
    }

    /// Total accumulated microseconds.
    pub fn microseconds(&self) -> u64 {
        self.accum_us
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }
}

/// Telemetry accumulated over one transaction's lifetime.
#[derive(Debug, Default)]
pub struct TxTelemetry {
    /// Time spent waiting for lock grants.
    pub lock_wait: PhaseTimer,
    /// Time spent in read-through round trips.
    pub read: PhaseTimer,
    /// Time between forcing the log and the commit callback.
    pub append: PhaseTimer,
    /// Whole-participation time, construction to response.
    pub part: PhaseTimer,
    /// DSB-reported service time, microseconds.
    pub latency_read_dsb: u64,
    /// Replication delay reported by the log, microseconds.
    pub log_rep_delay: u64,
    pub num_lock: u32,
    pub num_read_violate: u32,
    pub num_write_violate: u32,
}

impl TxTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}
