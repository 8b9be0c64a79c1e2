//! Backend Module
//!
//! Replication targets of the repository.
//!
//! ## Responsibilities
//! - `Backend`: replicate a batch of operations, answer queries
//! - `TwoPhaseBackend`: prepare / commit / abort over a `TwoPhaseTransport`,
//!   with an optional synchronous backup written after commit
//! - `Participant`: the receiving side of 2PC (pending table, expiry) and the
//!   peer query handler
//! - `ClusterBackend`: the transport that talks to the peers owning the
//!   affected entities
//! - `WalBackup`: append-only backup store answering queries by replay
//!
//! ## Two-Phase Commit
//! ```text
//!   coordinator                         owning peers
//!   ───────────                         ────────────
//!   prepare(txn_id, ops) ─────────────► perform_extern, hold continuation
//!        ◄──────────────────────────── ack(true / false)
//!   all true?  commit(txn_id) ────────► commit continuation (+ backup)
//!   else       abort(txn_id)  ────────► roll back continuation
//!   backup.run(ops)                     (when configured)
//! ```

mod two_phase;
mod participant;
mod cluster;
pub mod backup;

pub use two_phase::{TwoPhaseBackend, TwoPhaseTransport};
pub use participant::Participant;
pub use cluster::ClusterBackend;
pub use backup::WalBackup;

use crate::entity::{DataOp, EntityRecord, Query, QueryResult};
use crate::error::Result;

/// A replication target
pub trait Backend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Replicate a batch of operations
    ///
    /// `Ok` with `ok == false` is a clean rejection (nothing was committed).
    /// `Err` is reserved for failures after the point of no return.
    fn run(&self, ops: &[DataOp]) -> Result<BackendResult>;

    /// Matching records, or `None` if this backend cannot answer
    fn query(&self, entity_type: &str, query: &Query) -> Result<Option<QueryResult>>;
}

/// Outcome of a replication batch, with reconciliation hints on failure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendResult {
    pub ok: bool,
    /// Records whose local state must be dropped
    pub invalidate: Vec<EntityRecord>,
    /// Newer records to import
    pub update: Vec<EntityRecord>,
}

impl BackendResult {
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }

    /// Rejected by a peer: every record of the batch is suspect
    pub fn rejected(ops: &[DataOp]) -> Self {
        Self {
            ok: false,
            invalidate: ops.iter().map(|op| op.record.clone()).collect(),
            update: Vec::new(),
        }
    }

    pub fn with_hints(invalidate: Vec<EntityRecord>, update: Vec<EntityRecord>) -> Self {
        Self {
            ok: false,
            invalidate,
            update,
        }
    }

    /// Ok only if every part is ok; hints are concatenated
    pub fn merge(results: impl IntoIterator<Item = BackendResult>) -> Self {
        let mut merged = Self::success();
        for res in results {
            merged.ok &= res.ok;
            merged.invalidate.extend(res.invalidate);
            merged.update.extend(res.update);
        }
        if merged.ok {
            merged.invalidate.clear();
            merged.update.clear();
        }
        merged
    }
}
