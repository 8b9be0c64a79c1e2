//! STM Module
//!
//! Optimistic in-memory transactions with automatic retry.
//!
//! ## Responsibilities
//! - Transactional cells (`TVar`) and maps (`TMap`) with version stamps
//! - Read/write set tracking per transaction (`Txn`)
//! - Conflict detection and transparent re-execution (`Stm::run`)
//! - Deferred effects: loads run once before a retry, commit effects run once after commit
//! - Held-open commits (`Continuation`) for two-phase protocols
//!
//! ## Concurrency Model (TL2 style)
//!
//! ```text
//!   begin ──► read_stamp = CLOCK
//!     │
//!     ▼
//!   body(txn)          reads: cell.version <= read_stamp and unlocked, else Conflict
//!     │                writes: buffered in the write set
//!     ▼
//!   lock write cells (id order, try-lock, Conflict on contention)
//!     │
//!   bump generations of maps gaining a key
//!     │
//!   validate read set (version unchanged, not locked by others)
//!   validate key guards (missed keys still absent, written slots still live)
//!     │
//!     ├──► Continuation (locks held) ──► commit / rollback
//!     ▼
//!   write back with version = ++CLOCK, unlock, reclaim empty slots, run commit effects
//! ```

mod var;
mod map;
mod txn;
mod engine;

use std::sync::atomic::{AtomicU64, Ordering};

pub use var::TVar;
pub use map::TMap;
pub use txn::Txn;
pub use engine::{Continuation, Stm, StmStats};

/// Global version clock shared by every cell in the process
static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Source of unique cell and transaction ids
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn current_stamp() -> u64 {
    CLOCK.load(Ordering::Acquire)
}

fn next_stamp() -> u64 {
    CLOCK.fetch_add(1, Ordering::AcqRel) + 1
}

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
