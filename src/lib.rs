//! # AtlasRepo
//!
//! An in-memory, replicated object repository with:
//! - Optimistic (STM) transactions with transparent retry
//! - Versioned entities, higher version wins on merge
//! - Hash-partitioned ownership with configurable replication
//! - Two-phase commit replication to the owning peers
//! - Optional synchronous backup log (CRC-checked, torn-tail recovery)
//! - TCP peer protocol
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Repository::in_transaction                   │
//! │            (RepoTxn: find / insert / update / remove)        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ EntityStore │          │  Backends   │
//!   │  (per type) │          │ (2PC, WAL)  │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌─────────────┐          ┌─────────────┐       ┌─────────────┐
//!   │     STM     │          │   Cluster   │──────►│ Participant │
//!   │ (TVar/TMap) │          │  transport  │ peers │ (PeerServer)│
//!   └─────────────┘          └─────────────┘       └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod stm;
pub mod entity;
pub mod ownership;
pub mod store;
pub mod repository;
pub mod backend;
pub mod network;
pub mod protocol;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{RepoError, Result};
pub use config::{Config, PeerConfig};
pub use entity::{DataOp, DataOpKind, Entity, EntityRecord, KeyBytes, Query, QueryResult};
pub use repository::{Accessor, RepoTxn, Repository};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasRepo
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
