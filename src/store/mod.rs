//! Store Module
//!
//! Per-type in-memory state: the tracked entities, the queries this node
//! owns, and the cached results of queries it does not own.
//!
//! ## Responsibilities
//! - Read-through queries: owned/cached data is served directly, anything else
//!   registers a deferred remote load and forces the transaction to retry
//! - Ownership-aware `add` / `update` / `remove`
//! - `import` (higher version wins) and `invalidate` (drops data and ownership)
//! - `perform_extern`: staging another node's prepared operations
//! - Type-erased dispatch by type tag, filled by explicit registration
//!
//! ## Layout per entity type
//! ```text
//!   EntityStore<T>
//!   ├── entities : TMap<KeyBytes, T>     tracked (owned) entities, tagged slots
//!   └── meta     : TVar<StoreMeta>
//!                  ├── owned  : [Query]
//!                  └── cached : [(Query, TMap<KeyBytes, T>)]   bounded, oldest evicted
//! ```

mod entity_store;
mod registry;

use std::sync::Arc;
use std::time::Duration;

pub use entity_store::EntityStore;
pub(crate) use registry::{ErasedStore, PendingValue, StoreRegistry};

use crate::entity::{Query, QueryResult};
use crate::error::Result;
use crate::ownership::RecoveryPolicy;
use crate::repository::RepoStats;
use crate::stm::Stm;

/// Where stores load the data they do not have
pub trait QuerySource: Send + Sync {
    /// `None` when no source could answer
    fn run_query(&self, entity_type: &str, query: &Query) -> Result<Option<QueryResult>>;
}

/// Shared services a store needs
#[derive(Clone)]
pub struct StoreContext {
    pub stm: Arc<Stm>,
    pub source: Arc<dyn QuerySource>,
    pub recovery: Arc<RecoveryPolicy>,
    pub stats: Arc<RepoStats>,
    /// Timeout of the store's own import/invalidate transactions
    pub transaction_timeout: Duration,
    /// Timeout of loads made while (re)acquiring ownership
    pub load_timeout: Duration,
    /// Max cached (non-owned) queries per type
    pub cache_capacity: usize,
}
