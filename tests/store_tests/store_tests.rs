//! Tests for per-type stores
//!
//! These tests verify:
//! - Unowned queries are loaded once and then served from the cache
//! - Local writes keep cached query results current
//! - The cache is bounded and evicts the oldest query
//! - Owned data is served without loading

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use atlasrepo::{Config, EntityRecord, PeerConfig, Query, QueryResult, RepoError, Repository};
use common::{single_node_with, Account, Behavior, ScriptedBackend};

// =============================================================================
// Helper Functions
// =============================================================================

fn remote(id: u64, owner: &str, version: u64) -> EntityRecord {
    let mut account = Account::new(id, owner, 10);
    account.version = version;
    EntityRecord::from_entity(&account).unwrap()
}

/// Repository that owns nothing; the backend answers every query with `records`
fn unowned_repo(cache_capacity: usize, records: Vec<EntityRecord>) -> (Repository, Arc<ScriptedBackend>) {
    let config = Config::builder()
        .node_id(1)
        .peers(vec![PeerConfig::new(1, "inproc-1")])
        .cache_capacity(cache_capacity)
        .transaction_timeout_ms(2000)
        .build();

    let repo = Repository::new(config).unwrap();
    repo.register::<Account>().unwrap();

    let backend = ScriptedBackend::new(Behavior::Accept);
    *backend.answer.lock() = Some(QueryResult::new(false, records));
    repo.add_backend(backend.clone());
    (repo, backend)
}

fn owners(accounts: &[Arc<Account>]) -> Vec<u64> {
    let mut ids: Vec<u64> = accounts.iter().map(|a| a.id).collect();
    ids.sort_unstable();
    ids
}

// =============================================================================
// Cached Queries
// =============================================================================

#[test]
fn test_unowned_query_is_loaded_once() {
    let (repo, backend) = unowned_repo(8, vec![remote(1, "ann", 1), remote(2, "bob", 1)]);
    let accounts = repo.accessor::<Account>();
    let by_ann = Query::field_eq("owner", "ann");

    let first = accounts.get_all(&by_ann).unwrap();
    assert_eq!(owners(&first), vec![1]);
    assert_eq!(backend.query_count(), 1);

    let second = accounts.get_all(&by_ann).unwrap();
    assert_eq!(owners(&second), vec![1]);
    assert_eq!(backend.query_count(), 1);

    let store = repo.store::<Account>().unwrap();
    assert_eq!(store.cached_queries(), vec![by_ann]);
    assert!(store.owned_queries().is_empty());
}

#[test]
fn test_local_insert_updates_cached_query() {
    let (repo, backend) = unowned_repo(8, vec![remote(1, "ann", 1)]);
    let accounts = repo.accessor::<Account>();
    let by_ann = Query::field_eq("owner", "ann");

    accounts.get_all(&by_ann).unwrap();
    accounts.insert(Account::new(3, "ann", 50)).unwrap();

    let cached = accounts.get_all(&by_ann).unwrap();
    assert_eq!(owners(&cached), vec![1, 3]);
    assert_eq!(backend.query_count(), 1);

    // The inserted entity was replicated with its bumped version
    let batches = backend.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].record.version, 1);
}

#[test]
fn test_update_moves_entity_between_cached_queries() {
    let (repo, _backend) = unowned_repo(8, vec![remote(1, "ann", 1), remote(2, "bob", 1)]);
    let accounts = repo.accessor::<Account>();
    let by_ann = Query::field_eq("owner", "ann");
    let by_bob = Query::field_eq("owner", "bob");

    accounts.get_all(&by_ann).unwrap();
    accounts.get_all(&by_bob).unwrap();

    let mut moved = (*accounts.find(&1).unwrap()).clone();
    moved.owner = "bob".to_string();
    accounts.update(moved).unwrap();

    assert!(owners(&accounts.get_all(&by_ann).unwrap()).is_empty());
    let bobs = accounts.get_all(&by_bob).unwrap();
    assert_eq!(owners(&bobs), vec![1, 2]);
    let one = bobs.iter().find(|a| a.id == 1).unwrap();
    assert_eq!(one.version, 2);
}

#[test]
fn test_cache_capacity_evicts_oldest() {
    let (repo, backend) = unowned_repo(2, vec![remote(1, "ann", 1)]);
    let accounts = repo.accessor::<Account>();

    for owner in ["ann", "bob", "cy"] {
        accounts.get_all(&Query::field_eq("owner", owner)).unwrap();
    }
    assert_eq!(backend.query_count(), 3);

    let cached = repo.store::<Account>().unwrap().cached_queries();
    assert_eq!(cached.len(), 2);
    assert!(!cached.contains(&Query::field_eq("owner", "ann")));

    // Evicted: loaded again
    accounts.get_all(&Query::field_eq("owner", "ann")).unwrap();
    assert_eq!(backend.query_count(), 4);
}

#[test]
fn test_unanswered_load_is_an_error() {
    let (repo, backend) = unowned_repo(8, Vec::new());
    *backend.answer.lock() = None;

    let err = repo.accessor::<Account>().get_all(&Query::All).unwrap_err();
    assert!(matches!(err, RepoError::Network(_)));
}

// =============================================================================
// Owned Data
// =============================================================================

#[test]
fn test_owned_store_serves_without_loading() {
    let backend = ScriptedBackend::new(Behavior::Accept);
    let repo = single_node_with(backend.clone());
    let accounts = repo.accessor::<Account>();
    let baseline = backend.query_count();

    accounts.insert(Account::new(1, "ann", 5)).unwrap();
    assert_eq!(owners(&accounts.get_all(&Query::field_eq("owner", "ann")).unwrap()), vec![1]);
    assert!(accounts.try_find(&99).unwrap().is_none());
    assert!(matches!(accounts.find(&99), Err(RepoError::NotFound(_))));

    assert_eq!(backend.query_count(), baseline);
    assert_eq!(repo.store::<Account>().unwrap().tracked_len(), 1);
}

#[test]
fn test_get_local_never_loads() {
    let (repo, backend) = unowned_repo(8, vec![remote(1, "ann", 1)]);
    let local = repo.accessor::<Account>().get_local(&Query::All).unwrap();
    assert!(local.is_empty());
    assert_eq!(backend.query_count(), 0);
}
