//! Shared test fixtures
//!
//! Entities, in-memory backends and in-process clusters used across the
//! integration test targets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use atlasrepo::backend::{Backend, BackendResult, ClusterBackend, Participant, TwoPhaseBackend};
use atlasrepo::network::{InProcessPeer, PeerClient};
use atlasrepo::ownership::{self, FatalOwnershipLoss};
use atlasrepo::{
    Config, DataOp, Entity, PeerConfig, Query, QueryResult, RepoError, Repository, Result,
};

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub version: u64,
    pub owner: String,
    pub balance: i64,
}

impl Account {
    pub fn new(id: u64, owner: &str, balance: i64) -> Self {
        Self {
            id,
            version: 0,
            owner: owner.to_string(),
            balance,
        }
    }
}

impl Entity for Account {
    type Key = u64;
    const TYPE_NAME: &'static str = "Account";

    fn id(&self) -> u64 {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "owner" => Some(self.owner.clone()),
            _ => None,
        }
    }
}

// =============================================================================
// Scripted Backend
// =============================================================================

/// How a `ScriptedBackend` answers `run`
#[derive(Debug, Clone)]
pub enum Behavior {
    Accept,
    Reject,
    /// Reject with an explicit reconciliation hint
    RejectWithUpdate(Vec<atlasrepo::EntityRecord>),
    /// Error after the point of no return
    FailAfterCommit,
    Hang(Duration),
}

/// Records every batch and answers queries from a fixed result
pub struct ScriptedBackend {
    pub behavior: Mutex<Behavior>,
    pub batches: Mutex<Vec<Vec<DataOp>>>,
    pub answer: Mutex<Option<QueryResult>>,
    pub queries: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            batches: Mutex::new(Vec::new()),
            answer: Mutex::new(Some(QueryResult::not_owned())),
            queries: AtomicUsize::new(0),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn batches(&self) -> Vec<Vec<DataOp>> {
        self.batches.lock().clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run(&self, ops: &[DataOp]) -> Result<BackendResult> {
        self.batches.lock().push(ops.to_vec());
        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::Accept => Ok(BackendResult::success()),
            Behavior::Reject => Ok(BackendResult::rejected(ops)),
            Behavior::RejectWithUpdate(update) => Ok(BackendResult::with_hints(Vec::new(), update)),
            Behavior::FailAfterCommit => Err(RepoError::Replication {
                during_commit: true,
                reason: "scripted failure".to_string(),
            }),
            Behavior::Hang(delay) => {
                std::thread::sleep(delay);
                Ok(BackendResult::success())
            }
        }
    }

    fn query(&self, _entity_type: &str, _query: &Query) -> Result<Option<QueryResult>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.lock().clone())
    }
}

// =============================================================================
// Single Node
// =============================================================================

pub fn single_node_config() -> Config {
    Config::builder()
        .node_id(1)
        .peers(vec![PeerConfig::new(1, "inproc-1")])
        .replication_factor(1)
        .transaction_timeout_ms(2000)
        .ownership_max_attempts(3)
        .ownership_backoff_ms(10, 20)
        .build()
}

/// Repository with `Account` registered, owning every account, replicating
/// to `backend`; ownership loss is not fatal
pub fn single_node_with(backend: Arc<ScriptedBackend>) -> Repository {
    single_node_with_config(single_node_config(), backend)
}

pub fn single_node_with_config(config: Config, backend: Arc<ScriptedBackend>) -> Repository {
    let repo = Repository::new(config).unwrap();
    repo.set_fatal_hook(Arc::new(|_: &FatalOwnershipLoss| {}));
    repo.register::<Account>().unwrap();

    // Grant ownership of everything, then replicate to the scripted backend
    *backend.answer.lock() = Some(QueryResult::new(true, Vec::new()));
    repo.add_backend(backend.clone());
    assert!(repo.acquire::<Account>(&Query::All).unwrap());
    *backend.answer.lock() = Some(QueryResult::not_owned());
    repo
}

// =============================================================================
// In-Process Cluster
// =============================================================================

pub struct Node {
    pub id: u32,
    pub repo: Arc<Repository>,
    pub participant: Arc<Participant>,
    /// Link other nodes use to reach this one
    pub link: Arc<InProcessPeer>,
}

impl Node {
    pub fn accounts(&self) -> atlasrepo::Accessor<'_, Account> {
        self.repo.accessor::<Account>()
    }
}

pub fn cluster_config(node_id: u32, nodes: u32, replication_factor: u32) -> Config {
    let peers = (1..=nodes)
        .map(|id| PeerConfig::new(id, format!("inproc-{}", id)))
        .collect();
    Config::builder()
        .node_id(node_id)
        .peers(peers)
        .replication_factor(replication_factor)
        .transaction_timeout_ms(2000)
        .prepared_ttl_ms(10_000)
        .ownership_max_attempts(3)
        .ownership_backoff_ms(10, 20)
        .build()
}

/// `nodes` repositories wired over in-process links, each owning its
/// partition of `Account`
pub fn cluster(nodes: u32, replication_factor: u32) -> Vec<Node> {
    let links: Vec<Arc<InProcessPeer>> = (1..=nodes)
        .map(|id| Arc::new(InProcessPeer::new(format!("inproc-{}", id))))
        .collect();

    let mut built = Vec::new();
    for id in 1..=nodes {
        let config = cluster_config(id, nodes, replication_factor);
        let repo = Arc::new(Repository::new(config.clone()).unwrap());
        repo.register::<Account>().unwrap();
        repo.set_fatal_hook(Arc::new(|_: &FatalOwnershipLoss| {}));

        let clients: HashMap<u32, Arc<dyn PeerClient>> = (1..=nodes)
            .filter(|other| *other != id)
            .map(|other| {
                let link: Arc<dyn PeerClient> = links[(other - 1) as usize].clone();
                (other, link)
            })
            .collect();
        let cluster = ClusterBackend::new(&config, clients).unwrap();
        repo.add_backend(Arc::new(TwoPhaseBackend::new(cluster)));

        let participant = Arc::new(Participant::new(Arc::clone(&repo)));
        let link = Arc::clone(&links[(id - 1) as usize]);
        link.connect(participant.clone());

        built.push(Node {
            id,
            repo,
            participant,
            link,
        });
    }

    for node in &built {
        let query = ownership::ownership_query(node.repo.config());
        assert!(node.repo.acquire::<Account>(&query).unwrap());
    }
    built
}

/// Poll `cond` for up to two seconds
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
