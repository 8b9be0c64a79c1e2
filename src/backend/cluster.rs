//! Cluster transport
//!
//! Sends 2PC messages to the peers that own the affected entities and fans
//! queries out to every peer.
//!
//! ## Query Completeness
//! A fan-out is complete when this node has its own backup, when any peer
//! with a backup answered, or when every peer answered. A complete answer to
//! this node's ownership query makes the result owned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::{Config, PeerConfig};
use crate::entity::{DataOp, Query, QueryResult};
use crate::error::{RepoError, Result};
use crate::network::{PeerClient, TcpPeerClient};
use crate::ownership;
use crate::protocol::{PeerRequest, PeerResponse};
use super::{BackendResult, TwoPhaseTransport};

/// Commit messages are resent this many times on transport errors
const COMMIT_ATTEMPTS: u32 = 3;

struct RemotePeer {
    config: PeerConfig,
    position: u32,
    client: Arc<dyn PeerClient>,
}

/// 2PC transport over the static topology
pub struct ClusterBackend {
    peers: Vec<RemotePeer>,
    nodes: u32,
    replicas: u32,
    local_backup: bool,
    ownership_query: Query,
}

impl ClusterBackend {
    /// `clients` must hold a client for every peer except this node
    pub fn new(config: &Config, mut clients: HashMap<u32, Arc<dyn PeerClient>>) -> Result<Self> {
        config.validate()?;

        let mut peers = Vec::new();
        for (position, peer) in config.peers.iter().enumerate() {
            if peer.id == config.node_id {
                continue;
            }
            let client = clients.remove(&peer.id).ok_or_else(|| {
                RepoError::Config(format!("no client for peer {} ({})", peer.id, peer.addr))
            })?;
            peers.push(RemotePeer {
                config: peer.clone(),
                position: position as u32,
                client,
            });
        }

        Ok(Self {
            peers,
            nodes: config.peers.len() as u32,
            replicas: config.effective_replicas(),
            local_backup: config.me().map_or(false, |me| me.backup.is_some()),
            ownership_query: ownership::ownership_query(config),
        })
    }

    /// TCP clients for every peer; responses may take up to the transaction timeout
    pub fn connect_tcp(config: &Config) -> Result<Self> {
        let io_timeout = Duration::from_millis(config.read_timeout_ms).max(config.transaction_timeout());
        let clients = config
            .peers
            .iter()
            .filter(|peer| peer.id != config.node_id)
            .map(|peer| {
                let client: Arc<dyn PeerClient> = Arc::new(TcpPeerClient::new(peer.addr.clone(), io_timeout));
                (peer.id, client)
            })
            .collect();
        Self::new(config, clients)
    }

    /// Peers that must take part in replicating `ops`: those with a backup
    /// store and those owning any affected entity
    fn owners(&self, ops: &[DataOp]) -> Vec<&RemotePeer> {
        self.peers
            .iter()
            .filter(|peer| {
                peer.config.backup.is_some()
                    || ops.iter().any(|op| {
                        ownership::is_owner(peer.position, &op.record.key, self.nodes, self.replicas)
                    })
            })
            .collect()
    }

    pub fn owner_ids(&self, ops: &[DataOp]) -> Vec<u32> {
        self.owners(ops).iter().map(|peer| peer.config.id).collect()
    }

    /// Send `request` to every peer in `targets` in parallel
    fn broadcast(&self, targets: &[&RemotePeer], request: &PeerRequest) -> Vec<Result<PeerResponse>> {
        if targets.len() == 1 {
            return vec![targets[0].client.send(request)];
        }

        let sent = crossbeam::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|peer| scope.spawn(move |_| peer.client.send(request)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(RepoError::Network("peer request panicked".to_string()))
                    })
                })
                .collect::<Vec<_>>()
        });

        sent.unwrap_or_else(|_| {
            targets
                .iter()
                .map(|_| Err(RepoError::Network("peer fan-out panicked".to_string())))
                .collect()
        })
    }

    fn commit_one(peer: &RemotePeer, request: &PeerRequest) -> Result<()> {
        let mut last = None;
        for attempt in 1..=COMMIT_ATTEMPTS {
            match peer.client.send(request) {
                Ok(PeerResponse::Ack(true)) => return Ok(()),
                Ok(other) => {
                    return Err(RepoError::Replication {
                        during_commit: true,
                        reason: format!("peer {} answered commit with {:?}", peer.config.id, other),
                    })
                }
                Err(e) => {
                    tracing::warn!(peer = peer.config.id, attempt, error = %e, "commit message failed");
                    last = Some(e);
                }
            }
        }
        Err(RepoError::Replication {
            during_commit: true,
            reason: format!(
                "peer {} unreachable during commit: {}",
                peer.config.id,
                last.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }
}

impl TwoPhaseTransport for ClusterBackend {
    fn name(&self) -> &str {
        "cluster"
    }

    fn prepare(&self, txn_id: Uuid, ops: &[DataOp]) -> Result<BackendResult> {
        let targets = self.owners(ops);
        if targets.is_empty() {
            return Ok(BackendResult::success());
        }

        let request = PeerRequest::Prepare {
            txn_id,
            ops: ops.to_vec(),
        };

        let mut accepted = true;
        for (peer, answer) in targets.iter().zip(self.broadcast(&targets, &request)) {
            match answer {
                Ok(PeerResponse::Ack(true)) => {}
                Ok(PeerResponse::Ack(false)) => {
                    tracing::debug!(%txn_id, peer = peer.config.id, "peer rejected prepare");
                    accepted = false;
                }
                Ok(other) => {
                    tracing::warn!(%txn_id, peer = peer.config.id, response = ?other, "unexpected prepare response");
                    accepted = false;
                }
                Err(e) => {
                    tracing::warn!(%txn_id, peer = peer.config.id, error = %e, "prepare failed");
                    accepted = false;
                }
            }
        }

        if accepted {
            Ok(BackendResult::success())
        } else {
            Ok(BackendResult::rejected(ops))
        }
    }

    fn commit(&self, txn_id: Uuid, ops: &[DataOp]) -> Result<()> {
        let targets = self.owners(ops);
        let request = PeerRequest::Commit { txn_id };

        let outcomes: Vec<Result<()>> = if targets.len() <= 1 {
            targets.iter().map(|peer| Self::commit_one(peer, &request)).collect()
        } else {
            crossbeam::scope(|scope| {
                let handles: Vec<_> = targets
                    .iter()
                    .map(|peer| {
                        let request = &request;
                        scope.spawn(move |_| Self::commit_one(peer, request))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(RepoError::Network("commit request panicked".to_string()))
                        })
                    })
                    .collect()
            })
            .map_err(|_| RepoError::Network("commit fan-out panicked".to_string()))?
        };

        // Report the first failure; every peer was still asked to commit
        outcomes.into_iter().collect()
    }

    fn abort(&self, txn_id: Uuid, ops: &[DataOp]) {
        let targets = self.owners(ops);
        let request = PeerRequest::Abort { txn_id };
        for (peer, answer) in targets.iter().zip(self.broadcast(&targets, &request)) {
            if let Err(e) = answer {
                tracing::debug!(%txn_id, peer = peer.config.id, error = %e, "abort not delivered");
            }
        }
    }

    fn query(&self, entity_type: &str, query: &Query) -> Result<Option<QueryResult>> {
        let request = PeerRequest::Query {
            entity_type: entity_type.to_string(),
            query: query.clone(),
        };
        let targets: Vec<&RemotePeer> = self.peers.iter().collect();
        let answers = if targets.is_empty() {
            Vec::new()
        } else {
            self.broadcast(&targets, &request)
        };

        let mut results = Vec::new();
        let mut backup_answered = false;
        for (peer, answer) in targets.iter().zip(answers) {
            match answer {
                Ok(PeerResponse::QueryResult(result)) => {
                    backup_answered |= peer.config.backup.is_some();
                    results.push(result);
                }
                Ok(other) => {
                    tracing::warn!(peer = peer.config.id, entity_type, query = %query, response = ?other, "unexpected query response");
                }
                Err(e) => {
                    tracing::warn!(peer = peer.config.id, entity_type, query = %query, error = %e, "peer query failed");
                }
            }
        }

        let answered = results.len();
        let complete = self.local_backup || backup_answered || answered == self.peers.len();
        if answered == 0 && !complete {
            return Ok(None);
        }

        let records = QueryResult::merge(results)
            .map(|merged| merged.dedup_by_version().records)
            .unwrap_or_default();
        let owned = complete && *query == self.ownership_query;

        tracing::debug!(
            entity_type,
            query = %query,
            answered,
            peers = self.peers.len(),
            complete,
            owned,
            "cluster query"
        );
        Ok(Some(QueryResult::new(owned, records)))
    }
}
