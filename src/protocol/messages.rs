//! Peer messages

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{DataOp, Query, QueryResult};

/// Message sent to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Stage `ops` and hold them until commit or abort
    Prepare { txn_id: Uuid, ops: Vec<DataOp> },

    Commit { txn_id: Uuid },

    Abort { txn_id: Uuid },

    /// Matching records from the peer's local state (and backup, if any)
    Query { entity_type: String, query: Query },

    Ping,
}

impl PeerRequest {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::Prepare { .. } => "prepare",
            PeerRequest::Commit { .. } => "commit",
            PeerRequest::Abort { .. } => "abort",
            PeerRequest::Query { .. } => "query",
            PeerRequest::Ping => "ping",
        }
    }
}

/// Reply from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    Ack(bool),

    QueryResult(QueryResult),

    Pong,

    Error(String),
}

impl PeerResponse {
    pub fn error(msg: impl ToString) -> Self {
        PeerResponse::Error(msg.to_string())
    }
}
