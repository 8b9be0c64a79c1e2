//! Network Module
//!
//! Peer-to-peer message transport.
//!
//! ## Architecture
//! - Single acceptor thread, one thread per connection (bounded)
//! - Requests routed through a `PeerHandler` (the 2PC participant)
//! - Clients: pooled TCP connections, or an in-process link for tests and
//!   single-binary clusters

mod server;
mod connection;
mod client;

pub use server::PeerServer;
pub use connection::Connection;
pub use client::{InProcessPeer, TcpPeerClient};

use crate::error::Result;
use crate::protocol::{PeerRequest, PeerResponse};

/// Serves requests arriving from peers
pub trait PeerHandler: Send + Sync {
    fn handle(&self, request: PeerRequest) -> PeerResponse;
}

/// Sends requests to one peer
pub trait PeerClient: Send + Sync {
    /// Peer address for logs
    fn addr(&self) -> &str;

    /// Send one request and wait for its response
    fn send(&self, request: &PeerRequest) -> Result<PeerResponse>;
}
