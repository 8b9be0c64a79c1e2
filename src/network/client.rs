//! Peer clients
//!
//! `TcpPeerClient` keeps a small pool of idle connections per peer.
//! `InProcessPeer` passes frames straight to a handler in the same process.

use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{RepoError, Result};
use crate::protocol::{
    decode_request, decode_response, encode_request, encode_response, read_response,
    write_request, PeerRequest, PeerResponse,
};
use super::{PeerClient, PeerHandler};

/// Idle connections kept per peer
const MAX_IDLE: usize = 8;

struct PooledStream {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl PooledStream {
    fn exchange(&mut self, request: &PeerRequest) -> Result<PeerResponse> {
        write_request(&mut self.writer, request)?;
        read_response(&mut self.reader)
    }
}

// =============================================================================
// TCP Client
// =============================================================================

/// Client for one remote peer
pub struct TcpPeerClient {
    addr: String,
    io_timeout: Duration,
    idle: Mutex<Vec<PooledStream>>,
}

impl TcpPeerClient {
    /// `io_timeout` bounds connect, each write and the wait for a response
    pub fn new(addr: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            io_timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn connect(&self) -> Result<PooledStream> {
        let target = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RepoError::Network(format!("cannot resolve {}", self.addr)))?;

        let stream = if self.io_timeout.is_zero() {
            TcpStream::connect(target)?
        } else {
            TcpStream::connect_timeout(&target, self.io_timeout)?
        };
        stream.set_nodelay(true)?;
        if !self.io_timeout.is_zero() {
            stream.set_read_timeout(Some(self.io_timeout))?;
            stream.set_write_timeout(Some(self.io_timeout))?;
        }

        let read_stream = stream.try_clone()?;
        Ok(PooledStream {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
        })
    }

    fn release(&self, stream: PooledStream) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(stream);
        }
    }
}

impl PeerClient for TcpPeerClient {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn send(&self, request: &PeerRequest) -> Result<PeerResponse> {
        // A pooled connection may have been closed by the peer while idle
        let pooled = self.idle.lock().pop();
        if let Some(mut stream) = pooled {
            match stream.exchange(request) {
                Ok(response) => {
                    self.release(stream);
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!(peer = %self.addr, error = %e, "pooled connection failed, reconnecting");
                }
            }
        }

        let mut stream = self
            .connect()
            .map_err(|e| RepoError::Network(format!("connect to {} failed: {}", self.addr, e)))?;
        let response = stream
            .exchange(request)
            .map_err(|e| RepoError::Network(format!("{} to {} failed: {}", request.kind(), self.addr, e)))?;
        self.release(stream);
        Ok(response)
    }
}

// =============================================================================
// In-Process Link
// =============================================================================

/// Link to a handler in the same process
///
/// Frames go through the wire codec. A link can be connected after
/// construction and disconnected to simulate a peer going down.
pub struct InProcessPeer {
    name: String,
    handler: RwLock<Option<Arc<dyn PeerHandler>>>,
}

impl InProcessPeer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: RwLock::new(None),
        }
    }

    pub fn connected(name: impl Into<String>, handler: Arc<dyn PeerHandler>) -> Self {
        let peer = Self::new(name);
        peer.connect(handler);
        peer
    }

    pub fn connect(&self, handler: Arc<dyn PeerHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn disconnect(&self) {
        *self.handler.write() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.handler.read().is_some()
    }
}

impl PeerClient for InProcessPeer {
    fn addr(&self) -> &str {
        &self.name
    }

    fn send(&self, request: &PeerRequest) -> Result<PeerResponse> {
        let handler = self
            .handler
            .read()
            .clone()
            .ok_or_else(|| RepoError::Network(format!("peer {} is down", self.name)))?;

        let request = decode_request(&encode_request(request)?)?;
        let response = handler.handle(request);
        decode_response(&encode_response(&response)?)
    }
}
