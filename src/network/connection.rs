//! Connection Handler
//!
//! Handles one inbound peer connection.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RepoError, Result};
use crate::protocol::{read_request, write_response, PeerResponse};
use super::PeerHandler;

/// Handles a single peer connection
pub struct Connection {
    /// TCP stream reader (buffered for efficiency)
    reader: BufReader<TcpStream>,

    /// TCP stream writer (buffered for efficiency)
    writer: BufWriter<TcpStream>,

    /// Where requests are dispatched
    handler: Arc<dyn PeerHandler>,

    /// Peer address for logging
    peer_addr: String,
}

/// Errors that mean the peer went away rather than misbehaved
fn is_disconnect(err: &RepoError) -> bool {
    match err {
        RepoError::Io(e) => matches!(
            e.kind(),
            ErrorKind::UnexpectedEof
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::WouldBlock
                | ErrorKind::TimedOut
        ),
        _ => false,
    }
}

impl Connection {
    /// Create a new connection handler
    pub fn new(stream: TcpStream, handler: Arc<dyn PeerHandler>) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let read_stream = stream.try_clone()?;

        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
            handler,
            peer_addr,
        })
    }

    /// Configure connection timeouts (0 disables)
    pub fn set_timeouts(&mut self, read_ms: u64, write_ms: u64) -> Result<()> {
        if read_ms > 0 {
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_millis(read_ms)))?;
        }
        if write_ms > 0 {
            self.writer
                .get_ref()
                .set_write_timeout(Some(Duration::from_millis(write_ms)))?;
        }
        Ok(())
    }

    /// Serve requests until the peer disconnects or an error occurs
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!(peer = %self.peer_addr, "peer connection established");

        loop {
            let request = match read_request(&mut self.reader) {
                Ok(request) => request,
                Err(e) if is_disconnect(&e) => {
                    tracing::debug!(peer = %self.peer_addr, "peer disconnected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "bad request frame");
                    let _ = write_response(&mut self.writer, &PeerResponse::error(&e));
                    return Err(e);
                }
            };

            tracing::trace!(peer = %self.peer_addr, kind = request.kind(), "request received");
            let response = self.handler.handle(request);

            if let Err(e) = write_response(&mut self.writer, &response) {
                if is_disconnect(&e) {
                    tracing::debug!(peer = %self.peer_addr, error = %e, "peer left before the response was sent");
                    return Ok(());
                }
                tracing::warn!(peer = %self.peer_addr, error = %e, "error writing response");
                return Err(e);
            }
        }
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}
