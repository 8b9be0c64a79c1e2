//! TCP Server
//!
//! Accepts peer connections and serves each on its own thread.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use super::{Connection, PeerHandler};

/// Accept loop poll interval while idle
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Decrements the live connection count when a connection thread ends
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// TCP server for peer messages
pub struct PeerServer {
    listener: TcpListener,
    handler: Arc<dyn PeerHandler>,
    max_connections: usize,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl PeerServer {
    /// Bind to the configured listen address
    pub fn bind(config: &Config, handler: Arc<dyn PeerHandler>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            handler,
            max_connections: config.max_connections.max(1),
            read_timeout_ms: config.read_timeout_ms,
            write_timeout_ms: config.write_timeout_ms,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag that stops `run` when set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Signal the server to shutdown gracefully
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Accept connections until shutdown (blocking)
    pub fn run(&self) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "peer server listening");

        while !self.shutdown.load(Ordering::Acquire) {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.active.fetch_add(1, Ordering::AcqRel) >= self.max_connections {
                self.active.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(peer = %addr, max = self.max_connections, "connection limit reached, refusing");
                continue;
            }
            let slot = ConnectionSlot(Arc::clone(&self.active));

            // Accepted sockets inherit non-blocking mode on some platforms
            stream.set_nonblocking(false)?;

            let handler = Arc::clone(&self.handler);
            let (read_ms, write_ms) = (self.read_timeout_ms, self.write_timeout_ms);
            let spawned = std::thread::Builder::new()
                .name(format!("peer-{}", addr))
                .spawn(move || {
                    let _slot = slot;
                    let result = Connection::new(stream, handler).and_then(|mut conn| {
                        conn.set_timeouts(read_ms, write_ms)?;
                        conn.handle()
                    });
                    if let Err(e) = result {
                        tracing::warn!(peer = %addr, error = %e, "connection ended with error");
                    }
                });

            if let Err(e) = spawned {
                tracing::error!(peer = %addr, error = %e, "failed to spawn connection thread");
            }
        }

        tracing::info!("peer server stopped");
        Ok(())
    }
}
