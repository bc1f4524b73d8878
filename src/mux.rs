//! Connection demultiplexer.
//!
//! A [`Muxer`] owns one bound socket. Each accepted connection is sniffed on
//! its own task and then published on the [`VirtualListener`] registered for
//! its routing key. Connections that cannot be classified, or whose key has
//! no listener, surface through [`MuxErrors::next_error`].

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::backend::normalize_host;
use crate::server::shutdown_requested;
use crate::sniff::{Protocol, SniffError, SniffLimits, SniffResult, sniff};
use crate::stream::PrefixedStream;

/// Connections queued per virtual listener before sniff tasks wait.
pub const VIRTUAL_LISTENER_BACKLOG: usize = 128;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// An accepted connection and the routing key found in its prefix.
#[derive(Debug)]
pub struct SniffedConn {
    pub stream: PrefixedStream,
    pub peer_addr: SocketAddr,
    pub routing_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum MuxError {
    /// The bound socket is gone; nothing else will be delivered.
    #[error("listener closed")]
    Closed,
    /// The prefix parsed but no listener is registered for its key. The
    /// connection is intact and can still be proxied.
    #[error("no destination for {:?}", .0.routing_key)]
    NotFound(SniffedConn),
    #[error("failed to sniff connection from {peer_addr}: {error}")]
    Sniff {
        peer_addr: SocketAddr,
        #[source]
        error: SniffError,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Receives the connections routed to one destination.
#[derive(Debug)]
pub struct VirtualListener {
    name: String,
    rx: mpsc::Receiver<SniffedConn>,
}

impl VirtualListener {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next connection. Fails permanently once the muxer stops.
    pub async fn accept(&mut self) -> io::Result<SniffedConn> {
        self.rx.recv().await.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("virtual listener for {} closed", self.name),
            )
        })
    }
}

/// Error side of a running muxer.
#[derive(Debug)]
pub struct MuxErrors {
    rx: mpsc::Receiver<MuxError>,
}

impl MuxErrors {
    /// Next failed or unmatched connection. Yields [`MuxError::Closed`] forever
    /// once the muxer has stopped.
    pub async fn next_error(&mut self) -> MuxError {
        self.rx.recv().await.unwrap_or(MuxError::Closed)
    }
}

pub struct Muxer {
    listener: TcpListener,
    protocol: Protocol,
    limits: SniffLimits,
    routes: HashMap<String, mpsc::Sender<SniffedConn>>,
}

impl Muxer {
    #[must_use]
    pub fn new(listener: TcpListener, protocol: Protocol, limits: SniffLimits) -> Self {
        Self {
            listener,
            protocol,
            limits,
            routes: HashMap::new(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registers a routing key. All keys must be registered before [`start`](Self::start).
    pub fn listen(&mut self, name: &str) -> io::Result<VirtualListener> {
        let name = normalize_host(name);
        if self.routes.contains_key(&name) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{name} is already registered"),
            ));
        }
        let (tx, rx) = mpsc::channel(VIRTUAL_LISTENER_BACKLOG);
        self.routes.insert(name.clone(), tx);
        Ok(VirtualListener { name, rx })
    }

    /// Spawns the accept loop. It runs until the socket fails permanently or
    /// `shutdown` flips to `true`.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> MuxErrors {
        let (errors_tx, errors_rx) = mpsc::channel(VIRTUAL_LISTENER_BACKLOG);
        tokio::spawn(self.run(errors_tx, shutdown));
        MuxErrors { rx: errors_rx }
    }

    async fn run(self, errors: mpsc::Sender<MuxError>, mut shutdown: watch::Receiver<bool>) {
        let Self {
            listener,
            protocol,
            limits,
            routes,
        } = self;
        let routes = Arc::new(routes);
        let mut sniffing = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(client_addr = %peer_addr, "Accepted connection");
                        sniffing.spawn(classify(
                            stream,
                            peer_addr,
                            protocol,
                            limits,
                            Arc::clone(&routes),
                            errors.clone(),
                        ));
                    }
                    Err(e) if is_temporary(&e) => {
                        warn!(error = %e, "Temporary accept failure");
                        let _ = errors.send(MuxError::Accept(e)).await;
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Listener failed");
                        break;
                    }
                },
                Some(_) = sniffing.join_next(), if !sniffing.is_empty() => {}
                () = shutdown_requested(&mut shutdown) => {
                    info!("Muxer stopping");
                    break;
                }
            }
        }

        drop(listener);
        sniffing.shutdown().await;
        // Dropping the last senders closes every virtual listener.
        drop(routes);
        let _ = errors.send(MuxError::Closed).await;
    }
}

async fn classify(
    stream: TcpStream,
    peer_addr: SocketAddr,
    protocol: Protocol,
    limits: SniffLimits,
    routes: Arc<HashMap<String, mpsc::Sender<SniffedConn>>>,
    errors: mpsc::Sender<MuxError>,
) {
    let SniffResult {
        stream,
        routing_key,
    } = match sniff(stream, protocol, limits).await {
        Ok(result) => result,
        Err(error) => {
            let _ = errors.send(MuxError::Sniff { peer_addr, error }).await;
            return;
        }
    };

    let route = routing_key.as_deref().and_then(|key| routes.get(key));
    let conn = SniffedConn {
        stream,
        peer_addr,
        routing_key,
    };
    match route {
        Some(tx) => {
            debug!(client_addr = %peer_addr, routing_key = ?conn.routing_key, "Routed connection");
            if tx.send(conn).await.is_err() {
                debug!(client_addr = %peer_addr, "Destination stopped accepting, dropping connection");
            }
        }
        None => {
            let _ = errors.send(MuxError::NotFound(conn)).await;
        }
    }
}

/// Whether an accept error is worth retrying.
#[must_use]
pub fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) || is_resource_exhaustion(err)
}

#[cfg(target_os = "linux")]
mod errno {
    pub const ENOMEM: i32 = 12;
    pub const ENFILE: i32 = 23;
    pub const EMFILE: i32 = 24;
    pub const ENOBUFS: i32 = 105;
}

fn is_resource_exhaustion(err: &io::Error) -> bool {
    #[cfg(target_os = "linux")]
    {
        matches!(
            err.raw_os_error(),
            Some(errno::ENOMEM | errno::ENFILE | errno::EMFILE | errno::ENOBUFS)
        )
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = err;
        false
    }
}
