use anyhow::{Context, Result};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinSet, time::timeout};
use tracing::{debug, error, info, warn};

use crate::accounting::TrafficAccountant;
use crate::backend::{Destination, Registry};
use crate::config::ListenerSettings;
use crate::mux::{MuxError, MuxErrors, Muxer, SniffedConn, VirtualListener};
use crate::proxy::proxy_connection;
use crate::sniff::{Protocol, SniffLimits};

/// How long in-flight sessions may run after shutdown before they are aborted.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Per-listener state shared by every session.
pub struct ServerContext {
    /// Port of the bound socket, inherited by backends that name no port.
    pub listen_port: u16,
    pub handshake_timeout: Duration,
    pub accountant: Option<TrafficAccountant>,
}

/// Resolves when `true` is published. A dropped sender never resolves.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let stopped = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !stopped {
        std::future::pending::<()>().await;
    }
}

/// One bound port and the destinations served on it.
pub struct Server {
    muxer: Muxer,
    registry: Arc<Registry>,
    ctx: Arc<ServerContext>,
    shutdown_grace: Duration,
}

impl Server {
    pub async fn bind(
        settings: &ListenerSettings,
        registry: Arc<Registry>,
        accountant: Option<TrafficAccountant>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&settings.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to address {}", settings.bind_addr))?;
        let local_addr = listener.local_addr()?;
        info!(listen_addr = %local_addr, https = settings.https, "Listening");

        let limits = SniffLimits {
            timeout: settings.sniff_timeout,
            ..SniffLimits::default()
        };
        let ctx = ServerContext {
            listen_port: local_addr.port(),
            handshake_timeout: settings.sniff_timeout,
            accountant,
        };
        Ok(Self {
            muxer: Muxer::new(listener, Protocol::from_https(settings.https), limits),
            registry,
            ctx: Arc::new(ctx),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.muxer.local_addr()
    }

    /// Serves until `shutdown` flips to `true` or the socket fails, then
    /// drains in-flight sessions.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let Self {
            mut muxer,
            registry,
            ctx,
            shutdown_grace,
        } = self;
        let local_addr = muxer.local_addr()?;

        let mut dispatchers = JoinSet::new();
        for destination in registry.iter() {
            let listener = muxer
                .listen(&destination.name)
                .with_context(|| format!("Failed to register {}", destination.name))?;
            dispatchers.spawn(dispatch(
                Arc::clone(&ctx),
                Arc::clone(destination),
                listener,
                shutdown.clone(),
                shutdown_grace,
            ));
        }

        let errors = muxer.start(shutdown);
        let fallback = tokio::spawn(route_errors(
            Arc::clone(&ctx),
            registry.default_destination().cloned(),
            errors,
            shutdown_grace,
        ));

        while let Some(result) = dispatchers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Dispatcher task failed");
            }
        }
        if let Err(e) = fallback.await {
            error!(error = %e, "Error router task failed");
        }

        info!(listen_addr = %local_addr, "Server stopped");
        Ok(())
    }
}

/// Accepts from one virtual listener and runs a session per connection.
#[tracing::instrument(skip_all, fields(destination = %destination.name))]
async fn dispatch(
    ctx: Arc<ServerContext>,
    destination: Arc<Destination>,
    mut listener: VirtualListener,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    debug!(listener = listener.name(), "Dispatcher started");
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    info!(client_addr = %conn.peer_addr, "Accepted new connection");
                    sessions.spawn(run_session(Arc::clone(&ctx), Arc::clone(&destination), conn));
                }
                // Transient socket errors are retried by the muxer; this only
                // fails once the muxer has stopped.
                Err(e) => {
                    debug!(error = %e, "Listener closed");
                    break;
                }
            },
            Some(result) = sessions.join_next(), if !sessions.is_empty() => log_session_exit(result),
            () = shutdown_requested(&mut shutdown) => break,
        }
    }

    drain(&destination.name, sessions, grace).await;
}

/// Handles connections the muxer could not route.
async fn route_errors(
    ctx: Arc<ServerContext>,
    default: Option<Arc<Destination>>,
    mut errors: MuxErrors,
    grace: Duration,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            error = errors.next_error() => match error {
                MuxError::Closed => break,
                MuxError::NotFound(conn) => match &default {
                    Some(destination) => {
                        info!(
                            client_addr = %conn.peer_addr,
                            routing_key = ?conn.routing_key,
                            destination = %destination.name,
                            "Routing unmatched connection to default destination"
                        );
                        sessions.spawn(run_session(Arc::clone(&ctx), Arc::clone(destination), conn));
                    }
                    None => {
                        warn!(
                            client_addr = %conn.peer_addr,
                            routing_key = ?conn.routing_key,
                            "No destination matches, closing connection"
                        );
                    }
                },
                MuxError::Sniff { peer_addr, error } => {
                    warn!(client_addr = %peer_addr, error = %error, "Failed to classify connection");
                }
                MuxError::Accept(e) => warn!(error = %e, "Failed to accept connection"),
            },
            Some(result) = sessions.join_next(), if !sessions.is_empty() => log_session_exit(result),
        }
    }

    drain("unmatched", sessions, grace).await;
}

async fn run_session(ctx: Arc<ServerContext>, destination: Arc<Destination>, conn: SniffedConn) {
    let client_addr = conn.peer_addr;
    if let Err(e) = proxy_connection(&ctx, &destination, conn).await {
        let error = format!("{e:#}");
        warn!(
            destination = %destination.name,
            client_addr = %client_addr,
            error = %error,
            "Connection failed"
        );
    }
}

fn log_session_exit(result: Result<(), tokio::task::JoinError>) {
    match result {
        Err(e) if e.is_panic() => error!(error = %e, "Session panicked"),
        _ => {}
    }
}

/// Waits up to `grace` for `sessions`, then aborts whatever is left.
async fn drain(scope: &str, mut sessions: JoinSet<()>, grace: Duration) {
    if sessions.is_empty() {
        return;
    }
    info!(scope, in_flight = sessions.len(), "Draining sessions");
    if timeout(grace, join_all(&mut sessions)).await.is_err() {
        warn!(scope, remaining = sessions.len(), "Grace period elapsed, aborting sessions");
        sessions.shutdown().await;
    }
}

async fn join_all(sessions: &mut JoinSet<()>) {
    while let Some(result) = sessions.join_next().await {
        log_session_exit(result);
    }
}
