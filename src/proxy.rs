use anyhow::{Context, Result, anyhow};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::backend::Destination;
use crate::mux::SniffedConn;
use crate::server::ServerContext;
use crate::stream::ClientStream;

pub const BUFFER_SIZE: usize = 8192;

/// Bytes moved by a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

impl JoinStats {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_backend + self.backend_to_client
    }
}

/// Runs one proxied session to completion.
///
/// The client connection is dropped, and so closed, on every error path.
#[tracing::instrument(skip_all, fields(destination = %destination.name, client_addr = %conn.peer_addr))]
pub async fn proxy_connection(
    ctx: &ServerContext,
    destination: &Destination,
    conn: SniffedConn,
) -> Result<JoinStats> {
    let SniffedConn {
        stream, peer_addr, ..
    } = conn;

    let client = match destination.tls_acceptor() {
        Some(acceptor) => {
            let tls = timeout(ctx.handshake_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| anyhow!("TLS handshake timed out"))?
                .context("TLS handshake failed")?;
            debug!("Terminated client TLS");
            ClientStream::Tls(Box::new(tls))
        }
        None => ClientStream::Plain(stream),
    };

    let backend = destination.next_backend();
    let backend_addr = backend.dial_addr(ctx.listen_port);
    debug!(backend_addr = %backend_addr, "Attempting to connect to backend");

    let upstream = timeout(backend.connect_timeout, TcpStream::connect(&backend_addr))
        .await
        .map_err(|_| {
            anyhow!(
                "Timed out after {:?} connecting to backend {backend_addr}",
                backend.connect_timeout
            )
        })?
        .with_context(|| format!("Failed to connect to backend {backend_addr}"))?;
    upstream.set_nodelay(true).ok();

    info!(
        backend_addr = %backend_addr,
        local_addr = ?upstream.local_addr().ok(),
        "Connected to backend"
    );

    let stats = join(client, upstream).await;

    info!(
        bytes_client_to_backend = stats.client_to_backend,
        bytes_backend_to_client = stats.backend_to_client,
        "Proxy connection closed"
    );

    if let Some(accountant) = &ctx.accountant {
        accountant
            .record(&destination.name, peer_addr, stats.total())
            .await;
    }
    Ok(stats)
}

/// Splices two streams until either direction ends.
///
/// Both directions copy independently. The first one to see end-of-stream
/// or an error shuts down its destination, then both streams are dropped,
/// which closes the sockets and ends the other direction too.
pub async fn join<C, B>(client: C, backend: B) -> JoinStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);
    let upstream = AtomicU64::new(0);
    let downstream = AtomicU64::new(0);

    debug!("Joining connections");
    let (direction, result) = tokio::select! {
        result = half_join(&mut client_read, &mut backend_write, &upstream) => ("client->backend", result),
        result = half_join(&mut backend_read, &mut client_write, &downstream) => ("backend->client", result),
    };

    let stats = JoinStats {
        client_to_backend: upstream.load(Ordering::Relaxed),
        backend_to_client: downstream.load(Ordering::Relaxed),
    };
    match result {
        Ok(()) => debug!(direction, ?stats, "Stream closed"),
        Err(e) => warn!(direction, error = %e, ?stats, "Copy failed"),
    }
    stats
}

async fn half_join<R, W>(src: &mut R, dst: &mut W, copied: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = src.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        // Count per write so a cancelled or failed chunk still reports what
        // reached the peer.
        let mut offset = 0;
        while offset < n {
            let written = dst.write(&buffer[offset..n]).await?;
            if written == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            offset += written;
            copied.fetch_add(written as u64, Ordering::Relaxed);
        }
    }
    dst.shutdown().await
}
