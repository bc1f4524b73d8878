//! Backend registry and selection.
//!
//! A [`Destination`] is a named routing target (a "frontend") owning one or
//! more [`Backend`]s. The [`Registry`] is built once from configuration and
//! is read-only afterwards; the only mutable state is each destination's
//! selection cursor, which lives behind an atomic.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio_rustls::TlsAcceptor;

/// Connect timeout used when a backend does not configure one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A concrete dial target behind a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub addr: String,
    pub connect_timeout: Duration,
}

impl Backend {
    #[must_use]
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }

    /// Address to dial. A bare host inherits `default_port`.
    #[must_use]
    pub fn dial_addr(&self, default_port: u16) -> String {
        if has_port(&self.addr) {
            self.addr.clone()
        } else if self.addr.contains(':') {
            format!("[{}]:{default_port}", self.addr)
        } else {
            format!("{}:{default_port}", self.addr)
        }
    }
}

fn has_port(addr: &str) -> bool {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest
            .split_once("]:")
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    }
    match addr.rsplit_once(':') {
        // A second colon means a bare IPv6 literal, not host:port.
        Some((host, port)) => !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Picks the next backend for a connection.
pub trait BackendStrategy: Send + Sync {
    /// `backends` is never empty.
    fn next_backend<'a>(&self, backends: &'a [Backend]) -> &'a Backend;
}

/// Cycles through the backend list in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn position(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl BackendStrategy for RoundRobin {
    fn next_backend<'a>(&self, backends: &'a [Backend]) -> &'a Backend {
        let n = backends.len();
        if n == 1 {
            return &backends[0];
        }
        // fetch_update keeps the cursor in 0..n, so the cycle never skews on overflow.
        let idx = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| Some((i + 1) % n))
            .unwrap_or_default();
        &backends[idx % n]
    }
}

/// A named routing target.
pub struct Destination {
    pub name: String,
    backends: Vec<Backend>,
    pub is_default: bool,
    tls: Option<TlsAcceptor>,
    strategy: Box<dyn BackendStrategy>,
}

impl Destination {
    /// Builds a round-robin destination. `backends` must not be empty; the
    /// config loader rejects that case before we get here.
    #[must_use]
    pub fn new(name: impl Into<String>, backends: Vec<Backend>) -> Self {
        debug_assert!(!backends.is_empty(), "destination without backends");
        Self {
            name: normalize_host(&name.into()),
            backends,
            is_default: false,
            tls: None,
            strategy: Box::new(RoundRobin::new()),
        }
    }

    #[must_use]
    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(TlsAcceptor::from(config));
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn BackendStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Acceptor for local TLS termination, if this destination carries a certificate.
    #[must_use]
    pub fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    #[must_use]
    pub fn next_backend(&self) -> &Backend {
        self.strategy.next_backend(&self.backends)
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("backends", &self.backends)
            .field("is_default", &self.is_default)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// All destinations of a deployment, keyed by normalized name.
#[derive(Debug, Default)]
pub struct Registry {
    destinations: HashMap<String, Arc<Destination>>,
    default: Option<Arc<Destination>>,
}

impl Registry {
    /// Builds a registry. Callers are responsible for uniqueness of names and
    /// of the default flag; if several destinations claim default, the last
    /// one inserted wins.
    #[must_use]
    pub fn new(destinations: impl IntoIterator<Item = Destination>) -> Self {
        let mut registry = Self::default();
        for destination in destinations {
            let destination = Arc::new(destination);
            if destination.is_default {
                registry.default = Some(Arc::clone(&destination));
            }
            registry
                .destinations
                .insert(destination.name.clone(), destination);
        }
        registry
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<Destination>> {
        self.destinations.get(name)
    }

    #[must_use]
    pub fn default_destination(&self) -> Option<&Arc<Destination>> {
        self.default.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Destination>> {
        self.destinations.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

/// Lowercases a host name and strips a trailing root dot.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
