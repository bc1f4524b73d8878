//! Best-effort traffic accounting.
//!
//! Every finished session adds its byte count to two counters: one keyed by
//! the client's IP, one keyed by the destination name. Counter failures are
//! logged and never reach the proxy path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, warn};

pub const CLIENT_KEY_PREFIX: &str = "traff_stats:client:";
pub const DESTINATION_KEY_PREFIX: &str = "traff_stats:remote_host:";

/// A key-value store that can atomically add to a counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, key: &str, by: u64) -> Result<()>;
}

/// Counters kept in Redis via `INCRBY`.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("Invalid redis url: {redis_url}"))?;
        let connection = client
            .get_connection_manager()
            .await
            .context("Failed to create redis connection manager")?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, by: u64) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = connection
            .incr(key, by)
            .await
            .with_context(|| format!("INCRBY {key} failed"))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct TrafficAccountant {
    store: Arc<dyn CounterStore>,
}

impl TrafficAccountant {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Adds `bytes` to the client and destination counters.
    pub async fn record(&self, destination: &str, client_addr: SocketAddr, bytes: u64) {
        let client_key = format!("{CLIENT_KEY_PREFIX}{}", client_addr.ip());
        let destination_key = format!("{DESTINATION_KEY_PREFIX}{destination}");

        for key in [client_key, destination_key] {
            match self.store.increment(&key, bytes).await {
                Ok(()) => debug!(key = %key, bytes, "Recorded traffic"),
                Err(e) => warn!(key = %key, error = %e, "Failed to save traffic stats"),
            }
        }
    }
}
