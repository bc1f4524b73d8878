//! Smart Proxy
//!
//! A reverse proxy that serves many hosts on one port. Each connection is
//! routed by the TLS SNI or HTTP Host header found in its first bytes, then
//! spliced to a backend, optionally terminating TLS on the way.

pub mod accounting;
pub mod backend;
pub mod config;
pub mod mux;
pub mod proxy;
pub mod server;
pub mod sniff;
pub mod stream;
pub mod tls;

pub use accounting::{CounterStore, RedisCounterStore, TrafficAccountant};
pub use backend::{Backend, BackendStrategy, Destination, Registry, RoundRobin};
pub use config::{Configuration, ListenerSettings, load_config};
pub use mux::{MuxError, Muxer, SniffedConn, VirtualListener};
pub use proxy::{BUFFER_SIZE, JoinStats, join, proxy_connection};
pub use server::{Server, ServerContext};
pub use sniff::{Protocol, SniffError, SniffLimits, sniff};
pub use stream::{ClientStream, PrefixedStream};
pub use tls::load_tls_config;
