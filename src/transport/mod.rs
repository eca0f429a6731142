//! Transport layer for the forwarder.
//!
//! Provides the UDP and TCP listeners that receive queries from clients, and
//! the [`Caller`] implementations that forward queries to upstream servers.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::info;

use crate::error::{Error, Result};
use crate::handler::Source;

pub use tcp::TcpCaller;
pub use udp::UdpCaller;

const DEFAULT_PORT: u16 = 53;

/// One upstream DNS server.
///
/// `exit` releases whatever the caller keeps between calls. It is invoked
/// once when the owning configuration is retired.
#[async_trait]
pub trait Caller: Send + Sync + fmt::Debug {
    async fn call(&self, query: &Message) -> Result<Message>;

    fn name(&self) -> &str;

    fn exit(&self) {}
}

/// Build a caller from `udp://host:port`, `tcp://host:port` or a bare
/// `host:port` (UDP). The port defaults to 53.
pub fn connect(upstream: &str, timeout: Duration) -> Result<Arc<dyn Caller>> {
    let (scheme, rest) = match upstream.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("udp".to_string(), upstream),
    };
    let addr = resolve_addr(rest).ok_or_else(|| Error::InvalidUpstream(upstream.to_string()))?;

    match scheme.as_str() {
        "udp" => Ok(Arc::new(UdpCaller::new(addr, timeout))),
        "tcp" => Ok(Arc::new(TcpCaller::new(addr, timeout))),
        _ => Err(Error::InvalidUpstream(upstream.to_string())),
    }
}

fn resolve_addr(host: &str) -> Option<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = host.trim_matches(|c: char| c == '[' || c == ']').parse() {
        return Some(SocketAddr::new(ip, DEFAULT_PORT));
    }
    let with_port = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_PORT}")
    };
    with_port.to_socket_addrs().ok()?.next()
}

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Per-query log lines, enabled with `--verbose`.
pub struct QueryLogger {
    protocol: Protocol,
}

impl QueryLogger {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    pub fn answered(&self, client: SocketAddr, domain: &str, source: &Source, elapsed_ms: f64) {
        info!(
            protocol = self.protocol.as_str(),
            %client,
            domain,
            %source,
            elapsed_ms,
            "query"
        );
    }
}
