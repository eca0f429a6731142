//! UDP transport for DNS queries.
//!
//! The server side receives datagrams from clients and answers each one from
//! its own task. The caller side forwards a query over a fresh connected
//! socket, so responses are matched by socket and checked by query ID.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Caller, MAX_DNS_PACKET_SIZE, Protocol, QueryLogger};
use crate::dns;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::stats::Stats;

/// Upstream reached over UDP.
#[derive(Debug)]
pub struct UdpCaller {
    addr: SocketAddr,
    timeout: Duration,
    name: String,
}

impl UdpCaller {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            name: format!("udp://{addr}"),
        }
    }
}

#[async_trait]
impl Caller for UdpCaller {
    async fn call(&self, query: &Message) -> Result<Message> {
        let local: SocketAddr = if self.addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.addr).await?;
        socket.send(&query.to_vec()?).await?;

        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Timeout(self.name.clone()))??;

        let response = Message::from_vec(&buf[..len])?;
        if response.id() != query.id() {
            return Err(Error::IdMismatch(self.name.clone()));
        }
        Ok(response)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// UDP listener answering client queries.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the receive loop. Every datagram is served from its own task.
    pub fn start(self, handler: Arc<Handler>, stats: Arc<Stats>, verbose: bool) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, handler, stats, verbose))
    }
}

async fn run(socket: Arc<UdpSocket>, handler: Arc<Handler>, stats: Arc<Stats>, verbose: bool) {
    let logger = Arc::new(QueryLogger::new(Protocol::Udp));
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "udp recv error");
                continue;
            }
        };

        if len < 12 {
            continue;
        }

        let query = match Message::from_vec(&buf[..len]) {
            Ok(query) => query,
            Err(e) => {
                debug!(client = %src, error = %e, "dropping malformed query");
                continue;
            }
        };

        let socket = socket.clone();
        let handler = handler.clone();
        let stats = stats.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let reply = handler.serve(&query).await;

            match reply.message.to_vec() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, src).await {
                        warn!(client = %src, error = %e, "udp response error");
                    }
                }
                Err(e) => warn!(client = %src, error = %e, "failed to encode response"),
            }

            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            stats.record(&reply.source, elapsed_ms);
            if verbose {
                let domain = dns::question(&query).map(dns::qname).unwrap_or_default();
                logger.answered(src, &domain, &reply.source, elapsed_ms);
            }
        });
    }
}
