//! TCP transport for DNS queries.
//!
//! TCP DNS messages are prefixed with a 2-byte big-endian length. The server
//! answers any number of queries per connection, in order. The caller opens
//! one connection per query.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Caller, Protocol, QueryLogger};
use crate::dns;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::stats::Stats;

/// Upstream reached over TCP.
#[derive(Debug)]
pub struct TcpCaller {
    addr: SocketAddr,
    timeout: Duration,
    name: String,
}

impl TcpCaller {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            name: format!("tcp://{addr}"),
        }
    }

    async fn exchange(&self, query: &Message) -> Result<Message> {
        let mut upstream = TcpStream::connect(self.addr).await?;
        write_dns_message(&mut upstream, &query.to_vec()?).await?;
        let bytes = read_dns_message(&mut upstream).await?;
        Ok(Message::from_vec(&bytes)?)
    }
}

#[async_trait]
impl Caller for TcpCaller {
    async fn call(&self, query: &Message) -> Result<Message> {
        let response = tokio::time::timeout(self.timeout, self.exchange(query))
            .await
            .map_err(|_| Error::Timeout(self.name.clone()))??;

        if response.id() != query.id() {
            return Err(Error::IdMismatch(self.name.clone()));
        }
        Ok(response)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// TCP listener answering client queries.
///
/// Each connection is handled in a separate task.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop.
    pub fn start(self, handler: Arc<Handler>, stats: Arc<Stats>, verbose: bool) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, handler, stats, verbose))
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    handler: Arc<Handler>,
    stats: Arc<Stats>,
    verbose: bool,
) {
    let logger = Arc::new(QueryLogger::new(Protocol::Tcp));
    loop {
        match listener.accept().await {
            Ok((client, src)) => {
                tokio::spawn(handle_connection(
                    client,
                    src,
                    handler.clone(),
                    stats.clone(),
                    logger.clone(),
                    verbose,
                ));
            }
            Err(e) => {
                warn!(error = %e, "tcp accept error");
            }
        }
    }
}

async fn handle_connection(
    mut client: TcpStream,
    src: SocketAddr,
    handler: Arc<Handler>,
    stats: Arc<Stats>,
    logger: Arc<QueryLogger>,
    verbose: bool,
) {
    // Read until the client closes or sends garbage.
    while let Ok(bytes) = read_dns_message(&mut client).await {
        let start = Instant::now();
        let query = match Message::from_vec(&bytes) {
            Ok(query) => query,
            Err(e) => {
                debug!(client = %src, error = %e, "closing connection on malformed query");
                return;
            }
        };

        let reply = handler.serve(&query).await;
        let written = match reply.message.to_vec() {
            Ok(bytes) => write_dns_message(&mut client, &bytes).await,
            Err(e) => {
                warn!(client = %src, error = %e, "failed to encode response");
                return;
            }
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        stats.record(&reply.source, elapsed_ms);
        if verbose {
            let domain = dns::question(&query).map(dns::qname).unwrap_or_default();
            logger.answered(src, &domain, &reply.source, elapsed_ms);
        }
        if written.is_err() {
            return;
        }
    }
}

/// Read one length-prefixed DNS message, without its prefix.
async fn read_dns_message<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let len = stream.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_dns_message<S: AsyncWrite + Unpin>(stream: &mut S, message: &[u8]) -> io::Result<()> {
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "dns message too large"))?;
    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await
}
