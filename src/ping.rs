//! Reachability probes used by the fastest-IP race.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Probe a single address. `Ok` means reachable within `timeout`.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, ip: IpAddr, tcp_port: u16, timeout: Duration) -> Result<()>;
}

/// TCP connect probe when a port is given, one ICMP echo otherwise.
///
/// ICMP goes through the system `ping` utility so no raw socket privileges
/// are needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetPinger;

#[async_trait]
impl Pinger for NetPinger {
    async fn ping(&self, ip: IpAddr, tcp_port: u16, timeout: Duration) -> Result<()> {
        if tcp_port > 0 {
            tcp_ping(ip, tcp_port, timeout).await
        } else {
            icmp_ping(ip, timeout).await
        }
    }
}

async fn tcp_ping(ip: IpAddr, port: u16, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await {
        Ok(Ok(_)) => Ok(()),
        _ => Err(Error::Ping(format!("{ip}:{port}"))),
    }
}

async fn icmp_ping(ip: IpAddr, timeout: Duration) -> Result<()> {
    let wait = timeout.as_secs().max(1);
    let mut cmd = Command::new("ping");
    if ip.is_ipv6() {
        cmd.arg("-6");
    }
    cmd.args(["-c", "1", "-W"])
        .arg(wait.to_string())
        .arg(ip.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.status()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        _ => Err(Error::Ping(ip.to_string())),
    }
}
