//! Side channel receiving resolved addresses (kernel IP sets).

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Receives resolved IPv4 addresses, e.g. to feed a firewall set.
///
/// Implementations must tolerate concurrent calls.
#[async_trait]
pub trait IpSink: Send + Sync {
    async fn add(&self, ip: IpAddr, ttl: u32) -> Result<()>;
}

/// Adds addresses to a named `ipset` with a per-entry timeout.
#[derive(Debug, Clone)]
pub struct IpsetSink {
    program: String,
    set: String,
}

impl IpsetSink {
    pub fn new(set: impl Into<String>) -> Self {
        Self::with_program("ipset", set)
    }

    /// Use a different `ipset` binary.
    pub fn with_program(program: impl Into<String>, set: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            set: set.into(),
        }
    }

    pub fn set(&self) -> &str {
        &self.set
    }
}

#[async_trait]
impl IpSink for IpsetSink {
    async fn add(&self, ip: IpAddr, ttl: u32) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("add")
            .arg(&self.set)
            .arg(ip.to_string())
            .arg("timeout")
            .arg(ttl.to_string())
            .arg("-exist")
            .output()
            .await
            .map_err(|e| Error::Ipset {
                set: self.set.clone(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Ipset {
                set: self.set.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
