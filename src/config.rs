//! TOML configuration.
//!
//! ```toml
//! bind = "127.0.0.1:5353"
//! default_group = "clean"
//!
//! [cache]
//! size = 4096
//!
//! [[group]]
//! name = "clean"
//! upstreams = ["udp://223.5.5.5"]
//!
//! [[group]]
//! name = "dirty"
//! upstreams = ["tcp://8.8.8.8"]
//! rules = ["/etc/crossroads/gfwlist.txt"]
//!
//! [[redirect]]
//! name = "foreign"
//! from = "clean"
//! to = "dirty"
//! kind = "ip"
//! when = "not_matched"
//! rules = ["/etc/crossroads/china_ip_list.txt"]
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::redirect::Polarity;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Query type names answered with an empty NOERROR, e.g. `"ANY"`.
    #[serde(default)]
    pub disabled_qtypes: Vec<String>,
    #[serde(default)]
    pub disable_aaaa: bool,
    /// Hosts files, consulted in order.
    #[serde(default)]
    pub hosts: Vec<PathBuf>,
    /// Group answering queries no other group claims.
    pub default_group: String,
    #[serde(default, rename = "group")]
    pub groups: Vec<GroupConfig>,
    #[serde(default, rename = "redirect")]
    pub redirects: Vec<RedirectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    /// Maximum number of entries; zero disables caching.
    pub size: usize,
    pub min_ttl: u64,
    pub max_ttl: u64,
    pub sweep_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 4096,
            min_ttl: 60,
            max_ttl: 86400,
            sweep_interval: 60,
        }
    }
}

impl CacheConfig {
    pub fn min_ttl(&self) -> Duration {
        Duration::from_secs(self.min_ttl)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub upstreams: Vec<String>,
    /// Rule files selecting the domains this group answers.
    #[serde(default)]
    pub rules: Vec<PathBuf>,
    #[serde(default)]
    pub inline_rules: Vec<String>,
    #[serde(default)]
    pub concurrent: bool,
    #[serde(default)]
    pub fastest_ip: bool,
    #[serde(default)]
    pub tcp_ping_port: u16,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub strip_cookie: bool,
    /// Subnet attached as EDNS client subnet, e.g. `"203.0.113.0/24"`.
    #[serde(default)]
    pub client_subnet: Option<String>,
    #[serde(default)]
    pub ipset: Option<String>,
    /// Per-entry ipset timeout. Zero uses the record TTL.
    #[serde(default)]
    pub ipset_ttl: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectKind {
    Ip,
    Domain,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectConfig {
    pub name: String,
    pub from: String,
    pub to: String,
    pub kind: RedirectKind,
    pub when: Polarity,
    /// CIDR lists for `ip`, rule lists for `domain`.
    #[serde(default)]
    pub rules: Vec<PathBuf>,
    #[serde(default)]
    pub inline_rules: Vec<String>,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5353))
}

fn default_ping_timeout_ms() -> u64 {
    500
}

fn default_max_candidates() -> usize {
    15
}

fn default_timeout_ms() -> u64 {
    3000
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
