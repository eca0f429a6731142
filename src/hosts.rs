//! Static host overrides.

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustc_hash::FxHashMap;

use crate::dns::canonical;
use crate::error::{Error, Result};

/// TTL given to answers synthesized from a hosts file.
const HOSTS_TTL: u32 = 600;

/// Answers a query from local data, bypassing cache and upstreams.
pub trait HostsReader: Send + Sync {
    /// Records for `host`, or `None` when this reader has nothing.
    fn record(&self, host: &str, rtype: RecordType) -> Option<Vec<Record>>;
}

/// In-memory table built from hosts-file syntax (`ip name [alias...]`).
#[derive(Debug, Default)]
pub struct StaticHosts {
    entries: FxHashMap<String, Vec<IpAddr>>,
}

impl StaticHosts {
    pub fn parse(text: &str) -> Self {
        let mut entries: FxHashMap<String, Vec<IpAddr>> = FxHashMap::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let Some(Ok(ip)) = fields.next().map(str::parse::<IpAddr>) else {
                continue;
            };
            for host in fields {
                let ips = entries.entry(canonical(host)).or_default();
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
        Self { entries }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::parse(&text))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl HostsReader for StaticHosts {
    fn record(&self, host: &str, rtype: RecordType) -> Option<Vec<Record>> {
        let ips = self.entries.get(&canonical(host))?;
        let name = Name::from_ascii(canonical(host)).ok()?;
        let records: Vec<Record> = ips
            .iter()
            .filter_map(|ip| match (ip, rtype) {
                (IpAddr::V4(v4), RecordType::A) => Some(RData::A(A(*v4))),
                (IpAddr::V6(v6), RecordType::AAAA) => Some(RData::AAAA(AAAA(*v6))),
                _ => None,
            })
            .map(|rdata| Record::from_rdata(name.clone(), HOSTS_TTL, rdata))
            .collect();
        if records.is_empty() { None } else { Some(records) }
    }
}
