//! In-memory IP/CIDR membership set.

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{Error, Result};

/// Set of networks built from line-oriented text (one address or CIDR per
/// line, `#` comments allowed).
#[derive(Debug, Default, Clone)]
pub struct CidrSet {
    v4: Vec<Ipv4Net>,
    v6: Vec<Ipv6Net>,
}

impl CidrSet {
    /// Parse a list. Any malformed line fails the whole set.
    pub fn parse(text: &str) -> Result<Self> {
        let mut set = Self::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            set.insert(parse_net(line)?);
        }
        set.normalize();
        Ok(set)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text)
    }

    /// Load and merge several lists.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut set = Self::default();
        for path in paths {
            set.extend(Self::from_file(path)?);
        }
        Ok(set)
    }

    /// Merge `other` into this set.
    pub fn extend(&mut self, other: CidrSet) {
        self.v4.extend(other.v4);
        self.v6.extend(other.v6);
        self.normalize();
    }

    /// Collapse overlapping and adjacent networks so each list is sorted and
    /// disjoint, which `contains` relies on.
    fn normalize(&mut self) {
        self.v4 = Ipv4Net::aggregate(&self.v4);
        self.v6 = Ipv6Net::aggregate(&self.v6);
    }

    fn insert(&mut self, net: IpNet) {
        match net {
            IpNet::V4(net) => self.v4.push(net),
            IpNet::V6(net) => self.v6.push(net),
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(addr) => {
                let idx = self.v4.partition_point(|net| net.network() <= addr);
                idx > 0 && self.v4[idx - 1].contains(&addr)
            }
            IpAddr::V6(addr) => {
                let idx = self.v6.partition_point(|net| net.network() <= addr);
                idx > 0 && self.v6[idx - 1].contains(&addr)
            }
        }
    }

    /// Number of disjoint networks after merging.
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

fn parse_net(line: &str) -> Result<IpNet> {
    if line.contains('/') {
        line.parse::<IpNet>()
            .map(|net| net.trunc())
            .map_err(|_| Error::InvalidCidr(line.to_string()))
    } else {
        line.parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|_| Error::InvalidCidr(line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn contains_cidrs_and_bare_addresses() {
        let set = CidrSet::parse("1.0.1.0/24\n# comment\n\n114.114.114.114\n2001:db8::/32\n").unwrap();

        assert!(set.contains(ip("1.0.1.200")));
        assert!(set.contains(ip("114.114.114.114")));
        assert!(set.contains(ip("2001:db8::1")));
        assert!(!set.contains(ip("1.0.2.1")));
        assert!(!set.contains(ip("114.114.114.115")));
        assert!(!set.contains(ip("2001:db9::1")));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn host_bits_are_truncated() {
        let set = CidrSet::parse("10.1.2.3/8").unwrap();

        assert!(set.contains(ip("10.200.0.1")));
    }

    #[test]
    fn malformed_line_is_an_error() {
        let err = CidrSet::parse("1.2.3.0/24\nnot-an-ip\n").unwrap_err();

        assert!(matches!(err, Error::InvalidCidr(line) if line == "not-an-ip"));
    }

    #[test]
    fn overlapping_networks_are_merged() {
        let mut set = CidrSet::parse("10.0.0.0/8\n10.20.0.0/16\n192.168.0.0/24\n192.168.1.0/24\n").unwrap();
        set.extend(CidrSet::parse("10.0.0.1\n172.16.0.0/12\n").unwrap());

        assert_eq!(set.len(), 3);
        assert!(set.contains(ip("10.20.30.40")));
        assert!(set.contains(ip("192.168.1.255")));
        assert!(set.contains(ip("172.31.255.255")));
        assert!(!set.contains(ip("192.168.2.0")));
        assert!(!set.contains(ip("9.255.255.255")));
        assert!(!set.contains(ip("172.32.0.0")));
    }

    #[test]
    fn lookup_agrees_with_scan_on_many_networks() {
        let text: String = (0..=255u32)
            .step_by(3)
            .map(|n| format!("{n}.{}.0.0/16\n", n / 2))
            .collect();
        let set = CidrSet::parse(&text).unwrap();
        let nets: Vec<IpNet> = text.lines().map(|l| l.parse().unwrap()).collect();

        for n in 0..=255u8 {
            for second in [0u8, n / 2, 200] {
                let addr = IpAddr::from([n, second, 1, 1]);
                let expected = nets.iter().any(|net| net.contains(&addr));
                assert_eq!(set.contains(addr), expected, "{addr}");
            }
        }
    }

    #[test]
    fn empty_set_contains_nothing() {
        let set = CidrSet::default();

        assert!(set.is_empty());
        assert!(!set.contains(ip("127.0.0.1")));
    }
}
