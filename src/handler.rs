//! Request handling and hot reload.
//!
//! A [`Snapshot`] is one immutable configuration: disabled types, hosts
//! readers, the cache, and the group/redirector graph. The [`Handler`] holds
//! the live snapshot behind an `ArcSwap`; every request loads it once, so a
//! reload never mixes two configurations within a request.

use std::fmt;
use std::iter;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::cache::ResponseCache;
use crate::config::{Config, GroupConfig, RedirectConfig, RedirectKind};
use crate::dns;
use crate::error::{Error, Result};
use crate::filter::{CidrSet, RuleSet};
use crate::group::{Dispatch, FastestIp, Group, Rewrite};
use crate::hosts::{HostsReader, StaticHosts};
use crate::ping::{NetPinger, Pinger};
use crate::redirect::{Condition, Redirector, RedirectorChain};
use crate::sink::IpsetSink;
use crate::transport;

/// Where an answer came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Disabled,
    Hosts,
    Cache,
    Group(String),
    /// No group produced an answer; the client got an empty reply.
    Failed,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Disabled => f.write_str("disabled"),
            Source::Hosts => f.write_str("hosts"),
            Source::Cache => f.write_str("cached"),
            Source::Group(name) => write!(f, "group:{name}"),
            Source::Failed => f.write_str("failed"),
        }
    }
}

/// The answer to one client query.
#[derive(Debug)]
pub struct Reply {
    pub message: Message,
    pub source: Source,
}

impl Reply {
    fn new(message: Message, source: Source) -> Self {
        Self { message, source }
    }
}

/// One immutable configuration generation.
pub struct Snapshot {
    generation: u64,
    disabled: FxHashSet<RecordType>,
    hosts: Vec<Arc<dyn HostsReader>>,
    cache: Arc<ResponseCache>,
    /// Tried in order; the first whose rules match takes the query.
    groups: Vec<Arc<Group>>,
    fallback: Arc<Group>,
    sweep_interval: Duration,
    stopped: AtomicBool,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("generation", &self.generation)
            .field("disabled", &self.disabled)
            .field("groups", &self.groups)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    /// A snapshot sending everything to `fallback`.
    pub fn new(fallback: Arc<Group>, cache: ResponseCache) -> Self {
        Self {
            generation: 0,
            disabled: FxHashSet::default(),
            hosts: Vec::new(),
            cache: Arc::new(cache),
            groups: Vec::new(),
            fallback,
            sweep_interval: Duration::from_secs(60),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_groups(mut self, groups: Vec<Arc<Group>>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_disabled(mut self, types: impl IntoIterator<Item = RecordType>) -> Self {
        self.disabled.extend(types);
        self
    }

    pub fn with_hosts(mut self, hosts: Arc<dyn HostsReader>) -> Self {
        self.hosts.push(hosts);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Build every component named by `config`.
    ///
    /// Nothing is started; a failure leaves no background work behind.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut disabled = FxHashSet::default();
        for name in &config.disabled_qtypes {
            let rtype = RecordType::from_str(&name.to_ascii_uppercase())
                .map_err(|_| Error::UnknownQueryType(name.clone()))?;
            disabled.insert(rtype);
        }
        if config.disable_aaaa {
            disabled.insert(RecordType::AAAA);
        }

        let hosts = config
            .hosts
            .iter()
            .map(|path| StaticHosts::from_file(path).map(|h| Arc::new(h) as Arc<dyn HostsReader>))
            .collect::<Result<Vec<_>>>()?;

        let cache = ResponseCache::new(config.cache.size, config.cache.min_ttl(), config.cache.max_ttl());

        let pinger: Arc<dyn Pinger> = Arc::new(NetPinger);
        let mut groups: Vec<Arc<Group>> = Vec::with_capacity(config.groups.len());
        for group in &config.groups {
            if groups.iter().any(|g| g.name() == group.name) {
                return Err(Error::DuplicateGroup(group.name.clone()));
            }
            let catch_all = group.name == config.default_group;
            groups.push(Arc::new(build_group(group, &pinger, catch_all)?));
        }
        if groups.is_empty() {
            return Err(Error::NoGroups);
        }

        let find = |name: &str| {
            groups
                .iter()
                .find(|g| g.name() == name)
                .ok_or_else(|| Error::UnknownGroup(name.to_string()))
        };
        let fallback = find(config.default_group.as_str())?.clone();

        let mut chains: FxHashMap<&str, Vec<Redirector>> = FxHashMap::default();
        for redirect in &config.redirects {
            find(redirect.from.as_str())?;
            let target = find(redirect.to.as_str())?;
            let redirector = Redirector::new(&redirect.name, build_condition(redirect)?, redirect.when, target);
            chains.entry(redirect.from.as_str()).or_default().push(redirector);
        }
        for (from, redirectors) in chains {
            find(from)?.set_next(RedirectorChain::new(redirectors));
        }

        let routed = groups.iter().filter(|g| !Arc::ptr_eq(*g, &fallback)).cloned().collect();
        Ok(Self::new(fallback, cache)
            .with_groups(routed)
            .with_disabled(disabled)
            .with_sweep_interval(config.cache.sweep_interval())
            .with_hosts_list(hosts))
    }

    fn with_hosts_list(mut self, hosts: Vec<Arc<dyn HostsReader>>) -> Self {
        self.hosts.extend(hosts);
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    pub fn fallback(&self) -> &Arc<Group> {
        &self.fallback
    }

    fn start(&self) {
        self.cache.start(self.sweep_interval);
    }

    /// Stop background work and release upstream resources. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache.stop();
        for group in self.groups.iter().chain(iter::once(&self.fallback)) {
            group.exit();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Answer one query. Always produces a reply carrying the query's ID.
    pub async fn serve(&self, query: &Message) -> Reply {
        let Some(question) = dns::question(query) else {
            return Reply::new(dns::empty_reply(query, ResponseCode::FormErr), Source::Failed);
        };
        let qtype = question.query_type();
        let name = dns::qname(question);

        if self.disabled.contains(&qtype) {
            return Reply::new(dns::empty_reply(query, ResponseCode::NoError), Source::Disabled);
        }

        if let Some(records) = self.hosts.iter().find_map(|hosts| hosts.record(&name, qtype)) {
            let mut reply = dns::empty_reply(query, ResponseCode::NoError);
            reply.insert_answers(records);
            return Reply::new(reply, Source::Hosts);
        }

        if let Some(cached) = self.cache.get(query) {
            return Reply::new(cached, Source::Cache);
        }

        let group = self.select(&name);
        match group.resolve(query).await {
            Some(mut response) => {
                self.cache.set(query, &response);
                dns::finalize(&mut response, query);
                Reply::new(response, Source::Group(group.name().to_string()))
            }
            None => {
                debug!(domain = %name, group = group.name(), "no upstream answered");
                Reply::new(dns::empty_reply(query, ResponseCode::NoError), Source::Failed)
            }
        }
    }

    fn select(&self, name: &str) -> &Arc<Group> {
        self.groups
            .iter()
            .find(|group| group.matcher().is_match(name))
            .unwrap_or(&self.fallback)
    }
}

fn build_group(config: &GroupConfig, pinger: &Arc<dyn Pinger>, catch_all: bool) -> Result<Group> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let callers = config
        .upstreams
        .iter()
        .map(|upstream| transport::connect(upstream, timeout))
        .collect::<Result<Vec<_>>>()?;

    let client_subnet = config.client_subnet.as_deref().map(parse_subnet).transpose()?;
    let mut group = Group::new(&config.name, callers)
        .with_pinger(pinger.clone())
        .with_rewrite(Rewrite {
            strip_cookie: config.strip_cookie,
            client_subnet,
        });

    // The default group takes whatever the others leave, so its rules are moot.
    if !catch_all {
        let mut rules = RuleSet::from_files(&config.rules)?;
        for line in &config.inline_rules {
            rules.add_rule(line);
        }
        group = group.with_matcher(Arc::new(rules));
    }
    if config.concurrent {
        group = group.with_dispatch(Dispatch::Concurrent);
    }
    if config.fastest_ip {
        group = group.with_fastest_ip(FastestIp {
            tcp_port: config.tcp_ping_port,
            timeout: Duration::from_millis(config.ping_timeout_ms),
            max_candidates: config.max_candidates,
        });
    }
    if let Some(set) = &config.ipset {
        group = group.with_sink(Arc::new(IpsetSink::new(set)), config.ipset_ttl);
    }
    Ok(group)
}

fn build_condition(config: &RedirectConfig) -> Result<Condition> {
    match config.kind {
        RedirectKind::Ip => {
            let mut set = CidrSet::from_files(&config.rules)?;
            set.extend(CidrSet::parse(&config.inline_rules.join("\n"))?);
            Ok(Condition::Ip(Arc::new(set)))
        }
        RedirectKind::Domain => {
            let mut rules = RuleSet::from_files(&config.rules)?;
            for line in &config.inline_rules {
                rules.add_rule(line);
            }
            Ok(Condition::Domain(Arc::new(rules)))
        }
    }
}

fn parse_subnet(text: &str) -> Result<IpNet> {
    text.parse::<IpNet>()
        .or_else(|_| text.parse::<IpAddr>().map(IpNet::from))
        .map(|net| net.trunc())
        .map_err(|_| Error::InvalidSubnet(text.to_string()))
}

/// Serves queries from the live snapshot and swaps in new ones.
pub struct Handler {
    current: ArcSwap<Snapshot>,
    generations: AtomicU64,
    stopped: AtomicBool,
}

impl Handler {
    /// Install and start `snapshot`. Must be called within a Tokio runtime.
    pub fn new(mut snapshot: Snapshot) -> Self {
        snapshot.generation = 1;
        let snapshot = Arc::new(snapshot);
        snapshot.start();
        Self {
            current: ArcSwap::new(snapshot),
            generations: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Answer `query` with whatever snapshot is live when it arrives.
    pub async fn serve(&self, query: &Message) -> Reply {
        let snapshot = self.current.load_full();
        snapshot.serve(query).await
    }

    /// Build a snapshot from `config` and make it live.
    ///
    /// On any build error the live snapshot is left untouched.
    pub fn reload(&self, config: &Config) -> Result<u64> {
        let expected = self.current.load_full();
        let snapshot = Snapshot::from_config(config)?;
        self.install(&expected, snapshot)
    }

    /// Make `snapshot` live. Returns its generation.
    pub fn replace(&self, snapshot: Snapshot) -> Result<u64> {
        let expected = self.current.load_full();
        self.install(&expected, snapshot)
    }

    fn install(&self, expected: &Arc<Snapshot>, mut snapshot: Snapshot) -> Result<u64> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        snapshot.generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = snapshot.generation;
        let next = Arc::new(snapshot);
        next.start();

        let previous = self.current.compare_and_swap(expected, Arc::clone(&next));
        if !Arc::ptr_eq(&*previous, expected) {
            next.stop();
            return Err(Error::ReloadConflict);
        }

        expected.stop();
        // A stop racing with the swap may have missed the new snapshot.
        if self.stopped.load(Ordering::SeqCst) {
            next.stop();
            return Err(Error::Stopped);
        }
        info!(generation, groups = next.groups.len() + 1, "configuration installed");
        Ok(generation)
    }

    /// Stop the live snapshot. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.current.load().stop();
    }
}
