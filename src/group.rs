//! Upstream groups: a named set of callers, the rules that route queries to
//! them, and how their answers are raced and post-processed.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, select_ok};
use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use ipnet::IpNet;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dns;
use crate::filter::{MatchAll, Matcher};
use crate::ping::{NetPinger, Pinger};
use crate::redirect::RedirectorChain;
use crate::sink::IpSink;
use crate::transport::Caller;

/// How queries are sent to the callers of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// One caller at a time, in order, until one answers.
    #[default]
    Sequential,
    /// All callers at once; the first answer wins.
    Concurrent,
}

/// Fastest-IP selection for address queries.
#[derive(Debug, Clone, Copy)]
pub struct FastestIp {
    /// Probe this TCP port instead of ICMP when non-zero.
    pub tcp_port: u16,
    pub timeout: Duration,
    pub max_candidates: usize,
}

impl Default for FastestIp {
    fn default() -> Self {
        Self {
            tcp_port: 0,
            timeout: Duration::from_millis(500),
            max_candidates: 15,
        }
    }
}

/// Outbound query rewriting applied before any caller sees the query.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rewrite {
    pub strip_cookie: bool,
    pub client_subnet: Option<IpNet>,
}

impl Rewrite {
    /// A rewritten copy of `query`, or `None` when nothing would change.
    fn apply(&self, query: &Message) -> Option<Message> {
        if !self.strip_cookie && self.client_subnet.is_none() {
            return None;
        }
        let mut outbound = query.clone();
        if self.strip_cookie {
            dns::strip_cookie(&mut outbound);
        }
        if let Some(subnet) = self.client_subnet {
            dns::ensure_client_subnet(&mut outbound, subnet);
        }
        Some(outbound)
    }
}

/// One step of a resolution chain, used to stop redirect loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop {
    Group(String),
    Redirector(String),
}

/// Groups and redirectors already entered by the current request.
#[derive(Debug, Clone, Default)]
pub struct Visited {
    hops: Vec<Hop>,
}

impl Visited {
    pub fn contains(&self, hop: &Hop) -> bool {
        self.hops.contains(hop)
    }

    /// A copy with `hop` appended. `self` is left as is, so sibling branches
    /// never see each other's hops.
    pub fn with(&self, hop: Hop) -> Self {
        let mut hops = self.hops.clone();
        hops.push(hop);
        Self { hops }
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// A named set of upstream callers.
pub struct Group {
    name: String,
    matcher: Arc<dyn Matcher>,
    callers: Vec<Arc<dyn Caller>>,
    dispatch: Dispatch,
    fastest: Option<FastestIp>,
    pinger: Arc<dyn Pinger>,
    rewrite: Rewrite,
    sink: Option<(Arc<dyn IpSink>, u32)>,
    next: OnceLock<RedirectorChain>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("callers", &self.callers)
            .field("dispatch", &self.dispatch)
            .field("fastest", &self.fastest)
            .field("rewrite", &self.rewrite)
            .finish_non_exhaustive()
    }
}

impl Group {
    /// A group matching every domain, dispatching sequentially.
    pub fn new(name: impl Into<String>, callers: Vec<Arc<dyn Caller>>) -> Self {
        Self {
            name: name.into(),
            matcher: Arc::new(MatchAll),
            callers,
            dispatch: Dispatch::default(),
            fastest: None,
            pinger: Arc::new(NetPinger),
            rewrite: Rewrite::default(),
            sink: None,
            next: OnceLock::new(),
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Race answered addresses for A/AAAA queries and keep the fastest.
    pub fn with_fastest_ip(mut self, fastest: FastestIp) -> Self {
        self.fastest = Some(fastest);
        self
    }

    pub fn with_pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pinger = pinger;
        self
    }

    pub fn with_rewrite(mut self, rewrite: Rewrite) -> Self {
        self.rewrite = rewrite;
        self
    }

    /// Hand every answered IPv4 address to `sink`. A `ttl` of zero keeps the
    /// record's own TTL.
    pub fn with_sink(mut self, sink: Arc<dyn IpSink>, ttl: u32) -> Self {
        self.sink = Some((sink, ttl));
        self
    }

    /// Install the redirectors that post-process this group's answers.
    ///
    /// Returns `false` if a chain was already installed.
    pub fn set_next(&self, chain: RedirectorChain) -> bool {
        self.next.set(chain).is_ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matcher(&self) -> &dyn Matcher {
        self.matcher.as_ref()
    }

    pub fn callers(&self) -> &[Arc<dyn Caller>] {
        &self.callers
    }

    /// Resolve `query` through this group and its redirectors.
    ///
    /// `None` means no usable answer, so the caller falls back to whatever it
    /// already had.
    pub async fn resolve(&self, query: &Message) -> Option<Message> {
        self.handle(query, &Visited::default()).await
    }

    /// Resolve `query` as one step of an existing chain.
    pub fn handle<'a>(&'a self, query: &'a Message, visited: &'a Visited) -> BoxFuture<'a, Option<Message>> {
        async move {
            let hop = Hop::Group(self.name.clone());
            if visited.contains(&hop) {
                warn!(group = %self.name, hops = visited.len(), "redirect loop detected");
                return None;
            }
            let visited = visited.with(hop);

            let outbound = self.rewrite.apply(query);
            let response = self.call_upstreams(outbound.as_ref().unwrap_or(query)).await?;
            self.submit_addresses(&response);

            match self.next.get() {
                Some(chain) => Some(chain.handle(query, response, &self.name, &visited).await),
                None => Some(response),
            }
        }
        .boxed()
    }

    /// Release caller resources. Called when the owning snapshot retires.
    pub fn exit(&self) {
        for caller in &self.callers {
            caller.exit();
        }
    }

    async fn call_upstreams(&self, query: &Message) -> Option<Message> {
        if self.callers.is_empty() {
            return None;
        }

        let address_query = dns::question(query).is_some_and(|q| dns::is_address_type(q.query_type()));
        if let Some(fastest) = self.fastest.filter(|_| address_query) {
            return self.fastest_response(query, fastest).await;
        }

        match self.dispatch {
            Dispatch::Sequential => self.sequential(query).await,
            Dispatch::Concurrent => self.concurrent(query).await,
        }
    }

    async fn sequential(&self, query: &Message) -> Option<Message> {
        for caller in &self.callers {
            match caller.call(query).await {
                Ok(response) => return Some(response),
                Err(e) => debug!(group = %self.name, upstream = caller.name(), error = %e, "upstream failed"),
            }
        }
        None
    }

    async fn concurrent(&self, query: &Message) -> Option<Message> {
        let mut results = self.fan_out(query);
        for _ in 0..self.callers.len() {
            match results.recv().await {
                Some(Some(response)) => return Some(response),
                Some(None) => continue,
                None => break,
            }
        }
        None
    }

    /// Call every upstream from its own task. The channel holds one slot per
    /// caller so no worker ever blocks once the reader is gone.
    fn fan_out(&self, query: &Message) -> mpsc::Receiver<Option<Message>> {
        let (tx, rx) = mpsc::channel(self.callers.len());
        for caller in &self.callers {
            let caller = caller.clone();
            let query = query.clone();
            let tx = tx.clone();
            let group = self.name.clone();
            tokio::spawn(async move {
                let result = match caller.call(&query).await {
                    Ok(response) => Some(response),
                    Err(e) => {
                        debug!(%group, upstream = caller.name(), error = %e, "upstream failed");
                        None
                    }
                };
                let _ = tx.send(result).await;
            });
        }
        rx
    }

    async fn fastest_response(&self, query: &Message, fastest: FastestIp) -> Option<Message> {
        let mut results = self.fan_out(query);
        let mut responses: Vec<Message> = Vec::new();
        let mut candidates: Vec<(IpAddr, usize)> = Vec::new();
        let mut seen = FxHashSet::default();

        for _ in 0..self.callers.len() {
            let Some(result) = results.recv().await else {
                break;
            };
            let Some(response) = result else {
                continue;
            };
            let index = responses.len();
            for ip in dns::answer_ips(&response) {
                if candidates.len() >= fastest.max_candidates {
                    break;
                }
                if seen.insert(ip) {
                    candidates.push((ip, index));
                }
            }
            responses.push(response);
        }

        // The first response is the fallback whenever racing cannot decide.
        match candidates.len() {
            0 => return responses.into_iter().next(),
            1 => return responses.into_iter().nth(candidates[0].1),
            _ => {}
        }

        match self.race(&candidates, fastest).await {
            Some((ip, index)) => {
                let mut winner = responses.swap_remove(index);
                dns::keep_single_address(&mut winner, ip);
                Some(winner)
            }
            None => responses.into_iter().next(),
        }
    }

    async fn race(&self, candidates: &[(IpAddr, usize)], fastest: FastestIp) -> Option<(IpAddr, usize)> {
        let pings = candidates.iter().map(|&(ip, index)| {
            let pinger = self.pinger.clone();
            async move {
                pinger
                    .ping(ip, fastest.tcp_port, fastest.timeout)
                    .await
                    .map(|()| (ip, index))
            }
            .boxed()
        });

        match tokio::time::timeout(fastest.timeout, select_ok(pings)).await {
            Ok(Ok((winner, _))) => Some(winner),
            Ok(Err(e)) => {
                debug!(group = %self.name, error = %e, "no candidate answered ping");
                None
            }
            Err(_) => {
                debug!(group = %self.name, "ping race timed out");
                None
            }
        }
    }

    fn submit_addresses(&self, response: &Message) {
        let Some((sink, ttl)) = &self.sink else {
            return;
        };
        let addrs: Vec<(IpAddr, u32)> = response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(a)) => Some((IpAddr::V4(a.0), record.ttl())),
                _ => None,
            })
            .collect();
        if addrs.is_empty() {
            return;
        }

        let sink = sink.clone();
        let ttl = *ttl;
        let group = self.name.clone();
        tokio::spawn(async move {
            for (ip, record_ttl) in addrs {
                let ttl = if ttl > 0 { ttl } else { record_ttl };
                if let Err(e) = sink.add(ip, ttl).await {
                    warn!(%group, %ip, error = %e, "failed to add address to ip set");
                }
            }
        });
    }
}
