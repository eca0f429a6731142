//! Test doubles shared by the unit tests.

use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustc_hash::FxHashMap;

use crate::dns;
use crate::error::{Error, Result};
use crate::ping::Pinger;
use crate::sink::IpSink;
use crate::transport::Caller;

pub fn query(name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(0x1234)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(Name::from_ascii(name).unwrap(), rtype));
    message
}

pub fn response(name: &str, rtype: RecordType, answers: Vec<Record>) -> Message {
    let mut message = query(name, rtype);
    message
        .set_message_type(MessageType::Response)
        .set_recursion_available(true);
    message.insert_answers(answers);
    message
}

pub fn a_record(name: &str, ip: &str, ttl: u32) -> Record {
    Record::from_rdata(
        Name::from_ascii(name).unwrap(),
        ttl,
        RData::A(A(ip.parse().unwrap())),
    )
}

pub fn aaaa_record(name: &str, ip: &str, ttl: u32) -> Record {
    Record::from_rdata(
        Name::from_ascii(name).unwrap(),
        ttl,
        RData::AAAA(AAAA(ip.parse().unwrap())),
    )
}

pub fn cname_record(name: &str, target: &str, ttl: u32) -> Record {
    Record::from_rdata(
        Name::from_ascii(name).unwrap(),
        ttl,
        RData::CNAME(CNAME(Name::from_ascii(target).unwrap())),
    )
}

/// Upstream stand-in answering every question with a fixed address list.
#[derive(Debug)]
pub struct MockCaller {
    name: String,
    ips: Vec<IpAddr>,
    ttl: u32,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
    exits: AtomicUsize,
    seen: Mutex<Vec<Message>>,
}

impl MockCaller {
    pub fn answering(name: &str, ips: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            ttl: 300,
            delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
            exits: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::answering(name, &[])
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn exits(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }

    /// Queries as they reached this upstream.
    pub fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Caller for MockCaller {
    async fn call(&self, query: &Message) -> Result<Message> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(query.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(Error::Timeout(self.name.clone()));
        }

        let q = dns::question(query).unwrap();
        let name = q.name().to_ascii();
        let answers = self
            .ips
            .iter()
            .filter_map(|ip| match (ip, q.query_type()) {
                (IpAddr::V4(_), RecordType::A) => Some(a_record(&name, &ip.to_string(), self.ttl)),
                (IpAddr::V6(_), RecordType::AAAA) => {
                    Some(aaaa_record(&name, &ip.to_string(), self.ttl))
                }
                _ => None,
            })
            .collect();
        let mut reply = response(&name, q.query_type(), answers);
        reply.set_id(query.id());
        Ok(reply)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn exit(&self) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Pinger that succeeds after a per-address delay and fails for unknown
/// addresses.
#[derive(Default)]
pub struct MockPinger {
    delays: FxHashMap<IpAddr, Duration>,
    calls: AtomicUsize,
}

impl MockPinger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reachable(mut self, ip: &str, delay: Duration) -> Self {
        self.delays.insert(ip.parse().unwrap(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Pinger for MockPinger {
    async fn ping(&self, ip: IpAddr, _tcp_port: u16, _timeout: Duration) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.delays.get(&ip) {
            Some(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
            None => Err(Error::Ping(ip.to_string())),
        }
    }
}

/// Sink remembering every address it was handed.
#[derive(Default)]
pub struct RecordingSink {
    added: Mutex<Vec<(IpAddr, u32)>>,
}

impl RecordingSink {
    pub fn added(&self) -> Vec<(IpAddr, u32)> {
        self.added.lock().unwrap().clone()
    }

    /// Wait until at least `count` addresses arrived or a second passed.
    pub async fn wait_for(&self, count: usize) -> Vec<(IpAddr, u32)> {
        for _ in 0..100 {
            if self.added.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.added()
    }
}

#[async_trait]
impl IpSink for RecordingSink {
    async fn add(&self, ip: IpAddr, ttl: u32) -> Result<()> {
        self.added.lock().unwrap().push((ip, ttl));
        Ok(())
    }
}
