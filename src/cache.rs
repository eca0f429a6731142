//! DNS response cache with TTL countdown.
//!
//! Entries are keyed by query fingerprint (name, type, client subnet) and
//! expire at an absolute instant. Reads rewrite answer TTLs to the time left
//! and shuffle trailing address records.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::Record;
use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dns;

/// Lower bound for the sweep tick so a zero interval cannot spin.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct CacheEntry {
    response: Message,
    expires_at: Instant,
}

/// Bounded TTL cache. Full stores refuse new fingerprints until entries
/// expire; there is no LRU eviction.
pub struct ResponseCache {
    entries: RwLock<FxHashMap<String, CacheEntry>>,
    capacity: usize,
    min_ttl: u32,
    max_ttl: u32,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ResponseCache {
    pub fn new(capacity: usize, min_ttl: Duration, max_ttl: Duration) -> Self {
        let min_ttl = min_ttl.as_secs().min(u32::MAX as u64) as u32;
        let max_ttl = max_ttl.as_secs().min(u32::MAX as u64) as u32;
        Self {
            entries: RwLock::new(FxHashMap::default()),
            capacity,
            min_ttl,
            max_ttl: max_ttl.max(min_ttl),
            sweeper: Mutex::new(None),
        }
    }

    /// Look up a cached answer for `query`.
    ///
    /// The returned message is an independent copy carrying the query's ID,
    /// with answer TTLs counting down. Expired entries are evicted.
    pub fn get(&self, query: &Message) -> Option<Message> {
        let key = dns::fingerprint(query)?;
        let now = Instant::now();

        {
            let Ok(entries) = self.entries.read() else {
                return None;
            };
            let entry = entries.get(&key)?;
            if now < entry.expires_at {
                let remaining = remaining_secs(entry.expires_at - now);
                let mut response = entry.response.clone();
                drop(entries);

                refresh(&mut response, remaining);
                dns::finalize(&mut response, query);
                return Some(response);
            }
        }

        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        if entries
            .get(&key)
            .is_some_and(|entry| Instant::now() >= entry.expires_at)
        {
            entries.remove(&key);
        }
        None
    }

    /// Store `response` under the fingerprint of `query`.
    ///
    /// Responses without answers are ignored, as are new fingerprints once
    /// the cache is full. Every answer TTL is rewritten to the effective TTL.
    pub fn set(&self, query: &Message, response: &Message) {
        let Some(min_answer_ttl) = dns::min_answer_ttl(response) else {
            return;
        };
        let Some(key) = dns::fingerprint(query) else {
            return;
        };
        let ttl = min_answer_ttl.min(self.max_ttl).max(self.min_ttl);

        let mut stored = response.clone();
        dns::set_answer_ttl(&mut stored, ttl);

        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            return;
        }
        entries.insert(
            key,
            CacheEntry {
                response: stored,
                expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
            },
        );
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    /// Spawn the periodic sweep. Restarting replaces the previous task.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let cache = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "cache sweep");
                }
            }
        });

        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(previous) = sweeper.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the sweep task. Safe to call more than once.
    pub fn stop(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whole seconds left, rounded up so a live entry never reports zero.
fn remaining_secs(left: Duration) -> u32 {
    let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
    secs.min(u64::from(u32::MAX)) as u32
}

/// Rewrite answer TTLs and shuffle the trailing run of address records.
fn refresh(response: &mut Message, ttl: u32) {
    let mut answers = response.take_answers();
    for record in &mut answers {
        record.set_ttl(ttl);
    }
    shuffle_addresses(&mut answers);
    response.insert_answers(answers);
}

/// Shuffle the contiguous A/AAAA records at the end of the answer section.
///
/// Records before the last non-address record keep their position.
pub fn shuffle_addresses(answers: &mut [Record]) {
    let start = answers
        .iter()
        .rposition(|r| !dns::is_address_type(r.record_type()))
        .map_or(0, |i| i + 1);
    answers[start..].shuffle(&mut rand::rng());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{a_record, cname_record, query, response};
    use hickory_proto::rr::RecordType;
    use std::thread::sleep;

    fn ips(message: &Message) -> Vec<String> {
        let mut ips: Vec<String> = dns::answer_ips(message)
            .iter()
            .map(|ip| ip.to_string())
            .collect();
        ips.sort();
        ips
    }

    #[test]
    fn get_counts_down_and_expires() {
        let cache = ResponseCache::new(16, Duration::from_secs(1), Duration::from_secs(1));
        let q = query("example.com.", RecordType::A);
        let r = response(
            "example.com.",
            RecordType::A,
            vec![a_record("example.com.", "1.2.3.4", 300)],
        );

        cache.set(&q, &r);
        let hit = cache.get(&q).unwrap();
        assert_eq!(hit.answers()[0].ttl(), 1);
        assert_eq!(cache.len(), 1);

        sleep(Duration::from_millis(1100));

        assert!(cache.get(&q).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn set_clamps_ttl() {
        let cache = ResponseCache::new(16, Duration::from_secs(60), Duration::from_secs(3600));
        let short = query("short.example.", RecordType::A);
        let long = query("long.example.", RecordType::A);

        cache.set(
            &short,
            &response("short.example.", RecordType::A, vec![a_record("short.example.", "1.1.1.1", 5)]),
        );
        cache.set(
            &long,
            &response(
                "long.example.",
                RecordType::A,
                vec![
                    a_record("long.example.", "1.1.1.1", 100_000),
                    a_record("long.example.", "1.1.1.2", 200_000),
                ],
            ),
        );

        assert_eq!(cache.get(&short).unwrap().answers()[0].ttl(), 60);
        let hit = cache.get(&long).unwrap();
        assert!(hit.answers().iter().all(|r| r.ttl() == 3600));
    }

    #[test]
    fn set_ignores_empty_answers() {
        let cache = ResponseCache::new(16, Duration::from_secs(60), Duration::from_secs(3600));
        let q = query("example.com.", RecordType::A);

        cache.set(&q, &response("example.com.", RecordType::A, vec![]));

        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_gate_refuses_new_fingerprints() {
        let cache = ResponseCache::new(1, Duration::from_secs(60), Duration::from_secs(3600));
        let first = query("one.example.", RecordType::A);
        let second = query("two.example.", RecordType::A);

        cache.set(&first, &response("one.example.", RecordType::A, vec![a_record("one.example.", "1.1.1.1", 60)]));
        cache.set(&second, &response("two.example.", RecordType::A, vec![a_record("two.example.", "2.2.2.2", 60)]));

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&second).is_none());

        // Refreshing an existing key is still allowed.
        cache.set(&first, &response("one.example.", RecordType::A, vec![a_record("one.example.", "3.3.3.3", 60)]));
        assert_eq!(ips(&cache.get(&first).unwrap()), vec!["3.3.3.3"]);
    }

    #[test]
    fn get_uses_query_id_and_independent_copy() {
        let cache = ResponseCache::new(16, Duration::from_secs(60), Duration::from_secs(3600));
        let q = query("example.com.", RecordType::A);
        cache.set(&q, &response("example.com.", RecordType::A, vec![a_record("example.com.", "1.1.1.1", 60)]));

        let mut other = query("Example.COM.", RecordType::A);
        other.set_id(0x4242);
        let mut hit = cache.get(&other).unwrap();
        assert_eq!(hit.id(), 0x4242);

        hit.take_answers();
        assert_eq!(cache.get(&q).unwrap().answers().len(), 1);
    }

    #[test]
    fn get_shuffles_without_losing_records() {
        let cache = ResponseCache::new(16, Duration::from_secs(60), Duration::from_secs(3600));
        let q = query("example.com.", RecordType::A);
        let original = response(
            "example.com.",
            RecordType::A,
            vec![
                cname_record("example.com.", "edge.example.net.", 60),
                a_record("edge.example.net.", "10.0.0.1", 60),
                a_record("edge.example.net.", "10.0.0.2", 60),
                a_record("edge.example.net.", "10.0.0.3", 60),
                a_record("edge.example.net.", "10.0.0.4", 60),
            ],
        );
        cache.set(&q, &original);

        for _ in 0..20 {
            let hit = cache.get(&q).unwrap();
            assert_eq!(hit.answers().len(), 5);
            assert_eq!(hit.answers()[0].record_type(), RecordType::CNAME);
            assert_eq!(ips(&hit), ips(&original));
        }
    }

    #[test]
    fn shuffle_only_touches_trailing_address_run() {
        let mut answers = vec![
            a_record("example.com.", "1.1.1.1", 60),
            cname_record("example.com.", "edge.example.net.", 60),
            a_record("edge.example.net.", "2.2.2.2", 60),
            a_record("edge.example.net.", "3.3.3.3", 60),
        ];

        for _ in 0..20 {
            shuffle_addresses(&mut answers);
            assert_eq!(dns::record_ip(&answers[0]), Some("1.1.1.1".parse().unwrap()));
            assert_eq!(answers[1].record_type(), RecordType::CNAME);
        }
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let cache = ResponseCache::new(16, Duration::from_secs(1), Duration::from_secs(1));
        let q = query("example.com.", RecordType::A);
        cache.set(&q, &response("example.com.", RecordType::A, vec![a_record("example.com.", "1.1.1.1", 60)]));

        assert_eq!(cache.sweep(), 0);
        sleep(Duration::from_millis(1100));

        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn background_sweep_runs_and_stops() {
        let cache = Arc::new(ResponseCache::new(
            16,
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let q = query("example.com.", RecordType::A);
        cache.set(&q, &response("example.com.", RecordType::A, vec![a_record("example.com.", "1.1.1.1", 60)]));

        cache.start(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(cache.is_empty());

        cache.stop();
        cache.stop();
    }
}
