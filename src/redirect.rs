//! Conditional re-resolution of a group's answer through another group.
//!
//! A redirector inspects the answer a group produced, either by the
//! addresses in it or by the queried name, and when its condition triggers
//! the original query is resolved again by the target group.

use std::fmt;
use std::sync::{Arc, Weak};

use hickory_proto::op::Message;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::dns;
use crate::filter::{CidrSet, Matcher};
use crate::group::{Group, Hop, Visited};

/// What a redirector looks at.
pub enum Condition {
    /// Addresses in the answer section against a CIDR set.
    Ip(Arc<CidrSet>),
    /// The queried name against a rule set.
    Domain(Arc<dyn Matcher>),
}

/// Whether a match or a miss triggers the redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Polarity {
    #[serde(rename = "matched")]
    IfMatched,
    #[serde(rename = "not_matched")]
    IfNotMatched,
}

pub struct Redirector {
    name: String,
    condition: Condition,
    polarity: Polarity,
    target: Weak<Group>,
    target_name: String,
}

impl fmt::Debug for Redirector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redirector")
            .field("name", &self.name)
            .field("polarity", &self.polarity)
            .field("target", &self.target_name)
            .finish_non_exhaustive()
    }
}

impl Redirector {
    /// The target is held weakly; the snapshot owning both groups keeps it
    /// alive.
    pub fn new(name: impl Into<String>, condition: Condition, polarity: Polarity, target: &Arc<Group>) -> Self {
        Self {
            name: name.into(),
            condition,
            polarity,
            target: Arc::downgrade(target),
            target_name: target.name().to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group to re-resolve through, or `None` when the response stands.
    ///
    /// Redirecting a group's answer back into the same group is refused.
    pub fn redirect(&self, query: &Message, response: &Message, source: &str) -> Option<Arc<Group>> {
        if !self.triggers(query, response) {
            return None;
        }
        if self.target_name == source {
            warn!(redirector = %self.name, group = source, "refusing to redirect a group to itself");
            return None;
        }
        self.target.upgrade()
    }

    fn triggers(&self, query: &Message, response: &Message) -> bool {
        let matched = match &self.condition {
            Condition::Ip(set) => dns::answer_ips(response).into_iter().any(|ip| set.contains(ip)),
            Condition::Domain(matcher) => {
                dns::question(query).is_some_and(|q| matcher.is_match(&dns::qname(q)))
            }
        };
        match self.polarity {
            Polarity::IfMatched => matched,
            Polarity::IfNotMatched => !matched,
        }
    }
}

/// Redirectors attached to one source group, tried in declaration order.
#[derive(Debug, Default)]
pub struct RedirectorChain {
    redirectors: Vec<Redirector>,
}

impl RedirectorChain {
    pub fn new(redirectors: Vec<Redirector>) -> Self {
        Self { redirectors }
    }

    pub fn len(&self) -> usize {
        self.redirectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.redirectors.is_empty()
    }

    /// Apply the first redirector that triggers.
    ///
    /// The target answers with the original query. When it has nothing, the
    /// source response is kept.
    pub async fn handle(&self, query: &Message, response: Message, source: &str, visited: &Visited) -> Message {
        for redirector in &self.redirectors {
            let hop = Hop::Redirector(redirector.name.clone());
            if visited.contains(&hop) {
                debug!(redirector = %redirector.name, "already applied in this chain");
                continue;
            }
            let Some(target) = redirector.redirect(query, &response, source) else {
                continue;
            };

            debug!(redirector = %redirector.name, from = source, to = target.name(), "redirecting");
            let visited = visited.with(hop);
            return match target.handle(query, &visited).await {
                Some(redirected) => redirected,
                None => response,
            };
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RuleSet;
    use crate::testutil::{MockCaller, a_record, query, response};
    use crate::transport::Caller;
    use hickory_proto::rr::RecordType;
    use std::net::IpAddr;

    fn group(name: &str, caller: &Arc<MockCaller>) -> Arc<Group> {
        Arc::new(Group::new(name, vec![caller.clone() as Arc<dyn Caller>]))
    }

    fn domestic() -> Condition {
        Condition::Ip(Arc::new(CidrSet::parse("1.0.0.0/8\n").unwrap()))
    }

    fn ips(message: &Message) -> Vec<IpAddr> {
        dns::answer_ips(message)
    }

    #[tokio::test]
    async fn ip_not_matched_redirects_to_target() {
        let clean_up = Arc::new(MockCaller::answering("clean", &["8.8.8.8"]));
        let dirty_up = Arc::new(MockCaller::answering("dirty", &["1.2.3.4"]));
        let clean = group("clean", &clean_up);
        let dirty = group("dirty", &dirty_up);
        clean.set_next(RedirectorChain::new(vec![Redirector::new(
            "foreign",
            domestic(),
            Polarity::IfNotMatched,
            &dirty,
        )]));

        let response = clean.resolve(&query("example.com.", RecordType::A)).await.unwrap();

        assert_eq!(ips(&response), vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
        assert_eq!(dirty_up.calls(), 1);
    }

    #[tokio::test]
    async fn ip_matched_keeps_source_answer_when_not_triggered() {
        let clean_up = Arc::new(MockCaller::answering("clean", &["1.9.9.9"]));
        let dirty_up = Arc::new(MockCaller::answering("dirty", &["5.6.7.8"]));
        let clean = group("clean", &clean_up);
        let dirty = group("dirty", &dirty_up);
        clean.set_next(RedirectorChain::new(vec![Redirector::new(
            "foreign",
            domestic(),
            Polarity::IfNotMatched,
            &dirty,
        )]));

        let response = clean.resolve(&query("example.com.", RecordType::A)).await.unwrap();

        assert_eq!(ips(&response), vec!["1.9.9.9".parse::<IpAddr>().unwrap()]);
        assert_eq!(dirty_up.calls(), 0);
    }

    #[tokio::test]
    async fn domain_condition_uses_original_question() {
        let source_up = Arc::new(MockCaller::answering("source", &["10.0.0.1"]));
        let target_up = Arc::new(MockCaller::answering("target", &["10.0.0.2"]));
        let source = group("source", &source_up);
        let target = group("target", &target_up);
        let rules: Arc<dyn Matcher> = Arc::new(RuleSet::parse("video.example\n"));
        source.set_next(RedirectorChain::new(vec![Redirector::new(
            "video",
            Condition::Domain(rules),
            Polarity::IfMatched,
            &target,
        )]));

        let hit = source.resolve(&query("cdn.video.example.", RecordType::A)).await.unwrap();
        let miss = source.resolve(&query("news.example.", RecordType::A)).await.unwrap();

        assert_eq!(ips(&hit), vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
        assert_eq!(ips(&miss), vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn failed_target_keeps_source_response() {
        let source_up = Arc::new(MockCaller::answering("source", &["8.8.8.8"]));
        let target_up = Arc::new(MockCaller::failing("target"));
        let source = group("source", &source_up);
        let target = group("target", &target_up);
        source.set_next(RedirectorChain::new(vec![Redirector::new(
            "foreign",
            domestic(),
            Polarity::IfNotMatched,
            &target,
        )]));

        let response = source.resolve(&query("example.com.", RecordType::A)).await.unwrap();

        assert_eq!(ips(&response), vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
        assert_eq!(target_up.calls(), 1);
    }

    #[tokio::test]
    async fn self_redirect_is_refused() {
        let up = Arc::new(MockCaller::answering("up", &["8.8.8.8"]));
        let only = group("only", &up);
        only.set_next(RedirectorChain::new(vec![Redirector::new(
            "loop",
            domestic(),
            Polarity::IfNotMatched,
            &only,
        )]));

        let response = only.resolve(&query("example.com.", RecordType::A)).await.unwrap();

        assert_eq!(ips(&response), vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
        assert_eq!(up.calls(), 1);
    }

    #[test]
    fn redirect_returns_nothing_for_own_group() {
        let up = Arc::new(MockCaller::answering("up", &["8.8.8.8"]));
        let only = group("only", &up);
        let redirector = Redirector::new("loop", domestic(), Polarity::IfNotMatched, &only);
        let q = query("example.com.", RecordType::A);
        let answer = response("example.com.", RecordType::A, vec![a_record("example.com.", "8.8.8.8", 60)]);

        assert!(redirector.redirect(&q, &answer, "only").is_none());
        let target = redirector.redirect(&q, &answer, "elsewhere").unwrap();
        assert_eq!(target.name(), "only");
    }

    #[test]
    fn domain_not_matched_triggers_for_unknown_and_allowed_names() {
        let up = Arc::new(MockCaller::answering("up", &["10.0.0.2"]));
        let target = group("target", &up);
        let rules: Arc<dyn Matcher> = Arc::new(RuleSet::parse("ads.example\n@@safe.ads.example\n"));
        let redirector = Redirector::new("clean", Condition::Domain(rules), Polarity::IfNotMatched, &target);
        let empty = |name: &str| response(name, RecordType::A, vec![]);

        let unknown = query("news.example.", RecordType::A);
        let allowed = query("safe.ads.example.", RecordType::A);
        let blocked = query("cdn.ads.example.", RecordType::A);

        assert!(redirector.redirect(&unknown, &empty("news.example."), "source").is_some());
        assert!(redirector.redirect(&allowed, &empty("safe.ads.example."), "source").is_some());
        assert!(redirector.redirect(&blocked, &empty("cdn.ads.example."), "source").is_none());
    }

    #[tokio::test]
    async fn ip_matched_redirects_domestic_answer() {
        let source_up = Arc::new(MockCaller::answering("source", &["1.2.3.4"]));
        let target_up = Arc::new(MockCaller::answering("target", &["1.1.1.1"]));
        let source = group("source", &source_up);
        let target = group("target", &target_up);
        source.set_next(RedirectorChain::new(vec![Redirector::new(
            "domestic",
            domestic(),
            Polarity::IfMatched,
            &target,
        )]));

        let redirected = source.resolve(&query("example.com.", RecordType::A)).await.unwrap();

        assert_eq!(ips(&redirected), vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!((source_up.calls(), target_up.calls()), (1, 1));
    }

    #[tokio::test]
    async fn mutual_redirects_terminate() {
        let a_up = Arc::new(MockCaller::answering("a", &["8.8.8.8"]));
        let b_up = Arc::new(MockCaller::answering("b", &["9.9.9.9"]));
        let a = group("a", &a_up);
        let b = group("b", &b_up);
        a.set_next(RedirectorChain::new(vec![Redirector::new("a-to-b", domestic(), Polarity::IfNotMatched, &b)]));
        b.set_next(RedirectorChain::new(vec![Redirector::new("b-to-a", domestic(), Polarity::IfNotMatched, &a)]));

        let response = a.resolve(&query("example.com.", RecordType::A)).await.unwrap();

        // b's attempt to go back to a is cut, so b's answer stands.
        assert_eq!(ips(&response), vec!["9.9.9.9".parse::<IpAddr>().unwrap()]);
        assert_eq!((a_up.calls(), b_up.calls()), (1, 1));
    }

    #[tokio::test]
    async fn first_triggering_redirector_wins() {
        let source_up = Arc::new(MockCaller::answering("source", &["8.8.8.8"]));
        let first_up = Arc::new(MockCaller::answering("first", &["10.0.0.1"]));
        let second_up = Arc::new(MockCaller::answering("second", &["10.0.0.2"]));
        let source = group("source", &source_up);
        let first = group("first", &first_up);
        let second = group("second", &second_up);
        source.set_next(RedirectorChain::new(vec![
            Redirector::new("never", domestic(), Polarity::IfMatched, &second),
            Redirector::new("foreign", domestic(), Polarity::IfNotMatched, &first),
            Redirector::new("also", domestic(), Polarity::IfNotMatched, &second),
        ]));

        let response = source.resolve(&query("example.com.", RecordType::A)).await.unwrap();

        assert_eq!(ips(&response), vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(second_up.calls(), 0);
    }

    #[test]
    fn polarity_reads_from_config_words() {
        #[derive(Deserialize)]
        struct Wrapper {
            when: Polarity,
        }

        let matched: Wrapper = toml::from_str("when = \"matched\"").unwrap();
        let missed: Wrapper = toml::from_str("when = \"not_matched\"").unwrap();

        assert_eq!(matched.when, Polarity::IfMatched);
        assert_eq!(missed.when, Polarity::IfNotMatched);
    }
}
