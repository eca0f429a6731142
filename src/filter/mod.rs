//! Domain and address classification.
//!
//! Provides the rule matcher used to pick a group for a query and to decide
//! domain redirects, plus the CIDR membership set used by address redirects.

mod cidr;
mod rules;

pub use cidr::CidrSet;
pub use rules::RuleSet;

/// Classifies domain names.
///
/// `lookup` returns `Some(true)` when a rule blocks (selects) the domain,
/// `Some(false)` when an allow rule covers it, and `None` when no rule
/// applies and the caller has to fall back to its default policy.
pub trait Matcher: Send + Sync {
    fn lookup(&self, domain: &str) -> Option<bool>;

    /// Shorthand for a known, positive match.
    fn is_match(&self, domain: &str) -> bool {
        self.lookup(domain) == Some(true)
    }
}

impl Matcher for RuleSet {
    fn lookup(&self, domain: &str) -> Option<bool> {
        RuleSet::lookup(self, domain)
    }
}

/// Matches every domain. Used by the catch-all group.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchAll;

impl Matcher for MatchAll {
    fn lookup(&self, _domain: &str) -> Option<bool> {
        Some(true)
    }
}
