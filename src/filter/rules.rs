//! AdBlock-Plus style domain rules.
//!
//! Rules are compiled once into an exact index keyed by canonical domain
//! (lowercase, trailing dot) and two lists of anchored wildcard patterns.

use std::fs;
use std::path::Path;

use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::dns::canonical;
use crate::error::{Error, Result};

/// Compiled set of block/allow rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    exact: FxHashMap<String, bool>,
    wildcard_blocked: Wildcards,
    wildcard_allowed: Wildcards,
}

#[derive(Debug, Default)]
struct Wildcards {
    patterns: Vec<Regex>,
    seen: FxHashSet<String>,
}

impl Wildcards {
    fn push(&mut self, pattern: Regex) {
        if self.seen.insert(pattern.as_str().to_string()) {
            self.patterns.push(pattern);
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }

    fn len(&self) -> usize {
        self.patterns.len()
    }
}

/// A single parsed rule line.
#[derive(Debug, PartialEq, Eq)]
struct Rule {
    domain: String,
    allow: bool,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile rules from text, one per line. Unusable lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut rules = Self::new();
        for line in text.lines() {
            rules.add_rule(line);
        }
        rules
    }

    /// Compile a rule file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::parse(&text))
    }

    /// Compile and merge several rule files in order.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut rules = Self::new();
        for path in paths {
            rules.extend(Self::from_file(path)?);
        }
        Ok(rules)
    }

    /// Add one rule line. Returns false if the line was ignored.
    pub fn add_rule(&mut self, line: &str) -> bool {
        let Some(rule) = parse_rule(line) else {
            return false;
        };

        if rule.domain.contains('*') {
            let Some(pattern) = wildcard(&rule.domain) else {
                return false;
            };
            if rule.allow {
                self.wildcard_allowed.push(pattern);
            } else {
                self.wildcard_blocked.push(pattern);
            }
        } else {
            self.exact
                .entry(canonical(&rule.domain))
                .or_insert(!rule.allow);
        }
        true
    }

    /// Merge `other` into this set. Entries already present win.
    pub fn extend(&mut self, other: RuleSet) {
        for (domain, blocked) in other.exact {
            self.exact.entry(domain).or_insert(blocked);
        }
        for pattern in other.wildcard_blocked.patterns {
            self.wildcard_blocked.push(pattern);
        }
        for pattern in other.wildcard_allowed.patterns {
            self.wildcard_allowed.push(pattern);
        }
    }

    /// Classify a domain.
    ///
    /// An exact entry for the name itself wins. Otherwise blocked wildcards
    /// are tried, then allowed wildcards, then the exact index for each parent
    /// domain, most specific first.
    pub fn lookup(&self, domain: &str) -> Option<bool> {
        let name = canonical(domain);

        if let Some(&blocked) = self.exact.get(&name) {
            return Some(blocked);
        }
        if self.wildcard_blocked.matches(&name) {
            return Some(true);
        }
        if self.wildcard_allowed.matches(&name) {
            return Some(false);
        }

        let mut rest = name.as_str();
        while let Some(pos) = rest.find('.') {
            rest = &rest[pos + 1..];
            if rest.is_empty() {
                break;
            }
            if let Some(&blocked) = self.exact.get(rest) {
                return Some(blocked);
            }
        }
        None
    }

    /// Total number of compiled rules.
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard_blocked.len() + self.wildcard_allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_rule(line: &str) -> Option<Rule> {
    let mut rule = line.trim();
    if rule.is_empty() || rule.starts_with(|c: char| matches!(c, '!' | '#' | '[')) {
        return None;
    }

    let allow = match rule.strip_prefix("@@") {
        Some(rest) => {
            rule = rest;
            true
        }
        None => false,
    };

    rule = rule
        .strip_prefix("||")
        .or_else(|| rule.strip_prefix('|'))
        .unwrap_or(rule);
    if let Some((_, rest)) = rule.split_once("://") {
        rule = rest;
    }
    if let Some(end) = rule.find(|c: char| matches!(c, '/' | '^' | '$')) {
        rule = &rule[..end];
    }

    let domain = rule.trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() || domain.contains(char::is_whitespace) || !valid_tld(&domain) {
        return None;
    }
    Some(Rule { domain, allow })
}

/// Top-level label must be alphabetic (2+ chars) or an IDN `xn--` label.
fn valid_tld(domain: &str) -> bool {
    let Some(tld) = domain.rsplit('.').next() else {
        return false;
    };
    if let Some(idn) = tld.strip_prefix("xn--") {
        return idn.len() >= 3 && idn.chars().all(|c| c.is_ascii_alphanumeric());
    }
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

fn wildcard(domain: &str) -> Option<Regex> {
    let escaped = regex::escape(&canonical(domain)).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$")).ok()
}
