//! Block-list policy for the proxy.
//!
//! Rules come from a plain-text file, one per line: exact domains
//! (`ads.example.com`), IPv4/IPv6 literals, or wildcard suffixes
//! (`*.example.com`). Lookups are read-mostly; the rule set is only
//! replaced wholesale by [`HostFilter::load_rules`].

use std::collections::HashSet;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct RuleSet {
    domains: HashSet<String>,
    ips: HashSet<String>,
}

/// Shared host block-list with exact, IP-literal, and `*.` suffix rules.
#[derive(Debug, Default)]
pub struct HostFilter {
    rules: RwLock<RuleSet>,
}

impl HostFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads rules from `path`, replacing the previous rule set atomically.
    ///
    /// `#` starts a comment (whole-line or inline); blank lines are
    /// skipped; rules are lowercased. A line that parses as an IP literal
    /// joins the IP set, everything else the domain set. A missing file
    /// is not an error and yields an empty rule set.
    pub fn load_rules(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let text = match fs::read_to_string(path.as_ref()) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => String::new(),
            Err(error) => return Err(error),
        };

        let mut next = RuleSet::default();
        for raw_line in text.lines() {
            let line = match raw_line.split_once('#') {
                Some((content, _comment)) => content,
                None => raw_line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let rule = line.to_ascii_lowercase();
            if rule.parse::<IpAddr>().is_ok() {
                next.ips.insert(rule);
            } else {
                next.domains.insert(rule);
            }
        }

        *self.rules.write().expect("host filter lock poisoned") = next;
        Ok(())
    }

    /// Tests `host` against the rule set and returns the matching rule.
    ///
    /// Exact domain and IP matches return the host itself; wildcard
    /// matches return the original `*.`-form rule. A rule `*.X` matches
    /// `X` and any host ending in `.X`.
    pub fn is_blocked(&self, host: &str) -> Option<String> {
        let host = host.trim().to_ascii_lowercase();
        let rules = self.rules.read().expect("host filter lock poisoned");

        if rules.domains.contains(&host) || rules.ips.contains(&host) {
            return Some(host);
        }

        for rule in &rules.domains {
            if let Some(suffix) = rule.strip_prefix("*.") {
                if matches_suffix_or_equal(&host, suffix) {
                    return Some(rule.clone());
                }
            }
        }

        None
    }

    /// Number of (domain, IP) rules currently loaded.
    pub fn rule_counts(&self) -> (usize, usize) {
        let rules = self.rules.read().expect("host filter lock poisoned");
        (rules.domains.len(), rules.ips.len())
    }
}

fn matches_suffix_or_equal(host: &str, suffix: &str) -> bool {
    if host == suffix {
        return true;
    }
    if host.len() <= suffix.len() {
        return false;
    }
    host.ends_with(suffix) && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}
