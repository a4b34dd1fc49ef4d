//! Peer addresses and the address filter
//!
//! A peer is identified by its canonical `host:port/path` string; two
//! addresses are the same peer iff the strings are equal. Inside URL path
//! segments (join/bye/update teller) the slash is carried as `+`.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BbsError, BbsResult};

/// Canonical address of a peer: `host:port/path`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddr(String);

impl NodeAddr {
    /// Parse a canonical `host:port/path` address.
    ///
    /// Accepts the wire form with `+` in place of `/` as well.
    pub fn parse(s: &str) -> BbsResult<Self> {
        let s = s.trim().replace('+', "/");
        let (hostport, path) = s
            .split_once('/')
            .ok_or_else(|| BbsError::InvalidAddress(s.clone()))?;
        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| BbsError::InvalidAddress(s.clone()))?;
        if host.is_empty() || path.is_empty() {
            return Err(BbsError::InvalidAddress(s.clone()));
        }
        port.parse::<u16>()
            .map_err(|_| BbsError::InvalidAddress(s.clone()))?;
        Ok(Self(format!("{}:{}/{}", host, port, path)))
    }

    /// The canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part of the address
    pub fn host(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// Port part of the address
    pub fn port(&self) -> u16 {
        self.0
            .split(':')
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    /// Base URL for requests against this peer
    pub fn base_url(&self) -> String {
        format!("http://{}", self.0)
    }

    /// Path-segment-safe form with `/` replaced by `+`
    pub fn to_wire(&self) -> String {
        self.0.replace('/', "+")
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Allow/deny filter applied before any peer enters a registry table
#[derive(Debug, Default)]
pub struct NodeFilter {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl NodeFilter {
    /// Compile a filter from allow and deny pattern lists.
    ///
    /// An empty allow list admits every address not matched by a deny
    /// pattern. Deny patterns win over allow patterns.
    pub fn new(allow: &[String], deny: &[String]) -> BbsResult<Self> {
        let compile = |patterns: &[String]| -> BbsResult<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).map_err(|e| BbsError::Config(format!("bad pattern {p}: {e}"))))
                .collect()
        };
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    /// Whether the address may be retained in any peer table
    pub fn accepts(&self, addr: &NodeAddr) -> bool {
        let s = addr.as_str();
        if self.deny.iter().any(|r| r.is_match(s)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|r| r.is_match(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_address() {
        let node = NodeAddr::parse("example.org:8000/server").unwrap();
        assert_eq!(node.as_str(), "example.org:8000/server");
        assert_eq!(node.host(), "example.org");
        assert_eq!(node.port(), 8000);
        assert_eq!(node.base_url(), "http://example.org:8000/server");
    }

    #[test]
    fn test_parse_wire_form() {
        let node = NodeAddr::parse("example.org:8000+server").unwrap();
        assert_eq!(node.as_str(), "example.org:8000/server");
        assert_eq!(node.to_wire(), "example.org:8000+server");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(NodeAddr::parse("no-port/server").is_err());
        assert!(NodeAddr::parse("host:8000").is_err());
        assert!(NodeAddr::parse("host:notaport/server").is_err());
        assert!(NodeAddr::parse("").is_err());
    }

    #[test]
    fn test_equality_is_address_equality() {
        let a = NodeAddr::parse("a.example:80/x").unwrap();
        let b = NodeAddr::parse("a.example:80+x").unwrap();
        let c = NodeAddr::parse("a.example:81/x").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_filter_deny_wins() {
        let filter = NodeFilter::new(
            &["example".to_string()],
            &["bad\\.example".to_string()],
        )
        .unwrap();
        let good = NodeAddr::parse("good.example:80/x").unwrap();
        let bad = NodeAddr::parse("bad.example:80/x").unwrap();
        let other = NodeAddr::parse("elsewhere.org:80/x").unwrap();
        assert!(filter.accepts(&good));
        assert!(!filter.accepts(&bad));
        assert!(!filter.accepts(&other));
    }

    #[test]
    fn test_empty_filter_accepts_all() {
        let filter = NodeFilter::default();
        let node = NodeAddr::parse("anywhere.net:80/x").unwrap();
        assert!(filter.accepts(&node));
    }
}
