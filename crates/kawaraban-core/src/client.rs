//! Outbound peer calls
//!
//! [`PeerClient`] is the seam between the replication machinery and the
//! network: registry, download manager and update queue only ever talk to
//! this trait, so tests can script a peer. [`HttpPeerClient`] is the real
//! implementation speaking the plain-text line protocol over HTTP, with a
//! short timeout for control calls and a longer one for bulk transfers.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{BbsError, BbsResult};
use crate::node::NodeAddr;
use crate::record::{Head, Record};
use crate::wire::{Range, SEP};

/// Reply to a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReply {
    /// Whether the remote accepted us
    pub welcome: bool,
    /// Another node the remote suggests we join as well
    pub suggestion: Option<NodeAddr>,
}

/// One `/recent` line: a head plus optional tag hints
#[derive(Debug, Clone, PartialEq)]
pub struct RecentEntry {
    pub head: Head,
    pub tags: Vec<String>,
}

impl RecentEntry {
    /// Parse `stamp<>id<>topic[<>tag:t1 t2]`
    pub fn from_wire(line: &str) -> BbsResult<Self> {
        let parts: Vec<&str> = line.trim().split(SEP).collect();
        if parts.len() < 3 {
            return Err(BbsError::InvalidRecord(line.to_string()));
        }
        let stamp = parts[0]
            .parse::<i64>()
            .map_err(|_| BbsError::InvalidRecord(line.to_string()))?;
        let id = parts[1];
        let topic = parts[2];
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) || topic.is_empty() {
            return Err(BbsError::InvalidRecord(line.to_string()));
        }
        let tags = parts
            .get(3)
            .and_then(|t| t.strip_prefix("tag:"))
            .map(|t| t.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Self {
            head: Head::new(topic, stamp, id),
            tags,
        })
    }

    /// Wire form of this entry
    pub fn to_wire(&self) -> String {
        let mut line = format!(
            "{}{}{}{}{}",
            self.head.stamp, SEP, self.head.id, SEP, self.head.topic
        );
        if !self.tags.is_empty() {
            line.push_str(SEP);
            line.push_str("tag:");
            line.push_str(&self.tags.join(" "));
        }
        line
    }
}

/// Outbound side of the wire protocol
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// `GET /ping`, returns the IP the peer observed us as
    async fn ping(&self, node: &NodeAddr) -> BbsResult<String>;

    /// `GET /node`, one peer address known to the remote
    async fn node(&self, node: &NodeAddr) -> BbsResult<NodeAddr>;

    /// `GET /join/<addr>`, ask the remote to add us
    async fn join(&self, node: &NodeAddr, myself: &NodeAddr) -> BbsResult<JoinReply>;

    /// `GET /bye/<addr>`, tell the remote we are leaving
    async fn bye(&self, node: &NodeAddr, myself: &NodeAddr) -> BbsResult<()>;

    /// `GET /have/<topic>`
    async fn have(&self, node: &NodeAddr, topic: &str) -> BbsResult<bool>;

    /// `GET /head/<topic>/<range>`
    async fn head(&self, node: &NodeAddr, topic: &str, range: &Range) -> BbsResult<Vec<Head>>;

    /// `GET /get/<topic>/<range>`
    async fn get(&self, node: &NodeAddr, topic: &str, range: &Range) -> BbsResult<Vec<Record>>;

    /// `GET /update/<topic>/<stamp>/<id>/<teller>`
    async fn update(
        &self,
        node: &NodeAddr,
        topic: &str,
        stamp: i64,
        id: &str,
        teller: &NodeAddr,
    ) -> BbsResult<()>;

    /// `GET /recent/<range>`
    async fn recent(&self, node: &NodeAddr, range: &Range) -> BbsResult<Vec<RecentEntry>>;
}

/// reqwest-backed client
pub struct HttpPeerClient {
    control: reqwest::Client,
    bulk: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(control_timeout: Duration, bulk_timeout: Duration) -> BbsResult<Self> {
        let build = |timeout| {
            reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| BbsError::Network(e.to_string()))
        };
        Ok(Self {
            control: build(control_timeout)?,
            bulk: build(bulk_timeout)?,
        })
    }

    async fn fetch(&self, client: &reqwest::Client, node: &NodeAddr, path: &str) -> BbsResult<String> {
        let url = format!("{}{}", node.base_url(), path);
        debug!(%url, "Outbound peer call");
        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| BbsError::Network(format!("{}: {}", node, e)))?
            .error_for_status()
            .map_err(|e| BbsError::Network(format!("{}: {}", node, e)))?;
        resp.text()
            .await
            .map_err(|e| BbsError::Network(format!("{}: {}", node, e)))
    }

    async fn control(&self, node: &NodeAddr, path: &str) -> BbsResult<String> {
        self.fetch(&self.control, node, path).await
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn ping(&self, node: &NodeAddr) -> BbsResult<String> {
        let body = self.control(node, "/ping").await?;
        let mut lines = body.lines();
        match (lines.next(), lines.next()) {
            (Some("PONG"), Some(ip)) if !ip.is_empty() => Ok(ip.to_string()),
            _ => Err(BbsError::Network(format!("{}: bad ping reply", node))),
        }
    }

    async fn node(&self, node: &NodeAddr) -> BbsResult<NodeAddr> {
        let body = self.control(node, "/node").await?;
        let line = body
            .lines()
            .next()
            .ok_or_else(|| BbsError::Network(format!("{}: empty node reply", node)))?;
        NodeAddr::parse(line)
    }

    async fn join(&self, node: &NodeAddr, myself: &NodeAddr) -> BbsResult<JoinReply> {
        let body = self
            .control(node, &format!("/join/{}", myself.to_wire()))
            .await?;
        let mut lines = body.lines();
        match lines.next() {
            Some("WELCOME") => Ok(JoinReply {
                welcome: true,
                suggestion: lines.next().and_then(|l| NodeAddr::parse(l).ok()),
            }),
            _ => Ok(JoinReply {
                welcome: false,
                suggestion: None,
            }),
        }
    }

    async fn bye(&self, node: &NodeAddr, myself: &NodeAddr) -> BbsResult<()> {
        self.control(node, &format!("/bye/{}", myself.to_wire()))
            .await?;
        Ok(())
    }

    async fn have(&self, node: &NodeAddr, topic: &str) -> BbsResult<bool> {
        let body = self.control(node, &format!("/have/{}", topic)).await?;
        Ok(body.lines().next() == Some("YES"))
    }

    async fn head(&self, node: &NodeAddr, topic: &str, range: &Range) -> BbsResult<Vec<Head>> {
        let body = self
            .control(node, &format!("/head/{}/{}", topic, range.to_path()))
            .await?;
        // A malformed line poisons only itself, not the batch
        Ok(body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| Head::from_wire(topic, l).ok())
            .collect())
    }

    async fn get(&self, node: &NodeAddr, topic: &str, range: &Range) -> BbsResult<Vec<Record>> {
        let body = self
            .fetch(
                &self.bulk,
                node,
                &format!("/get/{}/{}", topic, range.to_path()),
            )
            .await?;
        Ok(body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| Record::from_wire(topic, l).ok())
            .collect())
    }

    async fn update(
        &self,
        node: &NodeAddr,
        topic: &str,
        stamp: i64,
        id: &str,
        teller: &NodeAddr,
    ) -> BbsResult<()> {
        let body = self
            .control(
                node,
                &format!("/update/{}/{}/{}/{}", topic, stamp, id, teller.to_wire()),
            )
            .await?;
        if body.lines().next() == Some("OK") {
            Ok(())
        } else {
            Err(BbsError::Network(format!("{}: update not accepted", node)))
        }
    }

    async fn recent(&self, node: &NodeAddr, range: &Range) -> BbsResult<Vec<RecentEntry>> {
        let body = self
            .control(node, &format!("/recent/{}", range.to_path()))
            .await?;
        Ok(body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| RecentEntry::from_wire(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_entry_without_tags() {
        let entry = RecentEntry::from_wire("100<>ab12<>tea").unwrap();
        assert_eq!(entry.head, Head::new("tea", 100, "ab12"));
        assert!(entry.tags.is_empty());
        assert_eq!(entry.to_wire(), "100<>ab12<>tea");
    }

    #[test]
    fn test_recent_entry_with_tags() {
        let entry = RecentEntry::from_wire("100<>ab12<>tea<>tag:green sencha").unwrap();
        assert_eq!(entry.tags, vec!["green", "sencha"]);
        assert_eq!(entry.to_wire(), "100<>ab12<>tea<>tag:green sencha");
    }

    #[test]
    fn test_recent_entry_rejects_malformed() {
        assert!(RecentEntry::from_wire("").is_err());
        assert!(RecentEntry::from_wire("100<>ab12").is_err());
        assert!(RecentEntry::from_wire("x<>ab12<>tea").is_err());
        assert!(RecentEntry::from_wire("100<>not-hex!<>tea").is_err());
    }
}
