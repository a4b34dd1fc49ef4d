//! Rolling window of recently-seen record heads
//!
//! The recent list is what the swarm gossips instead of full content: the
//! head tuples of whatever was posted lately, deduplicated by
//! (stamp, id, topic) and purged once older than the retention window.
//! Refreshing it also feeds the suggested-tag table and records informing
//! peers as topic contributors.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::client::PeerClient;
use crate::error::BbsResult;
use crate::record::Head;
use crate::registry::PeerRegistry;
use crate::storage::Storage;
use crate::tags::SuggestTags;
use crate::wire::Range;

/// Process-wide rolling window of recently-seen heads
pub struct RecentList {
    heads: RwLock<HashSet<Head>>,
    dirty: AtomicBool,
    storage: Storage,
    retention_secs: i64,
}

impl RecentList {
    pub fn new(storage: Storage, retention_secs: i64) -> BbsResult<Self> {
        let heads = storage.load_recent()?.into_iter().collect();
        Ok(Self {
            heads: RwLock::new(heads),
            dirty: AtomicBool::new(false),
            storage,
            retention_secs,
        })
    }

    /// Insert a head unless already present. Returns true when new.
    pub fn append(&self, head: &Head) -> bool {
        let inserted = self.heads.write().insert(head.clone());
        if inserted {
            self.dirty.store(true, Ordering::Relaxed);
        }
        inserted
    }

    /// Newest stamp seen for a topic, if any
    pub fn newest(&self, topic: &str) -> Option<i64> {
        self.heads
            .read()
            .iter()
            .filter(|h| h.topic == topic)
            .map(|h| h.stamp)
            .max()
    }

    /// Topics currently referenced by the window
    pub fn topics(&self) -> HashSet<String> {
        self.heads.read().iter().map(|h| h.topic.clone()).collect()
    }

    /// Heads inside a range, for the `/recent` responder
    pub fn heads_in(&self, range: &Range) -> Vec<Head> {
        let mut heads: Vec<Head> = self
            .heads
            .read()
            .iter()
            .filter(|h| range.contains(h.stamp, &h.id))
            .cloned()
            .collect();
        heads.sort_by(|a, b| (a.stamp, &a.id).cmp(&(b.stamp, &b.id)));
        heads
    }

    /// Purge entries past the retention window and persist if changed.
    pub fn sync(&self, now: i64) -> BbsResult<()> {
        let cutoff = now - self.retention_secs;
        {
            let mut heads = self.heads.write();
            let before = heads.len();
            heads.retain(|h| h.stamp >= cutoff);
            if heads.len() != before {
                self.dirty.store(true, Ordering::Relaxed);
            }
        }
        if self.dirty.swap(false, Ordering::Relaxed) {
            let snapshot: Vec<Head> = self.heads.read().iter().cloned().collect();
            self.storage.replace_recent(&snapshot)?;
        }
        Ok(())
    }

    /// Refresh from the swarm: query a random peer sample for heads since
    /// the window start, merge the results, feed tag hints (shuffled then
    /// truncated so verbose peers carry no extra weight) into the
    /// suggested tags, and record each informer as a topic contributor.
    pub async fn get_all(
        &self,
        registry: &PeerRegistry,
        client: &Arc<dyn PeerClient>,
        suggest: &SuggestTags,
        sample_n: usize,
        tag_size: usize,
        now: i64,
    ) {
        let range = Range::Since(now - self.retention_secs);
        let peers = registry.random(&[], sample_n);
        let queries = peers.into_iter().map(|node| {
            let client = client.clone();
            let range = range.clone();
            async move { (node.clone(), client.recent(&node, &range).await) }
        });

        for (node, result) in futures::future::join_all(queries).await {
            match result {
                Ok(entries) => {
                    for entry in entries {
                        self.append(&entry.head);
                        let mut hints = entry.tags;
                        hints.shuffle(&mut rand::rng());
                        hints.truncate(tag_size);
                        suggest.add_hints(&entry.head.topic, &hints);
                        registry.append(&entry.head.topic, &node);
                    }
                }
                Err(e) => {
                    debug!(%node, error = %e, "Recent query failed, pruning peer");
                    registry.purge(&node);
                }
            }
        }
    }
}
