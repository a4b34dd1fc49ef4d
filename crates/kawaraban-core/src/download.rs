//! Per-topic download state machine
//!
//! For every known-or-advertised record id the manager tracks which peers
//! claim it, whether a fetch is in flight, and how often fetching failed.
//! A record moves Located -> Downloading -> Finished, or back to Located
//! with its failure count bumped; after five failures it is given up and
//! never requested again. The topic's manager deregisters itself once
//! every record is finished or given up.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::client::PeerClient;
use crate::node::NodeAddr;
use crate::record::Head;
use crate::registry::PeerRegistry;
use crate::spam::SpamFilter;
use crate::wire::Range;

/// Fetch attempts before a record is given up
const MAX_FAILS: u32 = 5;

/// Backlogs larger than this are split, oldest half first
const SPLIT_THRESHOLD: usize = 5;

/// Download state of one advertised record
#[derive(Debug)]
struct TargetRec {
    stamp: i64,
    id: String,
    candidates: HashSet<NodeAddr>,
    downloading: Option<NodeAddr>,
    finished: bool,
    fail_count: u32,
}

impl TargetRec {
    fn given_up(&self) -> bool {
        self.fail_count >= MAX_FAILS
    }

    fn eligible_for(&self, peer: &NodeAddr) -> bool {
        !self.finished
            && !self.given_up()
            && self.downloading.is_none()
            && self.candidates.contains(peer)
    }
}

/// Fetch state machine for one topic
pub struct DownloadManager {
    topic: String,
    targets: Mutex<HashMap<String, TargetRec>>,
}

impl DownloadManager {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Merge a peer's advertised heads into the candidate sets.
    /// Previously-unknown heads enter the Located state.
    pub fn set(&self, heads: &[Head], from: &NodeAddr) {
        let mut targets = self.targets.lock();
        for head in heads {
            targets
                .entry(head.idstr())
                .or_insert_with(|| TargetRec {
                    stamp: head.stamp,
                    id: head.id.clone(),
                    candidates: HashSet::new(),
                    downloading: None,
                    finished: false,
                    fail_count: 0,
                })
                .candidates
                .insert(from.clone());
        }
    }

    /// Select a contiguous stamp range of located records this peer
    /// claims and mark them in flight. Once the backlog exceeds
    /// [`SPLIT_THRESHOLD`] only the oldest half is taken, bounding request
    /// size while still progressing monotonically. `None` means nothing
    /// is eligible, which is also the completion signal for the caller.
    pub fn get(&self, peer: &NodeAddr) -> Option<(i64, i64)> {
        let mut targets = self.targets.lock();
        let mut eligible: Vec<(i64, String)> = targets
            .values()
            .filter(|t| t.eligible_for(peer))
            .map(|t| (t.stamp, t.id.clone()))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort();
        let take = if eligible.len() > SPLIT_THRESHOLD {
            eligible.len().div_ceil(2)
        } else {
            eligible.len()
        };
        let begin = eligible[0].0;
        let end = eligible[take - 1].0;
        for target in targets.values_mut() {
            if target.eligible_for(peer) && begin <= target.stamp && target.stamp <= end {
                target.downloading = Some(peer.clone());
            }
        }
        Some((begin, end))
    }

    /// Resolve this peer's in-flight records: success finishes them,
    /// failure bumps their count and releases them for other peers.
    pub fn finished(&self, peer: &NodeAddr, success: bool) {
        let mut targets = self.targets.lock();
        for target in targets.values_mut() {
            if target.downloading.as_ref() == Some(peer) {
                target.downloading = None;
                if success {
                    target.finished = true;
                } else {
                    target.fail_count += 1;
                    if target.given_up() {
                        debug!(topic = %self.topic, id = %target.id, "Record given up");
                    }
                }
            }
        }
    }

    /// A record arrived through some path; its target is done regardless
    /// of which peer was asked.
    pub fn mark_stored(&self, stamp: i64, id: &str) {
        if let Some(target) = self
            .targets
            .lock()
            .get_mut(&Head::new(&self.topic, stamp, id).idstr())
        {
            target.finished = true;
            target.downloading = None;
        }
    }

    /// Every record finished or given up
    pub fn complete(&self) -> bool {
        self.targets
            .lock()
            .values()
            .all(|t| t.finished || t.given_up())
    }

    /// Records still worth fetching
    pub fn outstanding(&self) -> usize {
        self.targets
            .lock()
            .values()
            .filter(|t| !t.finished && !t.given_up())
            .count()
    }
}

/// Drives download cycles for all topics
pub struct Downloader {
    client: Arc<dyn PeerClient>,
    registry: Arc<PeerRegistry>,
    store: Arc<CacheStore>,
    spam: Arc<SpamFilter>,
    managers: RwLock<HashMap<String, Arc<DownloadManager>>>,
    search_depth: usize,
    sync_range_secs: i64,
}

impl Downloader {
    pub fn new(
        client: Arc<dyn PeerClient>,
        registry: Arc<PeerRegistry>,
        store: Arc<CacheStore>,
        spam: Arc<SpamFilter>,
        search_depth: usize,
        sync_range_secs: i64,
    ) -> Self {
        Self {
            client,
            registry,
            store,
            spam,
            managers: RwLock::new(HashMap::new()),
            search_depth,
            sync_range_secs,
        }
    }

    fn manager(&self, topic: &str) -> Arc<DownloadManager> {
        self.managers
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(DownloadManager::new(topic)))
            .clone()
    }

    /// Topics with an active (incomplete) manager, for the sweep timer
    pub fn active_topics(&self) -> Vec<String> {
        self.managers.read().keys().cloned().collect()
    }

    /// One full download cycle for a topic: fan out for advertised heads,
    /// then pull manager-selected sub-ranges from each claiming peer,
    /// validating every line before it is stored. Returns true iff at
    /// least one new record was stored.
    pub async fn get_cache(&self, topic: &str) -> bool {
        let mut peers = self.registry.list(topic);
        if peers.is_empty() {
            if let Some(found) = self.registry.search(topic, &[]).await {
                peers.push(found);
            }
        }
        peers.truncate(self.search_depth);
        if peers.is_empty() {
            debug!(topic, "No contributor found");
            return false;
        }

        let cache = self.store.get_or_create(topic);
        let manager = self.manager(topic);

        // Phase 1: ask everyone what they hold, slightly behind our newest
        // stamp so stragglers are not missed.
        let begin = (cache.read().newest_stamp() - self.sync_range_secs).max(0);
        let head_range = Range::Since(begin);
        let fetches = peers.iter().map(|peer| {
            let client = self.client.clone();
            let peer = peer.clone();
            let range = head_range.clone();
            let topic = topic.to_string();
            async move { (peer.clone(), client.head(&peer, &topic, &range).await) }
        });
        for (peer, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(heads) => {
                    let unknown: Vec<Head> = heads
                        .into_iter()
                        .filter(|h| !cache.read().contains(h.stamp, &h.id))
                        .collect();
                    manager.set(&unknown, &peer);
                }
                Err(e) => {
                    warn!(%peer, topic, error = %e, "Head fetch failed, pruning peer");
                    self.registry.remove(topic, &peer);
                }
            }
        }

        // Phase 2: pull sub-ranges until each peer has nothing eligible.
        let stored_any = AtomicBool::new(false);
        let pulls = peers.iter().map(|peer| {
            let peer = peer.clone();
            let manager = manager.clone();
            let topic = topic.to_string();
            let stored_any = &stored_any;
            async move {
                while let Some((begin, end)) = manager.get(&peer) {
                    let range = Range::Between(begin, end);
                    match self.client.get(&peer, &topic, &range).await {
                        Ok(records) => {
                            for record in records {
                                if !record.meets(&range) {
                                    debug!(topic = %topic, "Record failed validation");
                                    continue;
                                }
                                if self.spam.is_spam(&record) {
                                    let _ = self.store.purge_record(&record.head);
                                    continue;
                                }
                                match self.store.add_record(&record) {
                                    Ok(true) => {
                                        stored_any.store(true, Ordering::Relaxed);
                                        manager.mark_stored(record.head.stamp, &record.head.id);
                                    }
                                    Ok(false) => {
                                        manager.mark_stored(record.head.stamp, &record.head.id);
                                    }
                                    Err(e) => warn!(error = %e, "Failed to store record"),
                                }
                            }
                            manager.finished(&peer, true);
                        }
                        Err(e) => {
                            warn!(%peer, topic = %topic, error = %e, "Bulk get failed");
                            manager.finished(&peer, false);
                            self.registry.remove(&topic, &peer);
                            break;
                        }
                    }
                }
            }
        });
        futures::future::join_all(pulls).await;

        if manager.complete() {
            self.managers.write().remove(topic);
            debug!(topic, "Download manager complete, deregistered");
        }
        stored_any.load(Ordering::Relaxed)
    }
}
