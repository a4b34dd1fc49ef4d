//! Peer registry: bounded peer tables and the join/bye/ping/search protocol
//!
//! One table maps each topic to a bounded contributor list; the empty
//! topic key is the bounded global list. Peers enter a table only after
//! passing the address filter, and every network failure is resolved the
//! same way: log it and prune the unreachable peer. No error from here
//! ever reaches a caller.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::client::PeerClient;
use crate::config::Config;
use crate::error::BbsResult;
use crate::node::{NodeAddr, NodeFilter};
use crate::storage::Storage;

/// Table key of the global peer list
const GLOBAL: &str = "";

/// Bounded global peer list plus bounded per-topic contributor lists
pub struct PeerRegistry {
    tables: RwLock<HashMap<String, Vec<NodeAddr>>>,
    dirty: AtomicBool,
    storage: Storage,
    filter: NodeFilter,
    client: Arc<dyn PeerClient>,
    myself: RwLock<Option<NodeAddr>>,
    isolated: AtomicBool,
    default_nodes: usize,
    share_nodes: usize,
    search_depth: usize,
    join_retry: usize,
    port: u16,
    server_path: String,
}

impl PeerRegistry {
    pub fn new(storage: Storage, client: Arc<dyn PeerClient>, config: &Config) -> BbsResult<Self> {
        let filter = NodeFilter::new(&config.allow_nodes, &config.deny_nodes)?;
        let tables = storage.load_peer_tables()?;
        let myself = match &config.advertised_addr {
            Some(addr) => Some(NodeAddr::parse(addr)?),
            None => None,
        };
        Ok(Self {
            tables: RwLock::new(tables),
            dirty: AtomicBool::new(false),
            storage,
            filter,
            client,
            myself: RwLock::new(myself),
            isolated: AtomicBool::new(false),
            default_nodes: config.default_nodes,
            share_nodes: config.share_nodes,
            search_depth: config.search_depth,
            join_retry: config.join_retry,
            port: config.port,
            server_path: config.server_path.clone(),
        })
    }

    /// Our externally visible address, once known
    pub fn myself(&self) -> Option<NodeAddr> {
        self.myself.read().clone()
    }

    /// Whether bootstrap failed to reach anyone
    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::Relaxed)
    }

    /// The global peer list
    pub fn global(&self) -> Vec<NodeAddr> {
        self.list(GLOBAL)
    }

    /// Contributor list of a topic (or the global list for "")
    pub fn list(&self, topic: &str) -> Vec<NodeAddr> {
        self.tables
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the address filter (and the not-ourselves rule) would let
    /// this node into a table at all
    pub fn accepts(&self, node: &NodeAddr) -> bool {
        self.filter.accepts(node) && self.myself().as_ref() != Some(node)
    }

    /// Whether a table is at its cap
    pub fn is_full(&self, topic: &str) -> bool {
        self.list(topic).len() >= self.cap(topic)
    }

    fn cap(&self, topic: &str) -> usize {
        if topic == GLOBAL {
            self.default_nodes
        } else {
            self.share_nodes
        }
    }

    /// Bounded, filtered insert. Returns false when the node was refused
    /// (filtered, ourselves, already present, or the list is full).
    pub fn append(&self, topic: &str, node: &NodeAddr) -> bool {
        if !self.filter.accepts(node) || self.myself().as_ref() == Some(node) {
            return false;
        }
        let mut tables = self.tables.write();
        let list = tables.entry(topic.to_string()).or_default();
        if list.contains(node) || list.len() >= self.cap(topic) {
            return false;
        }
        list.push(node.clone());
        self.dirty.store(true, Ordering::Relaxed);
        true
    }

    /// Remove a node from one table.
    pub fn remove(&self, topic: &str, node: &NodeAddr) {
        let mut tables = self.tables.write();
        if let Some(list) = tables.get_mut(topic) {
            let before = list.len();
            list.retain(|n| n != node);
            if list.len() != before {
                self.dirty.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Remove a node from every table it appears in.
    pub fn purge(&self, node: &NodeAddr) {
        let mut tables = self.tables.write();
        let mut changed = false;
        for list in tables.values_mut() {
            let before = list.len();
            list.retain(|n| n != node);
            changed |= list.len() != before;
        }
        if changed {
            self.dirty.store(true, Ordering::Relaxed);
            debug!(%node, "Peer purged from all tables");
        }
    }

    /// Uniform sample of up to n distinct known peers not in `exclude`.
    /// This is the gossip fan-out primitive.
    pub fn random(&self, exclude: &[NodeAddr], n: usize) -> Vec<NodeAddr> {
        let myself = self.myself();
        let mut seen = HashSet::new();
        let mut pool: Vec<NodeAddr> = Vec::new();
        for list in self.tables.read().values() {
            for node in list {
                if exclude.contains(node) || myself.as_ref() == Some(node) {
                    continue;
                }
                if seen.insert(node.clone()) {
                    pool.push(node.clone());
                }
            }
        }
        pool.shuffle(&mut rand::rng());
        pool.truncate(n);
        pool
    }

    /// Bootstrap: concurrently ping the seed candidates, learn our own
    /// address from the first responder, and join it. Marks the node
    /// isolated when nobody answers.
    pub async fn initialize(&self, seeds: &[NodeAddr]) {
        let candidates: Vec<NodeAddr> = seeds.iter().take(self.search_depth).cloned().collect();
        let pings = candidates.iter().map(|node| {
            let client = self.client.clone();
            let node = node.clone();
            async move { (node.clone(), client.ping(&node).await) }
        });
        let results = futures::future::join_all(pings).await;

        let mut joined_any = false;
        for (node, result) in results {
            match result {
                Ok(observed_ip) => {
                    self.learn_self(&observed_ip);
                    self.join(&node).await;
                    joined_any = true;
                    break;
                }
                Err(e) => debug!(%node, error = %e, "Seed did not answer ping"),
            }
        }

        if !joined_any || self.global().is_empty() {
            warn!("No seed reachable, running isolated");
            self.isolated.store(true, Ordering::Relaxed);
        } else {
            info!(peers = self.global().len(), "Bootstrap complete");
        }
    }

    /// Compose our advertised address from an observed IP, unless one was
    /// configured explicitly.
    pub fn learn_self(&self, observed_ip: &str) {
        let mut myself = self.myself.write();
        if myself.is_some() {
            return;
        }
        let addr = format!("{}:{}{}", observed_ip, self.port, self.server_path);
        match NodeAddr::parse(&addr) {
            Ok(node) => {
                info!(%node, "Learned own address");
                *myself = Some(node);
            }
            Err(e) => warn!(addr, error = %e, "Observed address unusable"),
        }
    }

    /// Send a join request; follow a suggestion chain for a bounded number
    /// of hops. A rejected or unreachable node is purged.
    pub async fn join(&self, node: &NodeAddr) {
        let Some(myself) = self.myself() else {
            debug!("Own address unknown, cannot join");
            return;
        };
        let mut target = node.clone();
        for _ in 0..=self.join_retry {
            if target == myself {
                return;
            }
            match self.client.join(&target, &myself).await {
                Ok(reply) if reply.welcome => {
                    self.append(GLOBAL, &target);
                    info!(node = %target, "Joined peer");
                    match reply.suggestion {
                        Some(next) if next != target => target = next,
                        _ => return,
                    }
                }
                Ok(_) => {
                    debug!(node = %target, "Join rejected");
                    self.purge(&target);
                    return;
                }
                Err(e) => {
                    warn!(node = %target, error = %e, "Join failed");
                    self.purge(&target);
                    return;
                }
            }
        }
    }

    /// Churn repair: ping every known peer missing from the global list;
    /// join responders, purge the rest. Drives the global list back toward
    /// its cap over time.
    pub async fn rejoin(&self) {
        let global: HashSet<NodeAddr> = self.global().into_iter().collect();
        let known = self.random(&[], usize::MAX);
        for node in known {
            if self.global().len() >= self.default_nodes {
                break;
            }
            if global.contains(&node) {
                continue;
            }
            match self.client.ping(&node).await {
                Ok(_) => self.join(&node).await,
                Err(e) => {
                    warn!(%node, error = %e, "Peer unreachable, purging");
                    self.purge(&node);
                }
            }
        }
    }

    /// Ask a bounded, shuffled peer sample whether anyone has the topic.
    /// The first YES becomes a recorded contributor; NO-answerers and
    /// non-responders are dropped from the topic's table.
    pub async fn search(&self, topic: &str, hints: &[NodeAddr]) -> Option<NodeAddr> {
        let myself = self.myself();
        let mut candidates: Vec<NodeAddr> = Vec::new();
        let mut seen = HashSet::new();
        for node in hints
            .iter()
            .cloned()
            .chain(self.list(topic))
            .chain(self.random(&[], self.search_depth))
        {
            if myself.as_ref() == Some(&node) {
                continue;
            }
            if seen.insert(node.clone()) {
                candidates.push(node);
            }
        }
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(self.search_depth);

        for node in candidates {
            match self.client.have(&node, topic).await {
                Ok(true) => {
                    self.append(topic, &node);
                    debug!(%node, topic, "Topic contributor found");
                    return Some(node);
                }
                Ok(false) => self.remove(topic, &node),
                Err(e) => {
                    debug!(%node, topic, error = %e, "Search probe failed");
                    self.remove(topic, &node);
                }
            }
        }
        None
    }

    /// Broadcast an update notice to topic contributors, global peers and
    /// a random sample, best effort. Individual send failures are ignored.
    pub async fn tell_update(&self, topic: &str, stamp: i64, id: &str, teller: &NodeAddr) {
        let mut targets: Vec<NodeAddr> = Vec::new();
        let mut seen = HashSet::new();
        for node in self
            .list(topic)
            .into_iter()
            .chain(self.global())
            .chain(self.random(&[], self.share_nodes))
        {
            if &node == teller || self.myself().as_ref() == Some(&node) {
                continue;
            }
            if seen.insert(node.clone()) {
                targets.push(node);
            }
        }

        let sends = targets.into_iter().map(|node| {
            let client = self.client.clone();
            let topic = topic.to_string();
            let id = id.to_string();
            let teller = teller.clone();
            async move {
                if let Err(e) = client.update(&node, &topic, stamp, &id, &teller).await {
                    debug!(%node, topic, error = %e, "Update notice not delivered");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// Persist the tables if anything changed since the last sync.
    pub fn sync(&self) -> BbsResult<()> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let snapshot = self.tables.read().clone();
        self.storage.save_peer_tables(&snapshot)
    }
}
