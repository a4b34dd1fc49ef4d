//! Engine assembly and the consumer surface
//!
//! [`BbsEngine`] wires storage, peer registry, topic caches, recent list,
//! tag tables, downloader and update queue together, and exposes the
//! operations a front end needs: list and fetch topics, post and remove
//! records, manage tags. The wire protocol server and the maintenance
//! scheduler both run against an `Arc<BbsEngine>`.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{CacheStore, TopicStats};
use crate::client::{HttpPeerClient, PeerClient};
use crate::config::Config;
use crate::download::Downloader;
use crate::error::{BbsError, BbsResult};
use crate::node::NodeAddr;
use crate::recent::RecentList;
use crate::record::{Head, Record};
use crate::registry::PeerRegistry;
use crate::scheduler;
use crate::spam::SpamFilter;
use crate::storage::Storage;
use crate::tags::{SuggestTags, Tag, UserTags};
use crate::updates::{UpdateOutcome, UpdateQueue};
use crate::wire::Range;

/// One running node, minus the HTTP listener
pub struct BbsEngine {
    pub config: Config,
    pub registry: Arc<PeerRegistry>,
    pub store: Arc<CacheStore>,
    pub recent: Arc<RecentList>,
    pub suggest: Arc<SuggestTags>,
    pub user_tags: Arc<UserTags>,
    pub downloader: Arc<Downloader>,
    pub updates: Arc<UpdateQueue>,
    client: Arc<dyn PeerClient>,
    spam: Arc<SpamFilter>,
}

impl BbsEngine {
    /// Assemble an engine with the HTTP peer client.
    pub fn new(config: Config) -> BbsResult<Self> {
        let client: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(
            config.control_timeout,
            config.bulk_timeout,
        )?);
        Self::with_client(config, client)
    }

    /// Assemble an engine around an arbitrary peer client.
    pub fn with_client(config: Config, client: Arc<dyn PeerClient>) -> BbsResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = Storage::new(config.db_path())?;

        let spam = Arc::new(match &config.spam_rules {
            Some(path) => SpamFilter::load(path, config.record_limit_kb)?,
            None => SpamFilter::new(config.record_limit_kb),
        });

        let registry = Arc::new(PeerRegistry::new(storage.clone(), client.clone(), &config)?);
        let store = Arc::new(CacheStore::new(
            storage.clone(),
            config.tombstone_grace_secs,
        )?);
        let recent = Arc::new(RecentList::new(storage.clone(), config.recent_range_secs)?);
        let suggest = Arc::new(SuggestTags::new(storage.clone(), config.tag_size)?);
        let user_tags = Arc::new(UserTags::new(storage));

        let downloader = Arc::new(Downloader::new(
            client.clone(),
            registry.clone(),
            store.clone(),
            spam.clone(),
            config.search_depth,
            config.sync_range_secs,
        ));
        let updates = Arc::new(UpdateQueue::new(
            client.clone(),
            registry.clone(),
            store.clone(),
            recent.clone(),
            spam.clone(),
            config.update_dedup_secs,
            config.confirm_wait,
            config.rebroadcast_delay,
        ));

        Ok(Self {
            config,
            registry,
            store,
            recent,
            suggest,
            user_tags,
            downloader,
            updates,
            client,
            spam,
        })
    }

    /// Bootstrap into the swarm and start the maintenance timers.
    pub async fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let seeds: Vec<NodeAddr> = self
            .config
            .seeds
            .iter()
            .filter_map(|s| match NodeAddr::parse(s) {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!(seed = %s, error = %e, "Seed address unusable");
                    None
                }
            })
            .collect();
        self.registry.initialize(&seeds).await;
        scheduler::spawn_maintenance(self.clone())
    }

    /// Announce departure to the global peers and persist pending state.
    pub async fn shutdown(&self) {
        if let Some(myself) = self.registry.myself() {
            for node in self.registry.global() {
                if let Err(e) = self.client.bye(&node, &myself).await {
                    warn!(%node, error = %e, "Bye not delivered");
                }
            }
        }
        if let Err(e) = self.registry.sync() {
            warn!(error = %e, "Peer tables not persisted");
        }
        if let Err(e) = self.recent.sync(chrono::Utc::now().timestamp()) {
            warn!(error = %e, "Recent list not persisted");
        }
    }

    /// The peer client this engine talks through
    pub fn client(&self) -> &Arc<dyn PeerClient> {
        &self.client
    }

    /// Topics held locally
    pub fn topics(&self) -> Vec<String> {
        self.store.topics()
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.store.exists(topic)
    }

    /// Derived stats of a topic (count, size, newest stamp, velocity)
    pub fn stats(&self, topic: &str) -> Option<TopicStats> {
        self.store.stats(topic)
    }

    /// Records of a topic inside a range, oldest first
    pub fn list_records(&self, topic: &str, range: &Range) -> Vec<Record> {
        match self.store.get(topic) {
            Some(cache) => cache.read().records_in(range),
            None => Vec::new(),
        }
    }

    /// Refresh a topic from the swarm.
    ///
    /// With `block` set the call waits for the full download cycle and
    /// reports whether anything new arrived. Without it, a topic that
    /// already has local records waits only up to a short time cap, so a
    /// reader gets stale content after the cap instead of a hanging page.
    pub async fn fetch_topic(&self, topic: &str, block: bool) -> bool {
        let has_local = self
            .store
            .get(topic)
            .map(|c| c.read().stats().count > 0)
            .unwrap_or(false);
        if block || !has_local {
            return self.downloader.get_cache(topic).await;
        }
        let cap = self.config.background_fetch_cap;
        match tokio::time::timeout(cap, self.downloader.get_cache(topic)).await {
            Ok(stored) => stored,
            Err(_) => {
                info!(topic, "Topic refresh hit its time cap");
                false
            }
        }
    }

    /// Post a record: build it (signed when a passphrase is given), store
    /// it and announce it to the swarm.
    pub async fn post(
        self: &Arc<Self>,
        topic: &str,
        fields: Vec<(String, String)>,
        passphrase: &str,
    ) -> BbsResult<Head> {
        let stamp = chrono::Utc::now().timestamp();
        let record = Record::build(topic, stamp, fields, passphrase)?;
        if self.spam.is_spam(&record) {
            return Err(BbsError::InvalidRecord("rejected by spam filter".to_string()));
        }
        self.store.add_record(&record)?;
        self.recent.append(&record.head);
        info!(topic, stamp, id = %record.head.id, "Record posted");
        self.updates.update_nodes(&record.head, None).await;
        Ok(record.head)
    }

    /// Soft-delete a local record.
    pub fn remove_record(&self, head: &Head) -> BbsResult<()> {
        self.store.remove_record(head)
    }

    /// Handle an inbound update notice, off the request path.
    pub async fn handle_update(self: &Arc<Self>, head: Head, teller: NodeAddr) {
        let outcome = self.updates.update_nodes(&head, Some(teller)).await;
        if outcome == UpdateOutcome::Spam {
            warn!(topic = %head.topic, id = %head.id, "Update absorbed as spam");
        }
    }

    /// Tags of a topic: the user's own plus swarm suggestions.
    pub fn tags(&self, topic: &str) -> BbsResult<(Vec<String>, Vec<Tag>)> {
        Ok((self.user_tags.get(topic)?, self.suggest.get(topic)))
    }

    /// Replace the user tags of a topic.
    pub fn set_tags(&self, topic: &str, tags: &[String]) -> BbsResult<()> {
        self.user_tags.set(topic, tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{JoinReply, RecentEntry};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Peer for which every call fails; the engine must stay usable offline
    struct DeadPeer;

    #[async_trait]
    impl PeerClient for DeadPeer {
        async fn ping(&self, _: &NodeAddr) -> BbsResult<String> {
            Err(BbsError::Network("dead".to_string()))
        }
        async fn node(&self, _: &NodeAddr) -> BbsResult<NodeAddr> {
            Err(BbsError::Network("dead".to_string()))
        }
        async fn join(&self, _: &NodeAddr, _: &NodeAddr) -> BbsResult<JoinReply> {
            Err(BbsError::Network("dead".to_string()))
        }
        async fn bye(&self, _: &NodeAddr, _: &NodeAddr) -> BbsResult<()> {
            Err(BbsError::Network("dead".to_string()))
        }
        async fn have(&self, _: &NodeAddr, _: &str) -> BbsResult<bool> {
            Err(BbsError::Network("dead".to_string()))
        }
        async fn head(&self, _: &NodeAddr, _: &str, _: &Range) -> BbsResult<Vec<Head>> {
            Err(BbsError::Network("dead".to_string()))
        }
        async fn get(&self, _: &NodeAddr, _: &str, _: &Range) -> BbsResult<Vec<Record>> {
            Err(BbsError::Network("dead".to_string()))
        }
        async fn update(
            &self,
            _: &NodeAddr,
            _: &str,
            _: i64,
            _: &str,
            _: &NodeAddr,
        ) -> BbsResult<()> {
            Err(BbsError::Network("dead".to_string()))
        }
        async fn recent(&self, _: &NodeAddr, _: &Range) -> BbsResult<Vec<RecentEntry>> {
            Err(BbsError::Network("dead".to_string()))
        }
    }

    fn offline_engine() -> (Arc<BbsEngine>, TempDir) {
        let temp = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp.path().to_path_buf(),
            advertised_addr: Some("self.example:8000/server".to_string()),
            ..Config::default()
        };
        let engine = BbsEngine::with_client(config, Arc::new(DeadPeer)).unwrap();
        (Arc::new(engine), temp)
    }

    #[tokio::test]
    async fn test_post_stores_and_lists() {
        let (engine, _temp) = offline_engine();
        let head = engine
            .post("tea", vec![("body".to_string(), "hello".to_string())], "")
            .await
            .unwrap();

        assert!(engine.topic_exists("tea"));
        let records = engine.list_records("tea", &Range::All);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].head, head);
        assert_eq!(engine.recent.newest("tea"), Some(head.stamp));
    }

    #[tokio::test]
    async fn test_post_signed_record_verifies() {
        let (engine, _temp) = offline_engine();
        engine
            .post(
                "tea",
                vec![("body".to_string(), "signed".to_string())],
                "correct horse battery",
            )
            .await
            .unwrap();

        let records = engine.list_records("tea", &Range::All);
        assert!(records[0].get("pubkey").is_some());
        assert!(records[0].verify());
    }

    #[tokio::test]
    async fn test_post_rejects_oversize() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp.path().to_path_buf(),
            record_limit_kb: 1,
            ..Config::default()
        };
        let engine = Arc::new(BbsEngine::with_client(config, Arc::new(DeadPeer)).unwrap());

        let big = "x".repeat(2048);
        let result = engine
            .post("tea", vec![("body".to_string(), big)], "")
            .await;
        assert!(result.is_err());
        assert!(engine.list_records("tea", &Range::All).is_empty());
    }

    #[tokio::test]
    async fn test_remove_record_soft_deletes() {
        let (engine, _temp) = offline_engine();
        let head = engine
            .post("tea", vec![("body".to_string(), "gone".to_string())], "")
            .await
            .unwrap();
        engine.remove_record(&head).unwrap();
        assert!(engine.list_records("tea", &Range::All).is_empty());
    }

    #[tokio::test]
    async fn test_fetch_unknown_topic_fails_offline() {
        let (engine, _temp) = offline_engine();
        assert!(!engine.fetch_topic("absent", true).await);
    }

    #[tokio::test]
    async fn test_tags_round_trip() {
        let (engine, _temp) = offline_engine();
        engine
            .set_tags("tea", &["green".to_string(), "sencha".to_string()])
            .unwrap();
        let (user, suggested) = engine.tags("tea").unwrap();
        assert_eq!(user, vec!["green", "sencha"]);
        assert!(suggested.is_empty());
    }
}
