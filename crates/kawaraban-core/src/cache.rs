//! Per-topic record caches
//!
//! A [`TopicCache`] holds the records of one topic ordered by stamp, with
//! derived stats (count, size, newest stamp, velocity) recomputed on every
//! mutation and again on each maintenance cycle, so the velocity window
//! stays fresh even for quiet topics.
//! [`CacheStore`] owns all topic caches on top of storage and implements
//! soft deletion: removed records become tombstones for a grace period
//! before they are physically purged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::BbsResult;
use crate::record::{Head, Record};
use crate::storage::Storage;
use crate::wire::Range;

/// Window for the velocity computation, seconds
const VELOCITY_WINDOW_SECS: i64 = 7 * 24 * 3600;

/// Derived per-topic statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TopicStats {
    pub count: usize,
    pub total_size: usize,
    pub newest_stamp: i64,
    /// New records per day over the last week, used for ranking
    pub velocity: f64,
}

/// Records of one topic, ordered by (stamp, id)
pub struct TopicCache {
    topic: String,
    records: BTreeMap<(i64, String), Record>,
    stats: TopicStats,
}

impl TopicCache {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            records: BTreeMap::new(),
            stats: TopicStats::default(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn contains(&self, stamp: i64, id: &str) -> bool {
        self.records.contains_key(&(stamp, id.to_string()))
    }

    pub fn stats(&self) -> TopicStats {
        self.stats
    }

    pub fn newest_stamp(&self) -> i64 {
        self.records
            .keys()
            .next_back()
            .map(|(stamp, _)| *stamp)
            .unwrap_or(0)
    }

    fn insert(&mut self, record: Record) -> bool {
        let key = (record.head.stamp, record.head.id.clone());
        self.records.insert(key, record).is_none()
    }

    fn remove(&mut self, stamp: i64, id: &str) -> Option<Record> {
        self.records.remove(&(stamp, id.to_string()))
    }

    /// Records inside a range, deleted ones excluded
    pub fn records_in(&self, range: &Range) -> Vec<Record> {
        self.records
            .values()
            .filter(|r| !r.deleted && range.contains(r.head.stamp, &r.head.id))
            .cloned()
            .collect()
    }

    /// Heads inside a range, deleted ones excluded
    pub fn heads_in(&self, range: &Range) -> Vec<Head> {
        self.records
            .values()
            .filter(|r| !r.deleted && range.contains(r.head.stamp, &r.head.id))
            .map(|r| r.head.clone())
            .collect()
    }

    fn recompute_stats(&mut self, now: i64) {
        let live: Vec<&Record> = self.records.values().filter(|r| !r.deleted).collect();
        let since = now - VELOCITY_WINDOW_SECS;
        let fresh = live.iter().filter(|r| r.head.stamp >= since).count();
        self.stats = TopicStats {
            count: live.len(),
            total_size: live.iter().map(|r| r.len_bytes()).sum(),
            newest_stamp: self.newest_stamp(),
            velocity: fresh as f64 / (VELOCITY_WINDOW_SECS as f64 / 86_400.0),
        };
    }
}

/// All topic caches on top of storage
pub struct CacheStore {
    storage: Storage,
    caches: RwLock<HashMap<String, Arc<RwLock<TopicCache>>>>,
    tombstone_grace_secs: i64,
}

impl CacheStore {
    /// Load every stored topic into memory.
    pub fn new(storage: Storage, tombstone_grace_secs: i64) -> BbsResult<Self> {
        let mut caches = HashMap::new();
        for topic in storage.topics()? {
            let mut cache = TopicCache::new(&topic);
            for record in storage.load_topic(&topic)? {
                cache.insert(record);
            }
            cache.recompute_stats(chrono::Utc::now().timestamp());
            caches.insert(topic, Arc::new(RwLock::new(cache)));
        }
        Ok(Self {
            storage,
            caches: RwLock::new(caches),
            tombstone_grace_secs,
        })
    }

    /// Whether a topic exists locally (has a cache, possibly empty)
    pub fn exists(&self, topic: &str) -> bool {
        self.caches.read().contains_key(topic)
    }

    pub fn get(&self, topic: &str) -> Option<Arc<RwLock<TopicCache>>> {
        self.caches.read().get(topic).cloned()
    }

    pub fn get_or_create(&self, topic: &str) -> Arc<RwLock<TopicCache>> {
        self.caches
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(TopicCache::new(topic))))
            .clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    /// Store a validated record. Returns false when it was already present
    /// or tombstoned (a tombstoned record is never resurrected).
    pub fn add_record(&self, record: &Record) -> BbsResult<bool> {
        if self.storage.is_tombstoned(&record.head)? {
            return Ok(false);
        }
        let cache = self.get_or_create(&record.head.topic);
        let inserted = {
            let mut cache = cache.write();
            let inserted = cache.insert(record.clone());
            if inserted {
                cache.recompute_stats(chrono::Utc::now().timestamp());
            }
            inserted
        };
        if inserted {
            self.storage.save_record(record)?;
        }
        Ok(inserted)
    }

    /// Soft-delete a record: it leaves the cache immediately but stays in
    /// the tombstone table for the grace period.
    pub fn remove_record(&self, head: &Head) -> BbsResult<()> {
        let Some(cache) = self.get(&head.topic) else {
            return Ok(());
        };
        let removed = {
            let mut cache = cache.write();
            let removed = cache.remove(head.stamp, &head.id);
            if removed.is_some() {
                cache.recompute_stats(chrono::Utc::now().timestamp());
            }
            removed
        };
        if let Some(mut record) = removed {
            record.deleted = true;
            self.storage
                .save_tombstone(&record, chrono::Utc::now().timestamp())?;
            debug!(topic = %head.topic, id = %head.id, "Record tombstoned");
        }
        Ok(())
    }

    /// Delete a spam or oversize record outright, bypassing the grace
    /// period, including any stored copy.
    pub fn purge_record(&self, head: &Head) -> BbsResult<()> {
        if let Some(cache) = self.get(&head.topic) {
            let mut cache = cache.write();
            if cache.remove(head.stamp, &head.id).is_some() {
                cache.recompute_stats(chrono::Utc::now().timestamp());
            }
        }
        self.storage.delete_record(head)?;
        Ok(())
    }

    /// Maintenance: drop tombstones past their grace period and recompute
    /// every topic's derived stats.
    pub fn cleanup(&self, now: i64) -> BbsResult<()> {
        let cutoff = now - self.tombstone_grace_secs;
        for head in self.storage.expired_tombstones(cutoff)? {
            self.storage.delete_tombstone(&head)?;
            debug!(topic = %head.topic, id = %head.id, "Tombstone expired");
        }
        for cache in self.caches.read().values() {
            cache.write().recompute_stats(now);
        }
        Ok(())
    }

    /// Derived stats of a topic
    pub fn stats(&self, topic: &str) -> Option<TopicStats> {
        self.get(topic).map(|c| c.read().stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (CacheStore, Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        let store = CacheStore::new(storage.clone(), 3600).unwrap();
        (store, storage, temp_dir)
    }

    fn sample_record(topic: &str, stamp: i64, body: &str) -> Record {
        Record::build(topic, stamp, vec![("body".to_string(), body.to_string())], "").unwrap()
    }

    #[test]
    fn test_add_record_deduplicates() {
        let (store, _, _temp) = create_test_store();
        let rec = sample_record("tea", 100, "hi");
        assert!(store.add_record(&rec).unwrap());
        assert!(!store.add_record(&rec).unwrap());
        assert_eq!(store.get("tea").unwrap().read().records_in(&Range::All).len(), 1);
    }

    #[test]
    fn test_range_queries() {
        let (store, _, _temp) = create_test_store();
        for stamp in [100, 150, 200, 250] {
            store
                .add_record(&sample_record("tea", stamp, &format!("r{}", stamp)))
                .unwrap();
        }
        let cache = store.get("tea").unwrap();
        let cache = cache.read();
        assert_eq!(cache.heads_in(&Range::Between(100, 200)).len(), 3);
        assert_eq!(cache.heads_in(&Range::All).len(), 4);
        assert_eq!(cache.newest_stamp(), 250);
    }

    #[test]
    fn test_soft_delete_and_grace_period() {
        let (store, storage, _temp) = create_test_store();
        let rec = sample_record("tea", 100, "bye");
        store.add_record(&rec).unwrap();
        store.remove_record(&rec.head).unwrap();

        // Gone from the cache, still tombstoned
        assert!(!store.get("tea").unwrap().read().contains(100, &rec.head.id));
        assert!(storage.is_tombstoned(&rec.head).unwrap());

        // A tombstoned record is never resurrected
        assert!(!store.add_record(&rec).unwrap());

        // After the grace period the tombstone goes away
        let far_future = chrono::Utc::now().timestamp() + 7200;
        store.cleanup(far_future).unwrap();
        assert!(!storage.is_tombstoned(&rec.head).unwrap());
    }

    #[test]
    fn test_stats_recompute() {
        let (store, _, _temp) = create_test_store();
        let now = chrono::Utc::now().timestamp();
        store.add_record(&sample_record("tea", now - 100, "new")).unwrap();
        store.add_record(&sample_record("tea", 1000, "ancient")).unwrap();
        store.cleanup(now).unwrap();

        let stats = store.stats("tea").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.newest_stamp, now - 100);
        assert!(stats.total_size > 0);
        // Only one record inside the velocity window
        assert!((stats.velocity - 1.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_store_reload_from_storage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.redb");
        let rec = sample_record("tea", 100, "persist");
        {
            let storage = Storage::new(&path).unwrap();
            let store = CacheStore::new(storage, 3600).unwrap();
            store.add_record(&rec).unwrap();
        }
        {
            let storage = Storage::new(&path).unwrap();
            let store = CacheStore::new(storage, 3600).unwrap();
            assert!(store.exists("tea"));
            assert!(store.get("tea").unwrap().read().contains(100, &rec.head.id));
        }
    }
}
