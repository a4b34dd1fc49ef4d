//! Persistent storage using redb
//!
//! One database file holds every durable table, all keyed by topic:
//! - records and tombstoned records
//! - the peer lookup table (topic -> address list, "" for the global list)
//! - the recent-head rolling table
//! - suggested and user tag tables
//!
//! Values are serde_json blobs. Write transactions serialize all disk
//! mutation; they are held only for the write itself, never across a
//! network call.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{BbsError, BbsResult};
use crate::node::NodeAddr;
use crate::record::{Head, Record};
use crate::tags::Tag;

const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const TOMBSTONES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tombstones");
const PEER_TABLES: TableDefinition<&str, &[u8]> = TableDefinition::new("peer_tables");
const RECENT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("recent");
const SUGGEST_TAGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("suggest_tags");
const USER_TAGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("user_tags");

/// A soft-deleted record awaiting its grace period
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tombstone {
    pub record: Record,
    pub removed_at: i64,
}

fn record_key(topic: &str, idstr: &str) -> String {
    format!("{}\u{0}{}", topic, idstr)
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('\u{0}')
}

fn to_json<T: serde::Serialize>(value: &T) -> BbsResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| BbsError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> BbsResult<T> {
    serde_json::from_slice(bytes).map_err(|e| BbsError::Serialization(e.to_string()))
}

/// Storage layer for all durable engine state
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Open (or create) the database and initialize every table.
    pub fn new(path: impl AsRef<Path>) -> BbsResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
            let _ = write_txn.open_table(TOMBSTONES_TABLE)?;
            let _ = write_txn.open_table(PEER_TABLES)?;
            let _ = write_txn.open_table(RECENT_TABLE)?;
            let _ = write_txn.open_table(SUGGEST_TAGS_TABLE)?;
            let _ = write_txn.open_table(USER_TAGS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Records
    // ═══════════════════════════════════════════════════════════════════

    /// Persist one record under its topic.
    pub fn save_record(&self, record: &Record) -> BbsResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            let key = record_key(&record.head.topic, &record.head.idstr());
            table.insert(key.as_str(), to_json(record)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load every record of a topic.
    pub fn load_topic(&self, topic: &str) -> BbsResult<Vec<Record>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;
        let prefix = record_key(topic, "");
        let mut records = Vec::new();
        for entry in table.range(prefix.as_str()..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            records.push(from_json(value.value())?);
        }
        Ok(records)
    }

    /// Delete a record (used by spam cleanup and tombstone promotion).
    pub fn delete_record(&self, head: &Head) -> BbsResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            let key = record_key(&head.topic, &head.idstr());
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Distinct topics that have at least one stored record.
    pub fn topics(&self) -> BbsResult<Vec<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;
        let mut topics = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            if let Some((topic, _)) = split_key(key.value()) {
                if topics.last().map(String::as_str) != Some(topic) {
                    topics.push(topic.to_string());
                }
            }
        }
        topics.dedup();
        Ok(topics)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Tombstones
    // ═══════════════════════════════════════════════════════════════════

    /// Move a record into the tombstone table.
    pub fn save_tombstone(&self, record: &Record, removed_at: i64) -> BbsResult<()> {
        let tomb = Tombstone {
            record: record.clone(),
            removed_at,
        };
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut records = write_txn.open_table(RECORDS_TABLE)?;
            let mut tombs = write_txn.open_table(TOMBSTONES_TABLE)?;
            let key = record_key(&record.head.topic, &record.head.idstr());
            records.remove(key.as_str())?;
            tombs.insert(key.as_str(), to_json(&tomb)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Heads of tombstones whose grace period ended before `cutoff`.
    pub fn expired_tombstones(&self, cutoff: i64) -> BbsResult<Vec<Head>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(TOMBSTONES_TABLE)?;
        let mut expired = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let tomb: Tombstone = from_json(value.value())?;
            if tomb.removed_at < cutoff {
                expired.push(tomb.record.head.clone());
            }
        }
        Ok(expired)
    }

    /// Check whether a head is tombstoned (so it is not re-fetched).
    pub fn is_tombstoned(&self, head: &Head) -> BbsResult<bool> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(TOMBSTONES_TABLE)?;
        let key = record_key(&head.topic, &head.idstr());
        Ok(table.get(key.as_str())?.is_some())
    }

    /// Physically remove an expired tombstone.
    pub fn delete_tombstone(&self, head: &Head) -> BbsResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(TOMBSTONES_TABLE)?;
            let key = record_key(&head.topic, &head.idstr());
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Peer lookup table
    // ═══════════════════════════════════════════════════════════════════

    /// Replace the whole persisted peer lookup table.
    pub fn save_peer_tables(&self, tables: &HashMap<String, Vec<NodeAddr>>) -> BbsResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PEER_TABLES)?;
            let stale: Vec<String> = table
                .iter()?
                .filter_map(|e| e.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in stale {
                table.remove(key.as_str())?;
            }
            for (topic, nodes) in tables {
                table.insert(topic.as_str(), to_json(nodes)?.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the persisted peer lookup table.
    pub fn load_peer_tables(&self) -> BbsResult<HashMap<String, Vec<NodeAddr>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PEER_TABLES)?;
        let mut tables = HashMap::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            tables.insert(key.value().to_string(), from_json(value.value())?);
        }
        Ok(tables)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Recent heads
    // ═══════════════════════════════════════════════════════════════════

    /// Replace the persisted recent-head rolling table.
    pub fn replace_recent(&self, heads: &[Head]) -> BbsResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECENT_TABLE)?;
            let stale: Vec<String> = table
                .iter()?
                .filter_map(|e| e.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in stale {
                table.remove(key.as_str())?;
            }
            for head in heads {
                let key = record_key(&head.topic, &head.idstr());
                table.insert(key.as_str(), to_json(head)?.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the persisted recent heads.
    pub fn load_recent(&self) -> BbsResult<Vec<Head>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RECENT_TABLE)?;
        let mut heads = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            heads.push(from_json(value.value())?);
        }
        Ok(heads)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Tags
    // ═══════════════════════════════════════════════════════════════════

    pub fn save_suggest_tags(&self, topic: &str, tags: &[Tag]) -> BbsResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SUGGEST_TAGS_TABLE)?;
            table.insert(topic, to_json(&tags)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete_suggest_tags(&self, topic: &str) -> BbsResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SUGGEST_TAGS_TABLE)?;
            table.remove(topic)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_all_suggest_tags(&self) -> BbsResult<HashMap<String, Vec<Tag>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SUGGEST_TAGS_TABLE)?;
        let mut map = HashMap::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            map.insert(key.value().to_string(), from_json(value.value())?);
        }
        Ok(map)
    }

    pub fn save_user_tags(&self, topic: &str, tags: &[String]) -> BbsResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(USER_TAGS_TABLE)?;
            table.insert(topic, to_json(&tags)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_user_tags(&self, topic: &str) -> BbsResult<Vec<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(USER_TAGS_TABLE)?;
        match table.get(topic)? {
            Some(v) => from_json(v.value()),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        (storage, temp_dir)
    }

    fn sample_record(topic: &str, stamp: i64, body: &str) -> Record {
        Record::build(topic, stamp, vec![("body".to_string(), body.to_string())], "").unwrap()
    }

    #[test]
    fn test_save_and_load_records() {
        let (storage, _temp) = create_test_storage();
        let rec = sample_record("tea", 100, "first");
        storage.save_record(&rec).unwrap();
        storage.save_record(&sample_record("tea", 200, "second")).unwrap();
        storage.save_record(&sample_record("coffee", 300, "other")).unwrap();

        let tea = storage.load_topic("tea").unwrap();
        assert_eq!(tea.len(), 2);
        assert!(tea.contains(&rec));
        assert_eq!(storage.load_topic("coffee").unwrap().len(), 1);
        assert!(storage.load_topic("absent").unwrap().is_empty());
    }

    #[test]
    fn test_topics_enumeration() {
        let (storage, _temp) = create_test_storage();
        storage.save_record(&sample_record("tea", 100, "a")).unwrap();
        storage.save_record(&sample_record("tea", 101, "b")).unwrap();
        storage.save_record(&sample_record("coffee", 100, "c")).unwrap();

        let mut topics = storage.topics().unwrap();
        topics.sort();
        assert_eq!(topics, vec!["coffee", "tea"]);
    }

    #[test]
    fn test_tombstone_flow() {
        let (storage, _temp) = create_test_storage();
        let rec = sample_record("tea", 100, "gone");
        storage.save_record(&rec).unwrap();
        storage.save_tombstone(&rec, 1000).unwrap();

        assert!(storage.load_topic("tea").unwrap().is_empty());
        assert!(storage.is_tombstoned(&rec.head).unwrap());

        assert!(storage.expired_tombstones(999).unwrap().is_empty());
        let expired = storage.expired_tombstones(1001).unwrap();
        assert_eq!(expired, vec![rec.head.clone()]);

        storage.delete_tombstone(&rec.head).unwrap();
        assert!(!storage.is_tombstoned(&rec.head).unwrap());
    }

    #[test]
    fn test_peer_tables_persist() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.redb");
        let node = NodeAddr::parse("peer.example:8000/server").unwrap();

        {
            let storage = Storage::new(&path).unwrap();
            let mut tables = HashMap::new();
            tables.insert(String::new(), vec![node.clone()]);
            tables.insert("tea".to_string(), vec![node.clone()]);
            storage.save_peer_tables(&tables).unwrap();
        }
        {
            let storage = Storage::new(&path).unwrap();
            let tables = storage.load_peer_tables().unwrap();
            assert_eq!(tables.len(), 2);
            assert_eq!(tables[""], vec![node.clone()]);
            assert_eq!(tables["tea"], vec![node]);
        }
    }

    #[test]
    fn test_replace_recent_drops_old_entries() {
        let (storage, _temp) = create_test_storage();
        let a = Head::new("tea", 100, "aa");
        let b = Head::new("coffee", 200, "bb");
        storage.replace_recent(&[a.clone(), b]).unwrap();
        storage.replace_recent(&[a.clone()]).unwrap();

        let heads = storage.load_recent().unwrap();
        assert_eq!(heads, vec![a]);
    }

    #[test]
    fn test_tag_tables() {
        let (storage, _temp) = create_test_storage();
        let tags = vec![Tag::new("green", 3), Tag::new("sencha", 1)];
        storage.save_suggest_tags("tea", &tags).unwrap();
        storage
            .save_user_tags("tea", &["favorite".to_string()])
            .unwrap();

        let all = storage.load_all_suggest_tags().unwrap();
        assert_eq!(all["tea"], tags);
        assert_eq!(storage.load_user_tags("tea").unwrap(), vec!["favorite"]);
        assert!(storage.load_user_tags("absent").unwrap().is_empty());

        storage.delete_suggest_tags("tea").unwrap();
        assert!(storage.load_all_suggest_tags().unwrap().is_empty());
    }
}
