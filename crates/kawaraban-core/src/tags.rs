//! Per-topic tag sets
//!
//! Two kinds of tags exist side by side: suggested tags are inferred from
//! peer gossip, weighted, capped, and pruned against the recent list;
//! user tags are curated locally, persistent and unbounded.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::BbsResult;
use crate::storage::Storage;

/// A weighted tag on a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub text: String,
    pub weight: u32,
}

impl Tag {
    pub fn new(text: impl Into<String>, weight: u32) -> Self {
        Self {
            text: text.into(),
            weight,
        }
    }
}

/// Ephemeral gossip-derived tags, capped per topic
pub struct SuggestTags {
    map: RwLock<HashMap<String, Vec<Tag>>>,
    storage: Storage,
    tag_size: usize,
}

impl SuggestTags {
    pub fn new(storage: Storage, tag_size: usize) -> BbsResult<Self> {
        let map = storage.load_all_suggest_tags()?;
        Ok(Self {
            map: RwLock::new(map),
            storage,
            tag_size,
        })
    }

    /// Fold tag hints from one peer into a topic's suggestions.
    ///
    /// Existing tags gain weight, new ones start at 1. Hint lists are
    /// already shuffled and truncated by the caller so a verbose peer
    /// cannot dominate.
    pub fn add_hints(&self, topic: &str, hints: &[String]) {
        if hints.is_empty() {
            return;
        }
        let mut map = self.map.write();
        let tags = map.entry(topic.to_string()).or_default();
        for hint in hints {
            match tags.iter_mut().find(|t| &t.text == hint) {
                Some(tag) => tag.weight += 1,
                None => tags.push(Tag::new(hint.clone(), 1)),
            }
        }
        tags.sort_by(|a, b| b.weight.cmp(&a.weight));
        tags.truncate(self.tag_size);
    }

    /// Suggested tags for a topic, highest weight first
    pub fn get(&self, topic: &str) -> Vec<Tag> {
        self.map.read().get(topic).cloned().unwrap_or_default()
    }

    /// Drop suggestions for topics no longer present in the recent list
    /// and persist what remains.
    pub fn prune(&self, live_topics: &HashSet<String>) -> BbsResult<()> {
        let mut map = self.map.write();
        let stale: Vec<String> = map
            .keys()
            .filter(|t| !live_topics.contains(*t))
            .cloned()
            .collect();
        for topic in stale {
            map.remove(&topic);
            self.storage.delete_suggest_tags(&topic)?;
        }
        for (topic, tags) in map.iter_mut() {
            tags.sort_by(|a, b| b.weight.cmp(&a.weight));
            tags.truncate(self.tag_size);
            self.storage.save_suggest_tags(topic, tags)?;
        }
        Ok(())
    }
}

/// Locally curated tags, persistent and unbounded
pub struct UserTags {
    storage: Storage,
}

impl UserTags {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn get(&self, topic: &str) -> BbsResult<Vec<String>> {
        self.storage.load_user_tags(topic)
    }

    /// Replace the tag set of a topic
    pub fn set(&self, topic: &str, tags: &[String]) -> BbsResult<()> {
        self.storage.save_user_tags(topic, tags)
    }

    /// Attach one tag if not already present
    pub fn add(&self, topic: &str, tag: &str) -> BbsResult<()> {
        let mut tags = self.storage.load_user_tags(topic)?;
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
            self.storage.save_user_tags(topic, &tags)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_hints_accumulate_weight() {
        let (storage, _temp) = create_test_storage();
        let tags = SuggestTags::new(storage, 20).unwrap();
        tags.add_hints("tea", &["green".to_string(), "sencha".to_string()]);
        tags.add_hints("tea", &["green".to_string()]);

        let got = tags.get("tea");
        assert_eq!(got[0], Tag::new("green", 2));
        assert_eq!(got[1], Tag::new("sencha", 1));
    }

    #[test]
    fn test_suggestions_capped_at_tag_size() {
        let (storage, _temp) = create_test_storage();
        let tags = SuggestTags::new(storage, 3).unwrap();
        let hints: Vec<String> = (0..10).map(|i| format!("tag{}", i)).collect();
        tags.add_hints("tea", &hints);
        assert_eq!(tags.get("tea").len(), 3);
    }

    #[test]
    fn test_prune_drops_dead_topics() {
        let (storage, _temp) = create_test_storage();
        let tags = SuggestTags::new(storage.clone(), 20).unwrap();
        tags.add_hints("tea", &["green".to_string()]);
        tags.add_hints("coffee", &["dark".to_string()]);

        let live: HashSet<String> = ["tea".to_string()].into_iter().collect();
        tags.prune(&live).unwrap();

        assert!(!tags.get("tea").is_empty());
        assert!(tags.get("coffee").is_empty());
        // Pruning also persisted the survivors
        let stored = storage.load_all_suggest_tags().unwrap();
        assert!(stored.contains_key("tea"));
        assert!(!stored.contains_key("coffee"));
    }

    #[test]
    fn test_user_tags_add_is_idempotent() {
        let (storage, _temp) = create_test_storage();
        let tags = UserTags::new(storage);
        tags.add("tea", "favorite").unwrap();
        tags.add("tea", "favorite").unwrap();
        tags.add("tea", "daily").unwrap();
        assert_eq!(tags.get("tea").unwrap(), vec!["favorite", "daily"]);
    }
}
