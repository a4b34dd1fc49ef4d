//! Engine configuration
//!
//! All tunables live here with the defaults the protocol was designed
//! around. The daemon overrides a handful of them from the command line;
//! tests construct a `Config` directly.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a kawaraban node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory holding the database file
    pub data_dir: PathBuf,

    /// Port the wire protocol listens on
    pub port: u16,

    /// Path prefix the wire protocol is served under (part of our address)
    pub server_path: String,

    /// Externally visible address; when `None` it is learned from the
    /// first `/ping` reply during bootstrap
    pub advertised_addr: Option<String>,

    /// Seed peer addresses for bootstrap
    pub seeds: Vec<String>,

    /// Cap of the global peer list
    pub default_nodes: usize,
    /// Cap of each per-topic contributor list
    pub share_nodes: usize,
    /// Maximum peers probed by a topic search or download fan-out
    pub search_depth: usize,
    /// Peers sampled on each recent-list refresh
    pub recent_sample: usize,

    /// Cap of suggested tags per topic (and of tag hints taken per peer)
    pub tag_size: usize,

    /// Retention window of the recent-head rolling list, seconds
    pub recent_range_secs: i64,
    /// How far behind the newest known stamp a head fetch reaches, seconds
    pub sync_range_secs: i64,
    /// Grace period a soft-deleted record is kept as a tombstone, seconds
    pub tombstone_grace_secs: i64,

    /// Maximum accepted record size in kilobytes
    pub record_limit_kb: usize,
    /// Optional spam ruleset file, one regex per line
    pub spam_rules: Option<PathBuf>,

    /// Allow-list of address patterns; empty means allow everything
    pub allow_nodes: Vec<String>,
    /// Deny-list of address patterns, applied before the allow-list
    pub deny_nodes: Vec<String>,

    /// Timeout for control calls (ping/join/have/head/update/recent)
    pub control_timeout: Duration,
    /// Timeout for bulk record transfers (get)
    pub bulk_timeout: Duration,

    /// Bound on recursive join-suggestion hops
    pub join_retry: usize,

    /// Window within which a repeated update notice is a no-op
    pub update_dedup_secs: u64,
    /// How long a broadcaster waits for a fetch confirmation
    pub confirm_wait: Duration,
    /// Delay before an unconfirmed broadcast is repeated
    pub rebroadcast_delay: Duration,
    /// Cap on a background (non-blocking) topic refresh
    pub background_fetch_cap: Duration,

    /// Maintenance intervals
    pub registry_interval: Duration,
    pub recent_interval: Duration,
    pub cleanup_interval: Duration,
    pub download_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            port: 8000,
            server_path: "/server".to_string(),
            advertised_addr: None,
            seeds: Vec::new(),
            default_nodes: 5,
            share_nodes: 5,
            search_depth: 30,
            recent_sample: 10,
            tag_size: 20,
            recent_range_secs: 3 * 24 * 3600,
            sync_range_secs: 5 * 24 * 3600,
            tombstone_grace_secs: 3 * 24 * 3600,
            record_limit_kb: 250,
            spam_rules: None,
            allow_nodes: Vec::new(),
            deny_nodes: Vec::new(),
            control_timeout: Duration::from_secs(10),
            bulk_timeout: Duration::from_secs(60),
            join_retry: 2,
            update_dedup_secs: 3600,
            confirm_wait: Duration::from_secs(60),
            rebroadcast_delay: Duration::from_secs(600),
            background_fetch_cap: Duration::from_secs(10),
            registry_interval: Duration::from_secs(20 * 60),
            recent_interval: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            download_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl Config {
    /// Path of the redb database file inside the data directory
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("kawaraban.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_caps() {
        let cfg = Config::default();
        assert_eq!(cfg.default_nodes, 5);
        assert_eq!(cfg.share_nodes, 5);
        assert_eq!(cfg.tag_size, 20);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.control_timeout, cfg.control_timeout);
    }
}
