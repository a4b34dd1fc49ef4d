//! Kawaraban Core Library
//!
//! Serverless peer-replicated bulletin board engine.
//!
//! ## Overview
//!
//! Kawaraban nodes form an open swarm with no central server. Each node
//! holds the topics its users read, discovers peers by gossip, and
//! replicates records (posts) by exchanging plain-text lines over HTTP.
//! A record is content-addressed by the hash of its body and optionally
//! signed; any node can verify both without trusting the sender.
//!
//! ## Core Principles
//!
//! - **Serverless**: every node is both client and server
//! - **Pull-based**: content moves when a node asks for it; update
//!   notices only say that there is something to ask for
//! - **Verify-then-trust**: hashes and signatures are checked before a
//!   record is stored, never after
//!
//! ## Quick Start
//!
//! ```ignore
//! use kawaraban_core::{BbsEngine, Config, Range};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = std::sync::Arc::new(BbsEngine::new(Config::default())?);
//!     engine.start().await;
//!
//!     // Post a record
//!     engine.post("tea", vec![("body".into(), "hello swarm".into())], "").await?;
//!
//!     // Read a topic
//!     for record in engine.list_records("tea", &Range::All) {
//!         println!("{}: {}", record.head.stamp, record.body_string());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod node;
pub mod recent;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod signer;
pub mod spam;
pub mod storage;
pub mod tags;
pub mod updates;
pub mod wire;

// Re-exports
pub use cache::{CacheStore, TopicCache, TopicStats};
pub use client::{HttpPeerClient, JoinReply, PeerClient, RecentEntry};
pub use config::Config;
pub use download::{DownloadManager, Downloader};
pub use engine::BbsEngine;
pub use error::{BbsError, BbsResult};
pub use node::{NodeAddr, NodeFilter};
pub use recent::RecentList;
pub use record::{Head, Record};
pub use registry::PeerRegistry;
pub use signer::{verify_detached, RsaSigner, Signer};
pub use spam::SpamFilter;
pub use storage::Storage;
pub use tags::{SuggestTags, Tag, UserTags};
pub use updates::{UpdateOutcome, UpdateQueue};
pub use wire::{Range, SEP};
