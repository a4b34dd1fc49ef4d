//! Background maintenance timers
//!
//! Four independent interval tasks keep a node healthy: peer-table repair,
//! recent-list refresh, cache cleanup, and a sweep that retries unfinished
//! downloads. Each loop logs failures and keeps ticking.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::BbsEngine;

/// Start the maintenance tasks. Dropping the handles aborts nothing; the
/// caller keeps them to abort on shutdown.
pub fn spawn_maintenance(engine: Arc<BbsEngine>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_registry(engine.clone()),
        spawn_recent(engine.clone()),
        spawn_cleanup(engine.clone()),
        spawn_download_sweep(engine),
    ]
}

/// Repair the global peer list and persist table changes.
fn spawn_registry(engine: Arc<BbsEngine>) -> JoinHandle<()> {
    let period = engine.config.registry_interval;
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            debug!("Registry maintenance tick");
            engine.registry.rejoin().await;
            if let Err(e) = engine.registry.sync() {
                warn!(error = %e, "Peer table persist failed");
            }
        }
    })
}

/// Refresh the recent list from a peer sample, purge expired entries and
/// drop suggested tags of topics no longer referenced.
fn spawn_recent(engine: Arc<BbsEngine>) -> JoinHandle<()> {
    let period = engine.config.recent_interval;
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            debug!("Recent-list refresh tick");
            let now = chrono::Utc::now().timestamp();
            engine
                .recent
                .get_all(
                    &engine.registry,
                    engine.client(),
                    &engine.suggest,
                    engine.config.recent_sample,
                    engine.config.tag_size,
                    now,
                )
                .await;
            if let Err(e) = engine.recent.sync(now) {
                warn!(error = %e, "Recent list persist failed");
            }
            if let Err(e) = engine.suggest.prune(&engine.recent.topics()) {
                warn!(error = %e, "Suggested-tag prune failed");
            }
        }
    })
}

/// Expire tombstones and recompute per-topic stats.
fn spawn_cleanup(engine: Arc<BbsEngine>) -> JoinHandle<()> {
    let period = engine.config.cleanup_interval;
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            debug!("Cache cleanup tick");
            if let Err(e) = engine.store.cleanup(chrono::Utc::now().timestamp()) {
                warn!(error = %e, "Cache cleanup failed");
            }
        }
    })
}

/// Retry download cycles for topics with unfinished targets.
fn spawn_download_sweep(engine: Arc<BbsEngine>) -> JoinHandle<()> {
    let period = engine.config.download_interval;
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            for topic in engine.downloader.active_topics() {
                debug!(topic, "Download sweep");
                engine.downloader.get_cache(&topic).await;
            }
        }
    })
}
