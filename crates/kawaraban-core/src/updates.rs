//! Update broadcast with confirm-or-retry
//!
//! An update notice tells the swarm "record (topic, stamp, id) exists,
//! fetch it from <teller>". Inbound and self-generated notices funnel
//! through [`UpdateQueue::update_nodes`], which deduplicates them in a
//! one-hour window, fetches the record from its origin when we hold the
//! topic, and rebroadcasts. A node that originates a post waits on a
//! single-slot rendezvous for one minute: if nobody fetched the record by
//! then, the identical broadcast is rescheduled after a ten-minute delay,
//! cancelled early when the confirmation arrives.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::client::PeerClient;
use crate::node::NodeAddr;
use crate::recent::RecentList;
use crate::record::Head;
use crate::registry::PeerRegistry;
use crate::spam::SpamFilter;
use crate::wire::Range;

/// How one update notice was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Same head seen within the dedup window; nothing done
    Duplicate,
    /// Notice relayed (or originated) without fetching content
    Broadcast,
    /// Record fetched from its origin, stored and rebroadcast
    Fetched,
    /// Origin unreachable or record missing; caller may retry later
    TransientFailure,
    /// Record was spam or failed validation; absorbed without broadcast
    Spam,
}

/// Dedup + broadcast + confirm-or-retry driver
pub struct UpdateQueue {
    client: Arc<dyn PeerClient>,
    registry: Arc<PeerRegistry>,
    store: Arc<CacheStore>,
    recent: Arc<RecentList>,
    spam: Arc<SpamFilter>,
    /// head digest -> last seen unix time
    seen: Mutex<HashMap<String, i64>>,
    /// rendezvous slots for broadcasts awaiting confirmation
    pending: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    dedup_secs: i64,
    confirm_wait: std::time::Duration,
    rebroadcast_delay: std::time::Duration,
}

impl UpdateQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn PeerClient>,
        registry: Arc<PeerRegistry>,
        store: Arc<CacheStore>,
        recent: Arc<RecentList>,
        spam: Arc<SpamFilter>,
        dedup_secs: u64,
        confirm_wait: std::time::Duration,
        rebroadcast_delay: std::time::Duration,
    ) -> Self {
        Self {
            client,
            registry,
            store,
            recent,
            spam,
            seen: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            dedup_secs: dedup_secs as i64,
            confirm_wait,
            rebroadcast_delay,
        }
    }

    /// Returns true when the head entered the window, false on duplicate.
    fn dedup(&self, head: &Head, now: i64) -> bool {
        let mut seen = self.seen.lock();
        let cutoff = now - self.dedup_secs;
        seen.retain(|_, t| *t >= cutoff);
        if seen.contains_key(&head.digest()) {
            return false;
        }
        seen.insert(head.digest(), now);
        true
    }

    /// Forget a head so a later identical notice is processed again.
    fn forget(&self, head: &Head) {
        self.seen.lock().remove(&head.digest());
    }

    /// Notify a broadcaster waiting on this head that somebody actually
    /// retrieved the record. Called by the `/get` responder.
    ///
    /// `notify_one` stores a permit when the watcher task has not been
    /// polled yet, so a confirmation arriving before the watcher's first
    /// wait is not lost.
    pub fn confirm(&self, head: &Head) {
        if let Some(notify) = self.pending.lock().get(&head.digest()) {
            debug!(topic = %head.topic, id = %head.id, "Broadcast confirmed");
            notify.notify_one();
        }
    }

    /// Process one update notice.
    ///
    /// `origin` is the peer the notice points at as the record holder;
    /// `None` means we originated the record ourselves.
    pub async fn update_nodes(self: &Arc<Self>, head: &Head, origin: Option<NodeAddr>) -> UpdateOutcome {
        let now = chrono::Utc::now().timestamp();
        if !self.dedup(head, now) {
            debug!(topic = %head.topic, id = %head.id, "Duplicate update notice");
            return UpdateOutcome::Duplicate;
        }

        match origin {
            // We are the original poster: broadcast, then insist on a
            // confirmation or retry once.
            None => {
                let Some(myself) = self.registry.myself() else {
                    warn!("Own address unknown, update not broadcast");
                    return UpdateOutcome::Broadcast;
                };
                self.broadcast_with_confirm(head, &myself).await;
                UpdateOutcome::Broadcast
            }
            // A remote notice for a topic we do not hold: relay only.
            Some(teller) if !self.store.exists(&head.topic) => {
                self.registry
                    .tell_update(&head.topic, head.stamp, &head.id, &teller)
                    .await;
                UpdateOutcome::Broadcast
            }
            // A remote notice for a topic we hold: fetch the record from
            // its origin, then spread the word.
            Some(teller) => self.fetch_and_spread(head, &teller).await,
        }
    }

    async fn fetch_and_spread(self: &Arc<Self>, head: &Head, origin: &NodeAddr) -> UpdateOutcome {
        let range = Range::Exact {
            stamp: head.stamp,
            id: head.id.clone(),
        };
        let records = match self.client.get(origin, &head.topic, &range).await {
            Ok(records) => records,
            Err(e) => {
                warn!(%origin, topic = %head.topic, error = %e, "Update fetch failed");
                self.forget(head);
                return UpdateOutcome::TransientFailure;
            }
        };
        let Some(record) = records.into_iter().find(|r| r.head == *head) else {
            self.forget(head);
            return UpdateOutcome::TransientFailure;
        };

        if !record.meets(&range) {
            debug!(topic = %head.topic, id = %head.id, "Update record failed validation");
            return UpdateOutcome::Spam;
        }
        if self.spam.is_spam(&record) {
            let _ = self.store.purge_record(&record.head);
            return UpdateOutcome::Spam;
        }

        match self.store.add_record(&record) {
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to store updated record");
                self.forget(head);
                return UpdateOutcome::TransientFailure;
            }
        }
        self.recent.append(head);
        self.registry.append(&head.topic, origin);
        info!(topic = %head.topic, stamp = head.stamp, "Record received via update");

        let teller = self.registry.myself().unwrap_or_else(|| origin.clone());
        self.registry
            .tell_update(&head.topic, head.stamp, &head.id, &teller)
            .await;
        UpdateOutcome::Fetched
    }

    /// Broadcast and arm the rendezvous: wait one confirm window, then
    /// schedule the identical broadcast once after the retry delay,
    /// cancelled if the confirmation arrives first.
    async fn broadcast_with_confirm(self: &Arc<Self>, head: &Head, teller: &NodeAddr) {
        let notify = Arc::new(Notify::new());
        self.pending.lock().insert(head.digest(), notify.clone());

        self.registry
            .tell_update(&head.topic, head.stamp, &head.id, teller)
            .await;

        let queue = self.clone();
        let head = head.clone();
        let teller = teller.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(queue.confirm_wait) => {
                    debug!(topic = %head.topic, id = %head.id, "No confirmation, retry scheduled");
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(queue.rebroadcast_delay) => {
                            queue.registry
                                .tell_update(&head.topic, head.stamp, &head.id, &teller)
                                .await;
                        }
                    }
                }
            }
            queue.pending.lock().remove(&head.digest());
        });
    }
}
