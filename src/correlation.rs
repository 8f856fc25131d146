//! Correlating command results back to the issuing session

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::trace;

use crate::{
    constants::{DEFAULT_REPLY_TIMEOUT_MS, DEFAULT_SETTLE_MS},
    error::BridgeResult,
    event::EventRecord,
    session::Session,
};

/// Channel a caller waits on for its session to become readable.
pub type ReplySender = oneshot::Sender<BridgeResult<Arc<Session>>>;
/// Receiving end of [`ReplySender`].
pub type ReplyReceiver = oneshot::Receiver<BridgeResult<Arc<Session>>>;

/// How the dispatcher decides a command's results are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationPolicy {
    /// Wait a fixed interval after writing, then hand out the session.
    ///
    /// Assumes upstream answers within the interval and that commands are
    /// sparse; under bursts callers may see partial results.
    Settle(Duration),
    /// Hand out the session when a record carrying the command's `ActionID`
    /// is routed to it.
    ///
    /// `linger` is extra time the caller waits after that first record so
    /// follow-up records (event lists) can accumulate.
    Acknowledge { linger: Duration },
}

impl CorrelationPolicy {
    /// Settle policy with the default interval.
    pub fn settle() -> Self {
        Self::Settle(Duration::from_millis(DEFAULT_SETTLE_MS))
    }
}

impl Default for CorrelationPolicy {
    fn default() -> Self {
        Self::Acknowledge {
            linger: Duration::ZERO,
        }
    }
}

/// Default time a caller waits for its reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS);

/// Outstanding waiters keyed by correlation id, oldest first.
///
/// Written by the dispatcher before a frame goes out, resolved by the router
/// when a matching record is delivered. Waiters whose caller gave up are
/// skipped and pruned.
#[derive(Debug, Default)]
pub struct PendingReplies {
    waiters: Mutex<HashMap<String, VecDeque<ReplySender>>>,
}

impl PendingReplies {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter for `id`.
    ///
    /// Waiters whose caller has gone away are swept from every id first, so
    /// tokens that are never used again do not keep entries alive.
    pub async fn register(&self, id: &str, reply: ReplySender) {
        let mut waiters = self
            .waiters
            .lock()
            .await;
        prune(&mut waiters);
        waiters
            .entry(id.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Drop abandoned waiters and empty entries.
    pub async fn prune(&self) {
        prune(
            &mut *self
                .waiters
                .lock()
                .await,
        );
    }

    /// Number of correlation ids with at least one waiter entry.
    pub async fn ids(&self) -> usize {
        self.waiters
            .lock()
            .await
            .len()
    }

    /// Complete the oldest live waiter for `id` with `session`.
    ///
    /// Returns `true` if a waiter was completed.
    pub async fn resolve(&self, id: &str, session: &Arc<Session>) -> bool {
        let mut waiters = self
            .waiters
            .lock()
            .await;
        let Some(queue) = waiters.get_mut(id) else {
            return false;
        };

        let mut resolved = false;
        while let Some(tx) = queue.pop_front() {
            if tx
                .send(Ok(session.clone()))
                .is_ok()
            {
                resolved = true;
                break;
            }
            trace!("[CORRELATE] Skipping abandoned waiter for {}", id);
        }
        if queue.is_empty() {
            waiters.remove(id);
        }
        resolved
    }

    /// Drop every waiter; their callers observe a closed channel.
    pub async fn clear(&self) {
        self.waiters
            .lock()
            .await
            .clear();
    }

    /// Number of registered waiters, including abandoned ones not yet pruned.
    pub async fn len(&self) -> usize {
        self.waiters
            .lock()
            .await
            .values()
            .map(|q| q.len())
            .sum()
    }

    /// `true` if no waiter is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn prune(waiters: &mut HashMap<String, VecDeque<ReplySender>>) {
    waiters.retain(|id, queue| {
        queue.retain(|tx| !tx.is_closed());
        if queue.is_empty() {
            trace!("[CORRELATE] Dropping abandoned waiters for {}", id);
            false
        } else {
            true
        }
    });
}

/// Where a correlated record sits within its command's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPart {
    /// A `Response:` record that completes the reply by itself.
    Response,
    /// A `Response:` record announcing that list events follow.
    ListStart,
    /// An event; `closes_list` marks the last record of an event list.
    Event { closes_list: bool },
}

impl ReplyPart {
    pub fn of(record: &EventRecord) -> Self {
        if record
            .response()
            .is_some()
        {
            if record.starts_event_list() {
                ReplyPart::ListStart
            } else {
                ReplyPart::Response
            }
        } else {
            ReplyPart::Event {
                closes_list: record.completes_event_list(),
            }
        }
    }
}

/// Tracks correlation ids whose reply is an event list still in progress.
///
/// A list reply is `Response ... EventList: start`, the list events, then a
/// closing `...Complete` event, all carrying the same `ActionID`. The waiter
/// for such a command is released only once the closing event is routed.
#[derive(Debug, Default)]
pub struct ReplyTracker {
    open_lists: HashSet<String>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a correlated record for `id`; returns `true` when the reply is
    /// complete and the waiter should be released.
    ///
    /// A new `Response:` always starts a new reply, so a list that never
    /// closed does not hold back later commands for the same id.
    pub fn observe(&mut self, id: &str, part: ReplyPart) -> bool {
        match part {
            ReplyPart::ListStart => {
                trace!("[CORRELATE] Event list opened for {}", id);
                self.open_lists
                    .insert(id.to_string());
                false
            }
            ReplyPart::Response => {
                self.open_lists
                    .remove(id);
                true
            }
            ReplyPart::Event { closes_list } => {
                if !self
                    .open_lists
                    .contains(id)
                {
                    return true;
                }
                if closes_list {
                    trace!("[CORRELATE] Event list closed for {}", id);
                    self.open_lists
                        .remove(id);
                }
                closes_list
            }
        }
    }

    /// `true` while an event list for `id` is still open.
    pub fn is_open(&self, id: &str) -> bool {
        self.open_lists
            .contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_oldest_waiter_first() {
        let pending = PendingReplies::new();
        let session = Arc::new(Session::new("T1"));

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending
            .register("T1", tx1)
            .await;
        pending
            .register("T1", tx2)
            .await;

        assert!(pending
            .resolve("T1", &session)
            .await);
        assert!(rx1
            .try_recv()
            .is_ok());
        assert!(rx2
            .try_recv()
            .is_err());
        assert_eq!(pending.len().await, 1);
    }

    #[tokio::test]
    async fn test_abandoned_waiters_are_skipped() {
        let pending = PendingReplies::new();
        let session = Arc::new(Session::new("T1"));

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending
            .register("T1", tx1)
            .await;
        pending
            .register("T1", tx2)
            .await;
        drop(rx1);

        assert!(pending
            .resolve("T1", &session)
            .await);
        let got = rx2
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.token(), "T1");
        assert!(pending
            .is_empty()
            .await);
    }

    #[tokio::test]
    async fn test_resolve_without_waiter_is_noop() {
        let pending = PendingReplies::new();
        let session = Arc::new(Session::new("T1"));
        assert!(!pending
            .resolve("T1", &session)
            .await);
    }

    #[tokio::test]
    async fn test_clear_closes_waiters() {
        let pending = PendingReplies::new();
        let (tx, rx) = oneshot::channel();
        pending
            .register("T1", tx)
            .await;
        pending
            .clear()
            .await;
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_register_sweeps_abandoned_ids() {
        let pending = PendingReplies::new();
        let (gone_tx, gone_rx) = oneshot::channel();
        pending
            .register("evicted", gone_tx)
            .await;
        drop(gone_rx);

        let (tx, _rx) = oneshot::channel();
        pending
            .register("T1", tx)
            .await;
        assert_eq!(pending.ids().await, 1);
        assert_eq!(pending.len().await, 1);
    }

    #[tokio::test]
    async fn test_prune_drops_only_closed_waiters() {
        let pending = PendingReplies::new();
        let (gone_tx, gone_rx) = oneshot::channel();
        let (live_tx, _live_rx) = oneshot::channel();
        pending
            .register("A", gone_tx)
            .await;
        pending
            .register("B", live_tx)
            .await;
        drop(gone_rx);

        pending
            .prune()
            .await;
        assert_eq!(pending.ids().await, 1);
        assert!(!pending
            .is_empty()
            .await);
    }

    fn record(fields: &[(&str, &str)]) -> EventRecord {
        EventRecord::from_fields(fields.iter().copied())
    }

    #[test]
    fn test_reply_part_classification() {
        assert_eq!(
            ReplyPart::of(&record(&[("Response", "Success"), ("ActionID", "T1")])),
            ReplyPart::Response
        );
        assert_eq!(
            ReplyPart::of(&record(&[
                ("Response", "Success"),
                ("ActionID", "T1"),
                ("EventList", "start")
            ])),
            ReplyPart::ListStart
        );
        assert_eq!(
            ReplyPart::of(&record(&[("Event", "StatusComplete"), ("ActionID", "T1")])),
            ReplyPart::Event { closes_list: true }
        );
    }

    #[test]
    fn test_tracker_holds_list_until_complete() {
        let mut tracker = ReplyTracker::new();
        assert!(!tracker.observe("T1", ReplyPart::ListStart));
        assert!(tracker.is_open("T1"));
        assert!(!tracker.observe("T1", ReplyPart::Event { closes_list: false }));
        assert!(!tracker.observe("T1", ReplyPart::Event { closes_list: false }));
        assert!(tracker.observe("T1", ReplyPart::Event { closes_list: true }));
        assert!(!tracker.is_open("T1"));
    }

    #[test]
    fn test_tracker_releases_plain_replies_immediately() {
        let mut tracker = ReplyTracker::new();
        assert!(tracker.observe("T1", ReplyPart::Response));
        assert!(tracker.observe("T1", ReplyPart::Event { closes_list: false }));
    }

    #[test]
    fn test_new_response_abandons_unfinished_list() {
        let mut tracker = ReplyTracker::new();
        assert!(!tracker.observe("T1", ReplyPart::ListStart));
        assert!(tracker.observe("T1", ReplyPart::Response));
        assert!(!tracker.is_open("T1"));
    }

    #[test]
    fn test_lists_are_tracked_per_id() {
        let mut tracker = ReplyTracker::new();
        assert!(!tracker.observe("T1", ReplyPart::ListStart));
        assert!(tracker.observe("T2", ReplyPart::Response));
        assert!(!tracker.observe("T1", ReplyPart::Event { closes_list: false }));
    }

    #[test]
    fn test_default_policy_is_acknowledge() {
        assert_eq!(
            CorrelationPolicy::default(),
            CorrelationPolicy::Acknowledge {
                linger: Duration::ZERO
            }
        );
        assert_eq!(
            CorrelationPolicy::settle(),
            CorrelationPolicy::Settle(Duration::from_millis(500))
        );
    }
}
