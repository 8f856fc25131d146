//! Per-client session state

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::{
    constants::LINE_TERMINATOR,
    error::BridgeError,
    event::EventRecord,
};

/// Buffered records rendered back into wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedEvents {
    /// Every serializable record followed by a blank line, then a final blank line.
    pub text: String,
    /// Records that could not be serialized and were left out.
    pub skipped: usize,
}

impl SerializedEvents {
    /// `SerializationAnomaly` if any record was left out.
    pub fn anomaly(&self) -> Option<BridgeError> {
        (self.skipped > 0).then_some(BridgeError::SerializationAnomaly {
            count: self.skipped,
        })
    }
}

#[derive(Debug)]
struct SessionState {
    name: String,
    last_activity: Instant,
    events: VecDeque<EventRecord>,
}

/// One registered caller.
///
/// The token is fixed at creation. Name, activity timestamp, and the event
/// queue sit behind the session's own lock so routing into one session never
/// contends with callers of another.
#[derive(Debug)]
pub struct Session {
    token: String,
    state: RwLock<SessionState>,
}

impl Session {
    /// Create a session for `token`, generating one if it is blank.
    ///
    /// The display name defaults to the token.
    pub fn new(token: &str) -> Self {
        let token = match token.trim() {
            "" => Uuid::new_v4().to_string(),
            t => t.to_string(),
        };
        Self {
            state: RwLock::new(SessionState {
                name: token.clone(),
                last_activity: Instant::now(),
                events: VecDeque::new(),
            }),
            token,
        }
    }

    /// Identity token (never empty).
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Display name.
    pub async fn name(&self) -> String {
        self.state
            .read()
            .await
            .name
            .clone()
    }

    /// Replace the display name.
    pub async fn set_name(&self, name: impl Into<String>) {
        self.state
            .write()
            .await
            .name = name.into();
    }

    /// Append a record to the end of the queue.
    pub async fn add_event(&self, record: EventRecord) {
        self.state
            .write()
            .await
            .events
            .push_back(record);
    }

    /// Drop every buffered record.
    pub async fn clear_events(&self) {
        self.state
            .write()
            .await
            .events
            .clear();
    }

    /// Number of buffered records.
    pub async fn pending_events(&self) -> usize {
        self.state
            .read()
            .await
            .events
            .len()
    }

    /// Copy of the buffered records in arrival order.
    pub async fn events(&self) -> Vec<EventRecord> {
        self.state
            .read()
            .await
            .events
            .iter()
            .cloned()
            .collect()
    }

    /// Serialize the queue without draining it.
    pub async fn events_as_string(&self) -> SerializedEvents {
        let state = self
            .state
            .read()
            .await;
        serialize_events(&self.token, &state.events)
    }

    /// Serialize and clear the queue under one lock acquisition.
    ///
    /// Records arriving concurrently land either in this batch or the next,
    /// never in neither.
    pub async fn take_events_as_string(&self) -> SerializedEvents {
        let mut state = self
            .state
            .write()
            .await;
        let serialized = serialize_events(&self.token, &state.events);
        state
            .events
            .clear();
        serialized
    }

    /// Mark the session active now.
    pub async fn update_activity(&self) {
        self.state
            .write()
            .await
            .last_activity = Instant::now();
    }

    /// Time since the last activity, measured at `now`.
    pub async fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(
            self.state
                .read()
                .await
                .last_activity,
        )
    }
}

fn serialize_events<'a>(
    token: &str,
    events: impl IntoIterator<Item = &'a EventRecord>,
) -> SerializedEvents {
    let mut text = String::new();
    let mut skipped = 0;
    for record in events {
        if let Err(e) = record.write_wire(&mut text) {
            warn!(
                "[SESSION] Skipping unserializable record for {}: {}",
                token, e
            );
            skipped += 1;
        }
    }
    text.push_str(LINE_TERMINATOR);
    SerializedEvents { text, skipped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> EventRecord {
        EventRecord::from_fields([("Event", format!("E{}", n))])
    }

    #[test]
    fn test_blank_token_is_generated() {
        let session = Session::new("   ");
        assert!(!session
            .token()
            .is_empty());
        assert_ne!(session.token(), Session::new("").token());
    }

    #[tokio::test]
    async fn test_token_is_trimmed_and_name_defaults_to_it() {
        let session = Session::new("  abc \r\n");
        assert_eq!(session.token(), "abc");
        assert_eq!(session.name().await, "abc");
        session
            .set_name("Reception")
            .await;
        assert_eq!(session.name().await, "Reception");
    }

    #[tokio::test]
    async fn test_events_keep_fifo_order() {
        let session = Session::new("t");
        for n in 0..50 {
            session
                .add_event(record(n))
                .await;
        }
        let names: Vec<String> = session
            .events()
            .await
            .iter()
            .map(|r| {
                r.event_name()
                    .unwrap()
                    .to_string()
            })
            .collect();
        let expected: Vec<String> = (0..50)
            .map(|n| format!("E{}", n))
            .collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_events_as_string_layout() {
        let session = Session::new("t");
        session
            .add_event(EventRecord::from_fields([("Response", "Success"), ("ActionID", "t")]))
            .await;
        session
            .add_event(EventRecord::from_fields([("Event", "FullyBooted")]))
            .await;

        let out = session
            .events_as_string()
            .await;
        assert_eq!(out.skipped, 0);
        assert_eq!(
            out.text,
            "Response:Success\r\nActionID:t\r\n\r\nEvent:FullyBooted\r\n\r\n\r\n"
        );
        assert_eq!(session.pending_events().await, 2, "read must not drain");
    }

    #[tokio::test]
    async fn test_empty_queue_serializes_to_blank_line() {
        let session = Session::new("t");
        let out = session
            .events_as_string()
            .await;
        assert_eq!(out.text, "\r\n");
        assert!(out
            .anomaly()
            .is_none());
    }

    #[tokio::test]
    async fn test_anomaly_does_not_abort_serialization() {
        let session = Session::new("t");
        session
            .add_event(record(1))
            .await;
        session
            .add_event(EventRecord::from_fields([("Bad", "line\nbreak")]))
            .await;
        session
            .add_event(record(2))
            .await;

        let out = session
            .events_as_string()
            .await;
        assert_eq!(out.skipped, 1);
        assert_eq!(out.text, "Event:E1\r\n\r\nEvent:E2\r\n\r\n\r\n");
        assert!(matches!(
            out.anomaly(),
            Some(BridgeError::SerializationAnomaly { count: 1 })
        ));
    }

    #[tokio::test]
    async fn test_take_drains_queue() {
        let session = Session::new("t");
        session
            .add_event(record(1))
            .await;
        let out = session
            .take_events_as_string()
            .await;
        assert_eq!(out.text, "Event:E1\r\n\r\n\r\n");
        assert_eq!(session.pending_events().await, 0);

        session
            .add_event(record(2))
            .await;
        session
            .clear_events()
            .await;
        assert_eq!(session.pending_events().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_activity_resets_idle_time() {
        let session = Session::new("t");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            session
                .idle_for(Instant::now())
                .await,
            Duration::from_secs(30)
        );

        session
            .update_activity()
            .await;
        assert_eq!(
            session
                .idle_for(Instant::now())
                .await,
            Duration::ZERO
        );
    }
}
