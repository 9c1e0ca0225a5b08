//! Meetings booked from inbound replies.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capabilities::retry::RetryPolicy;
use crate::capabilities::types::{CalendarLinks, Slot};
use crate::error::{AdapterError, StoreError};
use crate::events::bus::EventBus;
use crate::events::model::{EventKind, EventPayload, FailureNotice};
use crate::pipeline::types::Stage;
use crate::store::DurableStore;

const STORE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Proposed,
    Confirmed,
    Cancelled,
}

/// A meeting created by reply handling. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub lead_id: String,
    /// Run that was awaiting the reply; `None` for a reply with no prior run.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub calendar_link: String,
    pub video_link: String,
    pub status: MeetingStatus,
    pub attendee_email: String,
    /// Inbound message that produced this meeting.
    #[serde(default)]
    pub source_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Meeting {
    pub fn confirmed(
        lead_id: impl Into<String>,
        run_id: Option<Uuid>,
        slot: Slot,
        links: CalendarLinks,
        attendee_email: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id: lead_id.into(),
            run_id,
            start: slot.start,
            end: slot.end,
            calendar_link: links.calendar_link,
            video_link: links.video_link,
            status: MeetingStatus::Confirmed,
            attendee_email: attendee_email.into(),
            source_message_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Append-only record of booked meetings.
pub struct MeetingBook {
    meetings: RwLock<Vec<Meeting>>,
    store: Arc<dyn DurableStore>,
    bus: EventBus,
    retry: RetryPolicy,
}

impl MeetingBook {
    pub fn new(store: Arc<dyn DurableStore>, bus: EventBus, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            meetings: RwLock::new(Vec::new()),
            store,
            bus,
            retry,
        })
    }

    /// Load previously booked meetings from the store.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let loaded = self.store.load_meetings().await?;
        let count = loaded.len();
        *self.meetings.write().await = loaded;
        info!(count, "Meetings hydrated from store");
        Ok(count)
    }

    /// Record a new meeting.
    ///
    /// The in-memory book is always updated; a store write that exhausts its
    /// retries publishes `persistence_failed`.
    pub async fn record(&self, meeting: Meeting) {
        self.persist(&meeting).await;
        info!(
            meeting_id = %meeting.id,
            lead_id = %meeting.lead_id,
            start = %meeting.start,
            "Meeting recorded"
        );
        self.meetings.write().await.push(meeting);
    }

    async fn persist(&self, meeting: &Meeting) {
        let store = self.store.clone();
        let result = self
            .retry
            .run("store", STORE_TIMEOUT, || {
                let store = store.clone();
                async move {
                    store
                        .put_meeting(meeting)
                        .await
                        .map_err(|e| AdapterError::transient("store", e.to_string()))
                }
            })
            .await;

        if let Err(e) = result {
            warn!(meeting_id = %meeting.id, error = %e, "Meeting persistence exhausted retries");
            self.bus.publish(
                EventKind::PersistenceFailed,
                EventPayload::Failure(FailureNotice {
                    stage: Some(Stage::Scheduling),
                    lead_id: Some(meeting.lead_id.clone()),
                    run_id: meeting.run_id,
                    message_id: meeting.source_message_id.clone(),
                    error_class: "persistence".into(),
                    message: e.to_string(),
                }),
            );
        }
    }

    pub async fn list(&self) -> Vec<Meeting> {
        self.meetings.read().await.clone()
    }

    pub async fn for_lead(&self, lead_id: &str) -> Vec<Meeting> {
        self.meetings
            .read()
            .await
            .iter()
            .filter(|m| m.lead_id == lead_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::Delivery;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    fn links() -> CalendarLinks {
        CalendarLinks {
            event_id: "evt1".into(),
            calendar_link: "https://calendar.example.com/evt1".into(),
            video_link: "https://meet.example.com/evt1".into(),
        }
    }

    fn tomorrow() -> Slot {
        let start = Utc::now() + ChronoDuration::days(1);
        Slot {
            start,
            end: start + ChronoDuration::minutes(30),
        }
    }

    fn make_book(store: Arc<MemoryStore>) -> (Arc<MeetingBook>, EventBus) {
        let bus = EventBus::default();
        (
            MeetingBook::new(store, bus.clone(), RetryPolicy::immediate(3)),
            bus,
        )
    }

    #[tokio::test]
    async fn record_persists_and_lists() {
        let store = Arc::new(MemoryStore::new());
        let (book, _bus) = make_book(store.clone());
        book.record(Meeting::confirmed("p1", None, tomorrow(), links(), "joe@cafe.com"))
            .await;

        assert_eq!(book.for_lead("p1").await.len(), 1);
        assert!(book.for_lead("p2").await.is_empty());

        let (reloaded, _bus) = make_book(store);
        assert_eq!(reloaded.hydrate().await.unwrap(), 1);
        assert_eq!(reloaded.list().await[0].status, MeetingStatus::Confirmed);
    }

    #[tokio::test]
    async fn transient_store_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_writes(2);
        let (book, bus) = make_book(store.clone());
        book.record(Meeting::confirmed("p1", None, tomorrow(), links(), "joe@cafe.com"))
            .await;

        assert_eq!(store.load_meetings().await.unwrap().len(), 1);
        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn exhausted_store_retries_publish_failure() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_writes(3);
        let (book, bus) = make_book(store.clone());
        let run_id = Uuid::new_v4();
        let mut meeting = Meeting::confirmed("p1", Some(run_id), tomorrow(), links(), "joe@cafe.com");
        meeting.source_message_id = Some("m1".into());
        book.record(meeting).await;

        assert_eq!(book.for_lead("p1").await.len(), 1);
        assert!(store.load_meetings().await.unwrap().is_empty());

        let mut sub = bus.subscribe();
        let Some(Delivery::Event(event)) = sub.try_recv() else {
            panic!("expected a persistence_failed event");
        };
        assert_eq!(event.kind, EventKind::PersistenceFailed);
        let EventPayload::Failure(failure) = event.payload else {
            panic!("persistence_failed without a failure payload");
        };
        assert_eq!(failure.run_id, Some(run_id));
        assert_eq!(failure.message_id.as_deref(), Some("m1"));
        assert_eq!(failure.error_class, "persistence");
    }
}
