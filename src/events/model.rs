//! Event data model and the observer wire protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::leads::model::Lead;
use crate::meetings::Meeting;
use crate::pipeline::types::{PipelineRun, Stage};

/// What kind of state change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LeadFound,
    LeadUpdated,
    RunStarted,
    StageCompleted,
    CallOutcomeClassified,
    EmailSent,
    ReplyReceived,
    MeetingScheduled,
    PipelineFailed,
    /// Durable-store writes were exhausted; in-memory state is ahead of the store.
    PersistenceFailed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LeadFound => "lead_found",
            Self::LeadUpdated => "lead_updated",
            Self::RunStarted => "run_started",
            Self::StageCompleted => "stage_completed",
            Self::CallOutcomeClassified => "call_outcome_classified",
            Self::EmailSent => "email_sent",
            Self::ReplyReceived => "reply_received",
            Self::MeetingScheduled => "meeting_scheduled",
            Self::PipelineFailed => "pipeline_failed",
            Self::PersistenceFailed => "persistence_failed",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of the entity an event is about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entity", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Lead(Lead),
    Run(Box<PipelineRun>),
    Meeting(Meeting),
    Reply(ReplyNotice),
    Failure(FailureNotice),
}

/// An inbound reply that was routed (or deliberately ignored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyNotice {
    pub message_id: String,
    #[serde(default)]
    pub lead_id: Option<String>,
    pub from: String,
    /// Classified intent, `None` when the message was ignored before classification.
    #[serde(default)]
    pub intent: Option<String>,
    /// Short human-readable note on what the router did with the message.
    pub action: String,
}

/// Structured failure: what failed, where, and with which error class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNotice {
    /// Pipeline stage that failed; `None` for reply- or store-scoped failures.
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub lead_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    /// Inbound message the failure is scoped to, if any.
    #[serde(default)]
    pub message_id: Option<String>,
    pub error_class: String,
    pub message: String,
}

/// An immutable, sequenced state-change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing, assigned by the bus at publish time.
    pub seq: u64,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Lead identity this event concerns, if any.
    pub fn lead_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Lead(lead) => Some(&lead.place_id),
            EventPayload::Run(run) => Some(&run.lead_id),
            EventPayload::Meeting(meeting) => Some(&meeting.lead_id),
            EventPayload::Reply(reply) => reply.lead_id.as_deref(),
            EventPayload::Failure(failure) => failure.lead_id.as_deref(),
        }
    }
}

/// Item yielded by a bus subscription.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Event),
    /// The subscriber fell behind (or resumed past the backlog) and lost
    /// `missed` events. Local state must be refreshed from a snapshot.
    Resync { missed: u64 },
}

/// Messages sent from server to observer over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Full registry contents as of event `seq`; live events follow from `seq + 1`.
    Snapshot { seq: u64, leads: Vec<Lead> },
    Event { event: Event },
    Resync { missed: u64 },
    Pong,
}

/// Messages sent from observer to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    /// Request a fresh snapshot (the answer to a `resync`).
    Sync,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_event_message_shape() {
        let event = Event {
            seq: 7,
            kind: EventKind::LeadFound,
            payload: EventPayload::Lead(Lead::new("p1", "Joe's Cafe")),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(WsMessage::Event { event }).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["seq"], 7);
        assert_eq!(json["event"]["kind"], "lead_found");
        assert_eq!(json["event"]["payload"]["entity"], "lead");
        assert_eq!(json["event"]["payload"]["data"]["place_id"], "p1");
    }

    #[test]
    fn client_messages_parse() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));
        let sync: ClientMessage = serde_json::from_str(r#"{"type":"sync"}"#).unwrap();
        assert!(matches!(sync, ClientMessage::Sync));
    }

    #[test]
    fn failure_event_carries_lead_id() {
        let event = Event {
            seq: 1,
            kind: EventKind::PipelineFailed,
            payload: EventPayload::Failure(FailureNotice {
                stage: Some(Stage::Emailing),
                lead_id: Some("p1".into()),
                run_id: None,
                message_id: None,
                error_class: "transient".into(),
                message: "smtp 451".into(),
            }),
            timestamp: Utc::now(),
        };
        assert_eq!(event.lead_id(), Some("p1"));
        assert_eq!(event.kind.to_string(), "pipeline_failed");
    }
}
