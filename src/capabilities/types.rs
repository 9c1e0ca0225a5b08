//! Capability contracts consumed by the orchestration core.
//!
//! Each trait wraps one external service. Implementations validate their
//! raw output at this boundary; loosely structured model output comes back
//! as [`Classified::Unparseable`] rather than leaking into pipeline logic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;
use crate::leads::model::Lead;
use crate::pipeline::types::CallOutcome;

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// A classifier answer, or the raw text when it did not parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Classified<T> {
    Parsed { value: T },
    Unparseable { raw: String },
}

impl<T> Classified<T> {
    pub fn parsed(value: T) -> Self {
        Self::Parsed { value }
    }

    pub fn unparseable(raw: impl Into<String>) -> Self {
        Self::Unparseable { raw: raw.into() }
    }
}

// ── Discovery ───────────────────────────────────────────────────────

/// Search filters for discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Business category used as the search term.
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub min_rating: Option<f64>,
    /// Keep only businesses without a website.
    #[serde(default)]
    pub only_without_website: bool,
}

fn default_category() -> String {
    "restaurants".into()
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            category: default_category(),
            min_rating: None,
            only_without_website: false,
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub leads: Vec<Lead>,
    /// Opaque token for the next page.
    pub next_page: Option<String>,
    /// The provider was unavailable and these are mock results.
    pub degraded: bool,
}

#[async_trait]
pub trait LeadSearch: Send + Sync {
    async fn search_leads(
        &self,
        area: &str,
        filters: &SearchFilters,
        page: Option<&str>,
    ) -> AdapterResult<SearchPage>;
}

// ── Research / drafting ─────────────────────────────────────────────

#[async_trait]
pub trait Research: Send + Sync {
    /// Short text summary of the business.
    async fn research(&self, lead: &Lead) -> AdapterResult<String>;
}

/// Fact-check verdict on a drafted proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactVerdict {
    Accurate,
    Revised,
    /// The checker could not be reached; the draft went out unverified.
    Unchecked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactCheck {
    pub verdict: FactVerdict,
    /// Text to use from here on (the draft itself when accurate).
    pub text: String,
}

#[async_trait]
pub trait ProposalWriter: Send + Sync {
    async fn draft_proposal(&self, lead: &Lead, research: &str) -> AdapterResult<String>;
    async fn fact_check(&self, lead: &Lead, draft: &str) -> AdapterResult<FactCheck>;
}

// ── Telephony ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHandle {
    pub call_id: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    InProgress,
    Completed { transcript: String },
    Failed { reason: String },
}

#[async_trait]
pub trait Telephony: Send + Sync {
    /// Start a call. The transcript is fetched separately by polling.
    async fn place_call(&self, lead: &Lead, script: &str) -> AdapterResult<CallHandle>;
    async fn fetch_transcript(&self, handle: &CallHandle) -> AdapterResult<CallStatus>;
}

#[async_trait]
pub trait OutcomeClassifier: Send + Sync {
    async fn classify_outcome(&self, transcript: &str) -> AdapterResult<Classified<CallOutcome>>;
}

// ── Artifact / e-mail ───────────────────────────────────────────────

/// A generated document. The bytes are not persisted with the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: usize,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl ArtifactRef {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            size_bytes: data.len(),
            data,
        }
    }
}

#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate_artifact(&self, lead: &Lead, proposal: &str) -> AdapterResult<ArtifactRef>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, email: &OutboundEmail) -> AdapterResult<DeliveryReceipt>;
}

// ── Inbox ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEmail {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait Inbox: Send + Sync {
    async fn list_unread(&self) -> AdapterResult<Vec<String>>;
    async fn read_message(&self, id: &str) -> AdapterResult<InboundEmail>;
    async fn mark_read(&self, id: &str) -> AdapterResult<()>;
}

/// What a reply asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ReplyIntent {
    MeetingRequest {
        #[serde(default)]
        preferred_time: Option<DateTime<Utc>>,
    },
    Interested,
    NotInterested,
    Other,
}

impl ReplyIntent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::MeetingRequest { .. } => "meeting_request",
            Self::Interested => "interested",
            Self::NotInterested => "not_interested",
            Self::Other => "other",
        }
    }
}

#[async_trait]
pub trait ReplyClassifier: Send + Sync {
    async fn classify_reply(&self, email: &InboundEmail) -> AdapterResult<Classified<ReplyIntent>>;
}

// ── Calendar ────────────────────────────────────────────────────────

/// A time range, used both as a query window and as a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarLinks {
    pub event_id: String,
    pub calendar_link: String,
    pub video_link: String,
}

#[async_trait]
pub trait Calendar: Send + Sync {
    async fn check_availability(&self, window: &Slot) -> AdapterResult<Vec<Slot>>;
    async fn create_event(
        &self,
        slot: &Slot,
        title: &str,
        attendees: &[String],
    ) -> AdapterResult<CalendarLinks>;
}
