//! In-process capability implementations.
//!
//! Selected when no live credentials are configured, and used throughout the
//! tests. Every fake counts its calls and carries a [`FaultPlan`] so tests can
//! script failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use uuid::Uuid;

use super::types::*;
use crate::error::AdapterError;
use crate::leads::model::Lead;
use crate::pipeline::types::CallOutcome;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Fault injection ─────────────────────────────────────────────────

/// Scripted failures for one fake operation.
#[derive(Debug, Default)]
pub struct FaultPlan {
    queued: Mutex<VecDeque<AdapterError>>,
    always: Mutex<Option<AdapterError>>,
}

impl FaultPlan {
    /// Fail the next call with `err` (queued faults are consumed in order).
    pub fn fail_next(&self, err: AdapterError) {
        lock(&self.queued).push_back(err);
    }

    /// Fail every call with `err` until [`clear`](Self::clear).
    pub fn fail_always(&self, err: AdapterError) {
        *lock(&self.always) = Some(err);
    }

    pub fn clear(&self) {
        lock(&self.queued).clear();
        *lock(&self.always) = None;
    }

    pub fn check(&self) -> AdapterResult<()> {
        if let Some(err) = lock(&self.queued).pop_front() {
            return Err(err);
        }
        match &*lock(&self.always) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct Calls(AtomicUsize);

impl Calls {
    fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Search ──────────────────────────────────────────────────────────

/// Lead search over scripted pages, or generated sample businesses.
#[derive(Debug, Default)]
pub struct FakeSearch {
    pages: Option<Vec<Vec<Lead>>>,
    pub faults: FaultPlan,
    calls: Calls,
}

impl FakeSearch {
    /// Serve `pages` in order; the page token is the page index.
    pub fn with_pages(pages: Vec<Vec<Lead>>) -> Self {
        Self {
            pages: Some(pages),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    fn sample_leads(area: &str, filters: &SearchFilters) -> Vec<Lead> {
        let city = area.split(',').next().unwrap_or(area).trim().to_string();
        let slug: String = city
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        [
            ("Corner Bistro", "555-0101", 4.6),
            ("Golden Spoon Diner", "555-0102", 4.2),
            ("Harbor Noodle House", "555-0103", 4.8),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, (name, phone, rating))| {
            Lead::new(format!("mock-{slug}-{i}"), name)
                .with_city(city.clone())
                .with_address(format!("{} Main St, {area}", 100 + i))
                .with_phone(phone)
                .with_rating(rating)
                .with_category(filters.category.clone())
        })
        .collect()
    }
}

#[async_trait]
impl LeadSearch for FakeSearch {
    async fn search_leads(
        &self,
        area: &str,
        filters: &SearchFilters,
        page: Option<&str>,
    ) -> AdapterResult<SearchPage> {
        self.calls.hit();
        self.faults.check()?;

        let Some(pages) = &self.pages else {
            return Ok(SearchPage {
                leads: Self::sample_leads(area, filters),
                next_page: None,
                degraded: true,
            });
        };

        let idx: usize = match page {
            Some(token) => token
                .parse()
                .map_err(|_| AdapterError::semantic("search", format!("bad page token {token}")))?,
            None => 0,
        };
        let leads = pages.get(idx).cloned().unwrap_or_default();
        let next_page = (idx + 1 < pages.len()).then(|| (idx + 1).to_string());
        Ok(SearchPage {
            leads,
            next_page,
            degraded: false,
        })
    }
}

// ── Research / drafting ─────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FakeResearch {
    pub faults: FaultPlan,
    calls: Calls,
}

impl FakeResearch {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl Research for FakeResearch {
    async fn research(&self, lead: &Lead) -> AdapterResult<String> {
        self.calls.hit();
        self.faults.check()?;
        let rating = lead
            .rating
            .map(|r| format!(" rated {r:.1}"))
            .unwrap_or_default();
        let presence = if lead.has_website {
            "has a basic website"
        } else {
            "has no website"
        };
        Ok(format!(
            "{} is a local {}{rating} in {} that {presence}.",
            lead.name,
            if lead.category.is_empty() { "business" } else { lead.category.as_str() },
            if lead.city.is_empty() { "town" } else { lead.city.as_str() },
        ))
    }
}

#[derive(Debug, Default)]
pub struct FakeWriter {
    pub faults: FaultPlan,
    pub check_faults: FaultPlan,
    calls: Calls,
}

impl FakeWriter {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl ProposalWriter for FakeWriter {
    async fn draft_proposal(&self, lead: &Lead, research: &str) -> AdapterResult<String> {
        self.calls.hit();
        self.faults.check()?;
        Ok(format!(
            "Hi {}, {research} We build fast, mobile-friendly websites for businesses like yours \
             so new customers can find your menu, hours and reviews online.",
            lead.name
        ))
    }

    async fn fact_check(&self, _lead: &Lead, draft: &str) -> AdapterResult<FactCheck> {
        self.check_faults.check()?;
        Ok(FactCheck {
            verdict: FactVerdict::Accurate,
            text: draft.to_string(),
        })
    }
}

// ── Telephony ───────────────────────────────────────────────────────

const DEFAULT_TRANSCRIPT: &str = "Agent: Hi, this is RapidReach calling about a website for your business.\n\
     Owner: Oh sure, we've been meaning to get one.\n\
     Agent: Could I send you a short proposal by email?\n\
     Owner: Yes, my email is joe at joescafe dot com.\n\
     Agent: Great. Would a quick follow-up on Wednesday at 11 work?\n\
     Owner: Wednesday at 11 works.";

/// Telephony that "completes" each call with a scripted transcript.
#[derive(Debug)]
pub struct FakeTelephony {
    transcript: Mutex<String>,
    /// Polls answered with `InProgress` before the transcript is ready.
    pending_polls: Mutex<u32>,
    pub faults: FaultPlan,
    pub poll_faults: FaultPlan,
    calls: Calls,
}

impl Default for FakeTelephony {
    fn default() -> Self {
        Self {
            transcript: Mutex::new(DEFAULT_TRANSCRIPT.to_string()),
            pending_polls: Mutex::new(0),
            faults: FaultPlan::default(),
            poll_faults: FaultPlan::default(),
            calls: Calls::default(),
        }
    }
}

impl FakeTelephony {
    pub fn with_transcript(transcript: impl Into<String>) -> Self {
        let fake = Self::default();
        *lock(&fake.transcript) = transcript.into();
        fake
    }

    /// Answer the next `n` polls with `InProgress`.
    pub fn set_pending_polls(&self, n: u32) {
        *lock(&self.pending_polls) = n;
    }

    /// Number of calls placed.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl Telephony for FakeTelephony {
    async fn place_call(&self, lead: &Lead, _script: &str) -> AdapterResult<CallHandle> {
        self.calls.hit();
        self.faults.check()?;
        Ok(CallHandle {
            call_id: format!("call-{}", Uuid::new_v4()),
            phone: lead.phone.clone(),
        })
    }

    async fn fetch_transcript(&self, _handle: &CallHandle) -> AdapterResult<CallStatus> {
        self.poll_faults.check()?;
        let mut pending = lock(&self.pending_polls);
        if *pending > 0 {
            *pending -= 1;
            return Ok(CallStatus::InProgress);
        }
        Ok(CallStatus::Completed {
            transcript: lock(&self.transcript).clone(),
        })
    }
}

/// Keyword classifier, or a forced answer.
#[derive(Debug, Default)]
pub struct FakeOutcomeClassifier {
    forced: Mutex<Option<Classified<CallOutcome>>>,
    pub faults: FaultPlan,
    calls: Calls,
}

impl FakeOutcomeClassifier {
    pub fn force(&self, answer: Classified<CallOutcome>) {
        *lock(&self.forced) = Some(answer);
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl OutcomeClassifier for FakeOutcomeClassifier {
    async fn classify_outcome(&self, transcript: &str) -> AdapterResult<Classified<CallOutcome>> {
        self.calls.hit();
        self.faults.check()?;
        if let Some(forced) = lock(&self.forced).clone() {
            return Ok(forced);
        }
        let lower = transcript.to_lowercase();
        let outcome = if lower.contains("not interested") || lower.contains("no thanks") {
            CallOutcome::NotInterested
        } else if lower.contains("email") {
            CallOutcome::AgreedToEmail
        } else if lower.contains("interested") || lower.contains("sure") {
            CallOutcome::Interested
        } else {
            CallOutcome::Unknown
        };
        Ok(Classified::parsed(outcome))
    }
}

// ── Artifact / e-mail ───────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FakeArtifacts {
    pub faults: FaultPlan,
    calls: Calls,
}

impl FakeArtifacts {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl ArtifactGenerator for FakeArtifacts {
    async fn generate_artifact(&self, lead: &Lead, proposal: &str) -> AdapterResult<ArtifactRef> {
        self.calls.hit();
        self.faults.check()?;
        let body = format!("%PDF-1.4\n% Proposal for {}\n{proposal}\n%%EOF\n", lead.name);
        let slug: String = lead
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        Ok(ArtifactRef::new(
            format!("{slug}_proposal.pdf"),
            "application/pdf",
            body.into_bytes(),
        ))
    }
}

/// Mailer that keeps every sent message in memory.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    pub faults: FaultPlan,
    calls: Calls,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<OutboundEmail> {
        lock(&self.sent).clone()
    }

    /// Send attempts, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send_email(&self, email: &OutboundEmail) -> AdapterResult<DeliveryReceipt> {
        self.calls.hit();
        self.faults.check()?;
        lock(&self.sent).push(email.clone());
        Ok(DeliveryReceipt {
            message_id: format!("<{}@rapidreach.local>", Uuid::new_v4()),
            recipient: email.to.clone(),
            sent_at: Utc::now(),
        })
    }
}

// ── Inbox ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Mailbox {
    messages: HashMap<String, InboundEmail>,
    /// Arrival order.
    order: Vec<String>,
    unread: Vec<String>,
    reads: HashMap<String, usize>,
}

/// In-memory mailbox.
#[derive(Debug, Default)]
pub struct FakeInbox {
    mailbox: Mutex<Mailbox>,
    pub faults: FaultPlan,
    pub list_faults: FaultPlan,
}

impl FakeInbox {
    /// Drop a new unread message into the mailbox.
    pub fn deliver(&self, message: InboundEmail) {
        let mut mb = lock(&self.mailbox);
        if !mb.messages.contains_key(&message.id) {
            mb.order.push(message.id.clone());
        }
        if !mb.unread.contains(&message.id) {
            mb.unread.push(message.id.clone());
        }
        mb.messages.insert(message.id.clone(), message);
    }

    pub fn read_count(&self, id: &str) -> usize {
        lock(&self.mailbox).reads.get(id).copied().unwrap_or(0)
    }

    pub fn is_unread(&self, id: &str) -> bool {
        lock(&self.mailbox).unread.iter().any(|u| u == id)
    }
}

#[async_trait]
impl Inbox for FakeInbox {
    async fn list_unread(&self) -> AdapterResult<Vec<String>> {
        self.list_faults.check()?;
        Ok(lock(&self.mailbox).unread.clone())
    }

    async fn read_message(&self, id: &str) -> AdapterResult<InboundEmail> {
        self.faults.check()?;
        let mut mb = lock(&self.mailbox);
        let message = mb
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::semantic("inbox", format!("no message {id}")))?;
        *mb.reads.entry(id.to_string()).or_default() += 1;
        Ok(message)
    }

    async fn mark_read(&self, id: &str) -> AdapterResult<()> {
        lock(&self.mailbox).unread.retain(|u| u != id);
        Ok(())
    }
}

/// Keyword reply classifier, or a forced answer.
#[derive(Debug, Default)]
pub struct FakeReplyClassifier {
    forced: Mutex<Option<Classified<ReplyIntent>>>,
    per_message: Mutex<HashMap<String, usize>>,
    pub faults: FaultPlan,
}

impl FakeReplyClassifier {
    pub fn force(&self, answer: Classified<ReplyIntent>) {
        *lock(&self.forced) = Some(answer);
    }

    /// Classifications attempted for one message.
    pub fn count_for(&self, message_id: &str) -> usize {
        lock(&self.per_message).get(message_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ReplyClassifier for FakeReplyClassifier {
    async fn classify_reply(&self, email: &InboundEmail) -> AdapterResult<Classified<ReplyIntent>> {
        *lock(&self.per_message).entry(email.id.clone()).or_default() += 1;
        self.faults.check()?;
        if let Some(forced) = lock(&self.forced).clone() {
            return Ok(forced);
        }
        let text = format!("{} {}", email.subject, email.body).to_lowercase();
        let intent = if text.contains("not interested") || text.contains("unsubscribe") {
            ReplyIntent::NotInterested
        } else if ["meet", "call", "schedule", "book", "available"]
            .iter()
            .any(|kw| text.contains(kw))
        {
            ReplyIntent::MeetingRequest {
                preferred_time: None,
            }
        } else if text.contains("interested") || text.contains("tell me more") {
            ReplyIntent::Interested
        } else {
            ReplyIntent::Other
        };
        Ok(Classified::parsed(intent))
    }
}

// ── Calendar ────────────────────────────────────────────────────────

/// Calendar with either scripted free slots or a free weekday 9-17 grid.
#[derive(Debug, Default)]
pub struct FakeCalendar {
    slots: Option<Vec<Slot>>,
    created: Mutex<Vec<(Slot, String, Vec<String>)>>,
    pub faults: FaultPlan,
    pub create_faults: FaultPlan,
}

impl FakeCalendar {
    pub fn with_slots(slots: Vec<Slot>) -> Self {
        Self {
            slots: Some(slots),
            ..Default::default()
        }
    }

    /// Events created so far: slot, title, attendees.
    pub fn created(&self) -> Vec<(Slot, String, Vec<String>)> {
        lock(&self.created).clone()
    }

    fn weekday_grid(window: &Slot) -> Vec<Slot> {
        let mut slots = Vec::new();
        let Some(mut cursor) = Utc
            .with_ymd_and_hms(
                window.start.year(),
                window.start.month(),
                window.start.day(),
                9,
                0,
                0,
            )
            .single()
        else {
            return slots;
        };
        while cursor < window.end {
            let weekend = matches!(cursor.weekday(), Weekday::Sat | Weekday::Sun);
            if !weekend && (9..17).contains(&cursor.hour()) && cursor >= window.start {
                slots.push(Slot {
                    start: cursor,
                    end: cursor + Duration::minutes(30),
                });
            }
            cursor += Duration::minutes(30);
        }
        slots
    }
}

#[async_trait]
impl Calendar for FakeCalendar {
    async fn check_availability(&self, window: &Slot) -> AdapterResult<Vec<Slot>> {
        self.faults.check()?;
        Ok(match &self.slots {
            Some(slots) => slots
                .iter()
                .filter(|s| s.start >= window.start && s.end <= window.end)
                .copied()
                .collect(),
            None => Self::weekday_grid(window),
        })
    }

    async fn create_event(
        &self,
        slot: &Slot,
        title: &str,
        attendees: &[String],
    ) -> AdapterResult<CalendarLinks> {
        self.create_faults.check()?;
        let id = Uuid::new_v4().simple().to_string();
        lock(&self.created).push((*slot, title.to_string(), attendees.to_vec()));
        Ok(CalendarLinks {
            calendar_link: format!("https://calendar.example.com/event/{id}"),
            video_link: format!("https://meet.example.com/{id}"),
            event_id: id,
        })
    }
}
