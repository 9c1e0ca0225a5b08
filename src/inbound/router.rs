//! Inbound notification router.
//!
//! Push notifications and inbox polls both land in [`InboundRouter::route`],
//! which dedups by message id before doing any work:
//! 1. `Inbox::read_message()`: fetch the reply
//! 2. self-loop and sender checks: our own mail and unknown senders are dropped
//! 3. `ReplyClassifier::classify_reply()`: intent, unparseable → `other`
//! 4. act on the intent: book a meeting, mark hot, or close the run
//! 5. `Inbox::mark_read()`: only after the message was fully handled
//!
//! Any failure before step 5 leaves the message unread (and out of the
//! recently-seen set) so a later poll retries it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::scheduling::{availability_window, pick_slot};
use crate::capabilities::Capabilities;
use crate::capabilities::retry::RetryPolicy;
use crate::capabilities::types::{CalendarLinks, Classified, InboundEmail, ReplyIntent, Slot};
use crate::config::{RouterConfig, SchedulingConfig};
use crate::error::{PipelineError, RouterError};
use crate::events::bus::EventBus;
use crate::events::model::{EventKind, EventPayload, FailureNotice, ReplyNotice};
use crate::leads::model::{Lead, LeadStatus};
use crate::leads::registry::LeadRegistry;
use crate::meetings::{Meeting, MeetingBook};
use crate::pipeline::manager::RunManager;
use crate::pipeline::types::Stage;

// ── Recently seen ───────────────────────────────────────────────────

/// Bounded, expiring set of handled message ids plus the ids currently
/// being handled.
struct RecentlySeen {
    capacity: usize,
    ttl: Duration,
    seen: HashMap<String, Instant>,
    order: VecDeque<String>,
    in_flight: HashSet<String>,
}

impl RecentlySeen {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            seen: HashMap::new(),
            order: VecDeque::new(),
            in_flight: HashSet::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.order.front() {
            let expired = self
                .seen
                .get(oldest)
                .is_none_or(|at| now.duration_since(*at) >= self.ttl);
            if !expired && self.order.len() <= self.capacity {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.seen.remove(&id);
            }
        }
    }

    /// Claim `id` for handling. `false` if it was handled recently or is
    /// being handled right now.
    fn claim(&mut self, id: &str, now: Instant) -> bool {
        self.prune(now);
        if self.seen.contains_key(id) || self.in_flight.contains(id) {
            return false;
        }
        self.in_flight.insert(id.to_string());
        true
    }

    /// Release a claim. Handled ids are remembered; failed ones may be retried.
    fn release(&mut self, id: &str, handled: bool, now: Instant) {
        self.in_flight.remove(id);
        if handled && self.seen.insert(id.to_string(), now).is_none() {
            self.order.push_back(id.to_string());
        }
        self.prune(now);
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// What the router did with one message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Already handled (or being handled) through the other channel.
    Duplicate,
    /// Sent from our own address.
    SelfMessage,
    /// No lead has the sender's address.
    UnknownSender,
    /// The lead already has a meeting; the reply is logged and ignored.
    AlreadyScheduled,
    Scheduled(Box<Meeting>),
    StatusChanged(LeadStatus),
    NoAction,
}

impl RouteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::SelfMessage => "self_message",
            Self::UnknownSender => "unknown_sender",
            Self::AlreadyScheduled => "already_scheduled",
            Self::Scheduled(_) => "meeting_scheduled",
            Self::StatusChanged(_) => "status_changed",
            Self::NoAction => "no_action",
        }
    }
}

/// Summary of one inbox scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub listed: usize,
    pub handled: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Resets the scan flag when the scan ends, however it ends.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pull the bare address out of `Name <addr@host>`.
pub fn sender_address(from: &str) -> String {
    let from = from.trim();
    let addr = match (from.rfind('<'), from.rfind('>')) {
        (Some(open), Some(close)) if open < close => &from[open + 1..close],
        _ => from,
    };
    addr.trim().trim_matches('"').to_lowercase()
}

// ── Router ──────────────────────────────────────────────────────────

pub struct InboundRouter {
    caps: Capabilities,
    registry: Arc<LeadRegistry>,
    runs: Arc<RunManager>,
    meetings: Arc<MeetingBook>,
    bus: EventBus,
    config: RouterConfig,
    scheduling: SchedulingConfig,
    retry: RetryPolicy,
    timeout: Duration,
    seen: Mutex<RecentlySeen>,
    /// Serialises reply handling per lead so one lead books at most once.
    lead_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    scanning: AtomicBool,
}

impl InboundRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        caps: Capabilities,
        registry: Arc<LeadRegistry>,
        runs: Arc<RunManager>,
        meetings: Arc<MeetingBook>,
        bus: EventBus,
        config: RouterConfig,
        scheduling: SchedulingConfig,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Arc<Self> {
        let seen = RecentlySeen::new(config.dedup_capacity, config.dedup_window);
        Arc::new(Self {
            caps,
            registry,
            runs,
            meetings,
            bus,
            config,
            scheduling,
            retry,
            timeout,
            seen: Mutex::new(seen),
            lead_locks: Mutex::new(HashMap::new()),
            scanning: AtomicBool::new(false),
        })
    }

    fn lead_lock(&self, place_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lead_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(place_id.to_string())
            .or_default()
            .clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Push channel: a notification naming one message.
    pub async fn notify(&self, message_id: &str) -> Result<RouteOutcome, RouterError> {
        debug!(message_id, "Push notification received");
        self.route(message_id).await
    }

    /// Poll channel: scan the inbox once. Rejected while another scan runs.
    pub async fn scan(&self) -> Result<ScanReport, RouterError> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RouterError::ScanInProgress);
        }
        let _guard = ScanGuard(&self.scanning);

        let inbox = &self.caps.inbox;
        let ids = self
            .retry
            .run("inbox", self.timeout, || inbox.list_unread())
            .await
            .map_err(RouterError::List)?;

        let mut report = ScanReport {
            listed: ids.len(),
            ..Default::default()
        };
        for id in &ids {
            match self.route(id).await {
                Ok(RouteOutcome::Duplicate) => report.duplicates += 1,
                Ok(_) => report.handled += 1,
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Reply left unread for retry");
                    report.failed += 1;
                }
            }
        }
        if report.listed > 0 {
            info!(
                listed = report.listed,
                handled = report.handled,
                duplicates = report.duplicates,
                failed = report.failed,
                "Inbox scan finished"
            );
        }
        Ok(report)
    }

    /// Route one message, at most once per dedup window.
    pub async fn route(&self, message_id: &str) -> Result<RouteOutcome, RouterError> {
        let claimed = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .claim(message_id, Instant::now());
        if !claimed {
            debug!(message_id, "Duplicate notification ignored");
            return Ok(RouteOutcome::Duplicate);
        }

        let result = self.handle(message_id).await;
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(message_id, result.is_ok(), Instant::now());
        result
    }

    async fn handle(&self, message_id: &str) -> Result<RouteOutcome, RouterError> {
        let inbox = &self.caps.inbox;
        let email = self
            .retry
            .run("inbox", self.timeout, || inbox.read_message(message_id))
            .await
            .map_err(|source| RouterError::Read {
                message_id: message_id.to_string(),
                source,
            })?;
        let sender = sender_address(&email.from);

        if let Some(own) = &self.config.sales_address
            && sender.eq_ignore_ascii_case(own.trim())
        {
            debug!(message_id, sender = %sender, "Skipping self-sent email");
            self.mark_read(message_id).await;
            return Ok(RouteOutcome::SelfMessage);
        }

        let Some(lead) = self.registry.find_by_email(&sender).await else {
            info!(message_id, sender = %sender, "Reply from unknown sender ignored");
            self.notice(&email, None, None, "ignored: no lead with this address");
            self.mark_read(message_id).await;
            return Ok(RouteOutcome::UnknownSender);
        };

        let lock = self.lead_lock(&lead.place_id);
        let _turn = lock.lock().await;
        // Another reply from this lead may have been handled while we waited.
        let lead = self.registry.get(&lead.place_id).await.unwrap_or(lead);

        if lead.status == LeadStatus::Scheduled {
            info!(message_id, lead_id = %lead.place_id, "Lead already scheduled, reply ignored");
            self.notice(&email, Some(&lead), None, "ignored: meeting already scheduled");
            self.mark_read(message_id).await;
            return Ok(RouteOutcome::AlreadyScheduled);
        }

        let classifier = &self.caps.replies;
        let intent = match self
            .retry
            .run("classify_reply", self.timeout, || classifier.classify_reply(&email))
            .await
            .map_err(|source| RouterError::Classify {
                message_id: message_id.to_string(),
                source,
            })? {
            Classified::Parsed { value } => value,
            Classified::Unparseable { raw } => {
                warn!(message_id, raw = %raw, "Unparseable reply intent, treating as other");
                ReplyIntent::Other
            }
        };
        info!(message_id, lead_id = %lead.place_id, intent = intent.label(), "Reply classified");

        let (outcome, action) = match &intent {
            ReplyIntent::MeetingRequest { preferred_time } => {
                let meeting = self.book(&email, &lead, *preferred_time).await?;
                let action = format!("meeting booked for {}", meeting.start.to_rfc3339());
                (RouteOutcome::Scheduled(Box::new(meeting)), action)
            }
            ReplyIntent::Interested => {
                self.registry.set_status(&lead.place_id, LeadStatus::HotLead).await;
                (
                    RouteOutcome::StatusChanged(LeadStatus::HotLead),
                    "lead marked hot".to_string(),
                )
            }
            ReplyIntent::NotInterested => {
                self.registry
                    .set_status(&lead.place_id, LeadStatus::NotInterested)
                    .await;
                match self.runs.decline(&lead.place_id).await {
                    Ok(_) | Err(PipelineError::NotAwaitingReply(_)) => {}
                    Err(e) => warn!(lead_id = %lead.place_id, error = %e, "Failed to close run"),
                }
                (
                    RouteOutcome::StatusChanged(LeadStatus::NotInterested),
                    "lead marked not interested".to_string(),
                )
            }
            ReplyIntent::Other => (RouteOutcome::NoAction, "no action".to_string()),
        };

        self.notice(&email, Some(&lead), Some(intent.label()), action);
        self.mark_read(message_id).await;
        Ok(outcome)
    }

    /// Book the earliest acceptable slot and resume the lead's parked run.
    async fn book(
        &self,
        email: &InboundEmail,
        lead: &Lead,
        preferred: Option<chrono::DateTime<Utc>>,
    ) -> Result<Meeting, RouterError> {
        let run_id = self
            .runs
            .active_run(&lead.place_id)
            .await
            .filter(|r| r.stage == Stage::AwaitingReply)
            .map(|r| r.id);

        let booked = self.reserve(email, lead, preferred).await;
        let (slot, links) = match booked {
            Ok(booked) => booked,
            Err(e) => {
                warn!(message_id = %email.id, lead_id = %lead.place_id, error = %e, "Meeting booking failed");
                self.bus.publish(
                    EventKind::PipelineFailed,
                    EventPayload::Failure(FailureNotice {
                        stage: Some(Stage::Scheduling),
                        lead_id: Some(lead.place_id.clone()),
                        run_id,
                        message_id: Some(email.id.clone()),
                        error_class: e.error_class().to_string(),
                        message: e.to_string(),
                    }),
                );
                return Err(e);
            }
        };

        let attendee = sender_address(&email.from);
        let mut meeting = Meeting::confirmed(&lead.place_id, run_id, slot, links, attendee);
        meeting.source_message_id = Some(email.id.clone());
        self.meetings.record(meeting.clone()).await;
        self.registry
            .set_status(&lead.place_id, LeadStatus::Scheduled)
            .await;

        match self.runs.complete_scheduling(&lead.place_id, &meeting).await {
            Ok(run) => debug!(run_id = %run.id, stage = %run.stage, "Run resumed after booking"),
            Err(PipelineError::NotAwaitingReply(_)) => {
                debug!(lead_id = %lead.place_id, "No parked run for booked lead");
            }
            Err(e) => warn!(lead_id = %lead.place_id, error = %e, "Failed to resume run"),
        }

        self.bus
            .publish(EventKind::MeetingScheduled, EventPayload::Meeting(meeting.clone()));
        Ok(meeting)
    }

    async fn reserve(
        &self,
        email: &InboundEmail,
        lead: &Lead,
        preferred: Option<chrono::DateTime<Utc>>,
    ) -> Result<(Slot, CalendarLinks), RouterError> {
        let calendar = &self.caps.calendar;
        let calendar_error = |source| RouterError::Calendar {
            message_id: email.id.clone(),
            source,
        };

        let now = Utc::now();
        let window = availability_window(now, &self.scheduling);
        let free = self
            .retry
            .run("calendar", self.timeout, || calendar.check_availability(&window))
            .await
            .map_err(calendar_error)?;

        let slot = pick_slot(&free, now, preferred, &self.scheduling).ok_or_else(|| {
            RouterError::NoSlot {
                message_id: email.id.clone(),
            }
        })?;

        let title = format!("RapidReach x {}", lead.name);
        let mut attendees = vec![sender_address(&email.from)];
        if let Some(own) = &self.config.sales_address {
            attendees.push(own.clone());
        }
        let links = self
            .retry
            .run("calendar", self.timeout, || {
                calendar.create_event(&slot, &title, &attendees)
            })
            .await
            .map_err(calendar_error)?;
        Ok((slot, links))
    }

    fn notice(
        &self,
        email: &InboundEmail,
        lead: Option<&Lead>,
        intent: Option<&str>,
        action: impl Into<String>,
    ) {
        self.bus.publish(
            EventKind::ReplyReceived,
            EventPayload::Reply(ReplyNotice {
                message_id: email.id.clone(),
                lead_id: lead.map(|l| l.place_id.clone()),
                from: email.from.clone(),
                intent: intent.map(str::to_string),
                action: action.into(),
            }),
        );
    }

    async fn mark_read(&self, message_id: &str) {
        let inbox = &self.caps.inbox;
        if let Err(e) = self
            .retry
            .run("inbox", self.timeout, || inbox.mark_read(message_id))
            .await
        {
            warn!(message_id, error = %e, "Failed to mark reply read");
        }
    }
}
