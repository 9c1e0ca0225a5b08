//! End-to-end pipeline flows over the fake adapters: discovery → run →
//! reply → meeting, plus the failure and dedup paths.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc, Weekday};
use tokio::time::timeout;

use rapidreach::capabilities::Capabilities;
use rapidreach::capabilities::cooldown::CooldownTelephony;
use rapidreach::capabilities::fake::{
    FakeCalendar, FakeInbox, FakeReplyClassifier, FakeTelephony, RecordingMailer,
};
use rapidreach::capabilities::retry::RetryPolicy;
use rapidreach::capabilities::types::{InboundEmail, Slot};
use rapidreach::config::{PipelineConfig, RouterConfig, SchedulingConfig};
use rapidreach::error::{AdapterError, PipelineError};
use rapidreach::events::bus::EventBus;
use rapidreach::events::model::{Delivery, Event, EventKind, EventPayload};
use rapidreach::inbound::{InboundRouter, RouteOutcome};
use rapidreach::leads::model::{Lead, LeadStatus};
use rapidreach::leads::registry::LeadRegistry;
use rapidreach::meetings::MeetingBook;
use rapidreach::pipeline::{CallOutcome, PipelineRunner, RunLedger, RunManager, RunOptions, Stage};
use rapidreach::store::{DurableStore, MemoryStore};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct World {
    store: Arc<MemoryStore>,
    bus: EventBus,
    registry: Arc<LeadRegistry>,
    runs: Arc<RunManager>,
    router: Arc<InboundRouter>,
    meetings: Arc<MeetingBook>,
    telephony: Arc<FakeTelephony>,
    mailer: Arc<RecordingMailer>,
    inbox: Arc<FakeInbox>,
    replies: Arc<FakeReplyClassifier>,
    calendar: Arc<FakeCalendar>,
}

struct Fakes {
    telephony: Arc<FakeTelephony>,
    mailer: Arc<RecordingMailer>,
    inbox: Arc<FakeInbox>,
    replies: Arc<FakeReplyClassifier>,
    calendar: Arc<FakeCalendar>,
    /// Wrap the fake telephony in the per-number cooldown, as production does.
    call_cooldown: Option<Duration>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            telephony: Arc::new(FakeTelephony::default()),
            mailer: Arc::new(RecordingMailer::default()),
            inbox: Arc::new(FakeInbox::default()),
            replies: Arc::new(FakeReplyClassifier::default()),
            calendar: Arc::new(FakeCalendar::default()),
            call_cooldown: None,
        }
    }
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy::immediate(3),
        call_poll_interval: Duration::from_millis(1),
        call_poll_attempts: 5,
        ..Default::default()
    }
}

async fn world_on(store: Arc<MemoryStore>, fakes: Fakes, config: PipelineConfig) -> World {
    let bus = EventBus::default();
    let retry = RetryPolicy::immediate(2);

    let mut caps = Capabilities::fake();
    caps.telephony = match fakes.call_cooldown {
        Some(window) => Arc::new(CooldownTelephony::new(fakes.telephony.clone(), window)),
        None => fakes.telephony.clone(),
    };
    caps.email = fakes.mailer.clone();
    caps.inbox = fakes.inbox.clone();
    caps.replies = fakes.replies.clone();
    caps.calendar = fakes.calendar.clone();

    let registry = LeadRegistry::new(store.clone(), bus.clone(), retry);
    let ledger = RunLedger::new(store.clone(), bus.clone(), retry);
    let meetings = MeetingBook::new(store.clone(), bus.clone(), retry);
    registry.hydrate().await.unwrap();
    ledger.hydrate().await.unwrap();
    meetings.hydrate().await.unwrap();

    let router_config = RouterConfig {
        sales_address: Some("sales@rapidreach.test".into()),
        ..Default::default()
    };
    let runner = PipelineRunner::new(
        caps.clone(),
        registry.clone(),
        ledger.clone(),
        config,
        &SchedulingConfig::default(),
        router_config.sales_address.clone(),
    );
    let runs = RunManager::new(ledger, runner, registry.clone());
    let router = InboundRouter::new(
        caps,
        registry.clone(),
        runs.clone(),
        meetings.clone(),
        bus.clone(),
        router_config,
        SchedulingConfig::default(),
        retry,
        Duration::from_secs(5),
    );

    World {
        store,
        bus,
        registry,
        runs,
        router,
        meetings,
        telephony: fakes.telephony,
        mailer: fakes.mailer,
        inbox: fakes.inbox,
        replies: fakes.replies,
        calendar: fakes.calendar,
    }
}

async fn world(fakes: Fakes, config: PipelineConfig) -> World {
    world_on(Arc::new(MemoryStore::new()), fakes, config).await
}

fn events(bus: &EventBus) -> Vec<Event> {
    let mut sub = bus.subscribe();
    let mut out = Vec::new();
    while let Some(Delivery::Event(e)) = sub.try_recv() {
        out.push(e);
    }
    out
}

fn reply(id: &str, body: &str) -> InboundEmail {
    InboundEmail {
        id: id.into(),
        from: "Joe <joe@joescafe.com>".into(),
        subject: "Re: Website proposal for Joe's Cafe".into(),
        body: body.into(),
        received_at: Utc::now(),
    }
}

/// Next Tuesday at 15:00 UTC, at least a day away.
fn tuesday_3pm() -> Slot {
    let mut day = Utc::now().date_naive() + chrono::Duration::days(1);
    while day.weekday() != Weekday::Tue {
        day += chrono::Duration::days(1);
    }
    let start = Utc
        .with_ymd_and_hms(day.year(), day.month(), day.day(), 15, 0, 0)
        .unwrap();
    Slot {
        start,
        end: start + chrono::Duration::minutes(60),
    }
}

#[tokio::test]
async fn run_then_meeting_request_completes_the_run() {
    timeout(TEST_TIMEOUT, async {
        let slot = tuesday_3pm();
        let fakes = Fakes {
            calendar: Arc::new(FakeCalendar::with_slots(vec![slot])),
            ..Default::default()
        };
        let w = world(fakes, pipeline_config()).await;
        w.registry
            .upsert(vec![Lead::new("p1", "Joe's Cafe").with_phone("512-555-1234")])
            .await;

        let started = w.runs.start("p1", RunOptions::default()).await.unwrap();
        let parked = started.handle.await.unwrap();
        assert_eq!(parked.stage, Stage::AwaitingReply);
        assert_eq!(parked.results.recipient.as_deref(), Some("joe@joescafe.com"));
        assert_eq!(w.mailer.sent().len(), 1);

        w.inbox.deliver(reply("m1", "Thanks! Can we schedule a call?"));
        let outcome = w.router.notify("m1").await.unwrap();
        let RouteOutcome::Scheduled(meeting) = outcome else {
            panic!("expected a meeting, got {outcome:?}");
        };
        assert_eq!(meeting.start, slot.start);
        assert_eq!(meeting.run_id, Some(started.run_id));

        let done = w.runs.get(started.run_id).await.unwrap();
        assert_eq!(done.stage, Stage::Done);
        assert_eq!(done.results.meeting_id, Some(meeting.id));
        assert!(w.runs.active_run("p1").await.is_none());
        assert_eq!(
            w.registry.get("p1").await.unwrap().status,
            LeadStatus::Scheduled
        );

        let scheduled = events(&w.bus)
            .into_iter()
            .find(|e| e.kind == EventKind::MeetingScheduled)
            .unwrap();
        let EventPayload::Meeting(m) = scheduled.payload else {
            panic!("meeting_scheduled without a meeting payload");
        };
        assert!(m.calendar_link.starts_with("https://calendar.example.com/"));
        assert!(m.video_link.starts_with("https://meet.example.com/"));
        assert_eq!(w.meetings.list().await.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn skip_call_reaches_done_without_telephony() {
    timeout(TEST_TIMEOUT, async {
        let config = PipelineConfig {
            await_reply: false,
            ..pipeline_config()
        };
        let w = world(Fakes::default(), config).await;
        w.registry
            .upsert(vec![Lead::new("p1", "Joe's Cafe").with_email("owner@joescafe.com")])
            .await;

        let started = w
            .runs
            .start("p1", RunOptions { skip_call: true })
            .await
            .unwrap();
        let run = started.handle.await.unwrap();

        assert_eq!(run.stage, Stage::Done);
        assert_eq!(run.results.call_outcome, Some(CallOutcome::Skipped));
        assert_eq!(w.telephony.calls(), 0);

        // FACT_CHECKING is the last stage before EMAILING.
        let stages: Vec<Stage> = events(&w.bus)
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::Run(run) => Some(run.stage),
                _ => None,
            })
            .collect();
        let emailing = stages.iter().position(|s| *s == Stage::Emailing).unwrap();
        assert_eq!(stages[emailing - 1], Stage::FactChecking);
        assert!(!stages.contains(&Stage::Calling));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn persistent_email_failure_keeps_partial_results() {
    timeout(TEST_TIMEOUT, async {
        let fakes = Fakes::default();
        fakes
            .mailer
            .faults
            .fail_always(AdapterError::transient("email", "451 mailbox busy"));
        let w = world(fakes, pipeline_config()).await;
        w.registry
            .upsert(vec![Lead::new("p1", "Joe's Cafe").with_phone("512-555-1234")])
            .await;

        let started = w.runs.start("p1", RunOptions::default()).await.unwrap();
        let run = started.handle.await.unwrap();

        assert_eq!(run.stage, Stage::Failed);
        assert_eq!(w.mailer.calls(), 3);
        assert!(!run.results.research.clone().unwrap_or_default().is_empty());
        assert!(!run.results.proposal.clone().unwrap_or_default().is_empty());
        assert!(run.results.call_outcome.is_some());

        let stored = w.store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Failed);
        assert!(stored.results.research.is_some());

        let failed = events(&w.bus)
            .into_iter()
            .find(|e| e.kind == EventKind::PipelineFailed)
            .unwrap();
        let EventPayload::Run(failed_run) = failed.payload else {
            panic!("pipeline_failed without a run payload");
        };
        let error = failed_run.last_error.unwrap();
        assert_eq!(error.stage, Stage::Emailing);
        assert_eq!(error.error_class, "transient");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn duplicate_trigger_is_rejected_and_one_run_finishes() {
    timeout(TEST_TIMEOUT, async {
        let w = world(Fakes::default(), pipeline_config()).await;
        w.registry
            .upsert(vec![Lead::new("p1", "Joe's Cafe").with_email("joe@joescafe.com")])
            .await;

        let first = w.runs.start("p1", RunOptions::default()).await.unwrap();
        let second = w.runs.start("p1", RunOptions::default()).await;
        match second {
            Err(PipelineError::AlreadyRunning { run_id, .. }) => assert_eq!(run_id, first.run_id),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("second run was accepted"),
        }

        first.handle.await.unwrap();
        let runs = w.runs.list(Some("p1")).await;
        assert_eq!(runs.len(), 1);
        let started = events(&w.bus)
            .iter()
            .filter(|e| e.kind == EventKind::RunStarted)
            .count();
        assert_eq!(started, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn push_and_poll_of_same_message_classify_once() {
    timeout(TEST_TIMEOUT, async {
        let w = world(Fakes::default(), pipeline_config()).await;
        w.registry
            .upsert(vec![Lead::new("p1", "Joe's Cafe").with_email("joe@joescafe.com")])
            .await;
        w.inbox.deliver(reply("m1", "I'm interested, tell me more"));

        let (pushed, polled) = tokio::join!(w.router.notify("m1"), w.router.scan());
        let pushed = pushed.unwrap();
        let polled = polled.unwrap();

        assert_eq!(w.inbox.read_count("m1"), 1);
        assert_eq!(w.replies.count_for("m1"), 1);
        let duplicates =
            usize::from(pushed == RouteOutcome::Duplicate) + polled.duplicates;
        assert_eq!(duplicates, usize::from(polled.listed == 1));
        assert_eq!(
            w.registry.get("p1").await.unwrap().status,
            LeadStatus::HotLead
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn parked_run_survives_restart() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(MemoryStore::new());
        let run_id = {
            let w = world_on(store.clone(), Fakes::default(), pipeline_config()).await;
            w.registry
                .upsert(vec![Lead::new("p1", "Joe's Cafe").with_phone("512-555-1234")])
                .await;
            let started = w.runs.start("p1", RunOptions::default()).await.unwrap();
            let parked = started.handle.await.unwrap();
            assert_eq!(parked.stage, Stage::AwaitingReply);
            started.run_id
        };

        let w = world_on(store, Fakes::default(), pipeline_config()).await;
        let restored = w.runs.active_run("p1").await.unwrap();
        assert_eq!(restored.id, run_id);
        assert_eq!(restored.stage, Stage::AwaitingReply);

        w.inbox.deliver(reply("m9", "Not interested, thanks"));
        let outcome = w.router.notify("m9").await.unwrap();
        assert_eq!(outcome, RouteOutcome::StatusChanged(LeadStatus::NotInterested));
        assert_eq!(w.runs.get(run_id).await.unwrap().stage, Stage::Done);
        assert!(w.calendar.created().is_empty());
        assert_eq!(w.telephony.calls(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn transient_call_failure_is_retried_behind_cooldown() {
    timeout(TEST_TIMEOUT, async {
        let fakes = Fakes {
            call_cooldown: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        fakes
            .telephony
            .faults
            .fail_next(AdapterError::transient("calling", "503 upstream"));
        let w = world(fakes, pipeline_config()).await;
        w.registry
            .upsert(vec![Lead::new("p1", "Joe's Cafe").with_phone("512-555-1234")])
            .await;

        let started = w.runs.start("p1", RunOptions::default()).await.unwrap();
        let run = started.handle.await.unwrap();

        assert_eq!(run.stage, Stage::AwaitingReply);
        assert_eq!(w.telephony.calls(), 2);
        assert!(
            run.results
                .call_outcome
                .is_some_and(|outcome| outcome != CallOutcome::Skipped)
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn simultaneous_meeting_requests_book_one_meeting() {
    timeout(TEST_TIMEOUT, async {
        let fakes = Fakes {
            calendar: Arc::new(FakeCalendar::with_slots(vec![tuesday_3pm()])),
            ..Default::default()
        };
        let w = world(fakes, pipeline_config()).await;
        w.registry
            .upsert(vec![Lead::new("p1", "Joe's Cafe").with_phone("512-555-1234")])
            .await;
        let started = w.runs.start("p1", RunOptions::default()).await.unwrap();
        started.handle.await.unwrap();

        w.inbox.deliver(reply("m1", "Can we schedule a call?"));
        w.inbox.deliver(reply("m2", "Also, when can we meet?"));
        let (a, b) = tokio::join!(w.router.notify("m1"), w.router.notify("m2"));
        let outcomes = [a.unwrap(), b.unwrap()];

        let booked = outcomes
            .iter()
            .filter(|o| matches!(o, RouteOutcome::Scheduled(_)))
            .count();
        assert_eq!(booked, 1);
        assert_eq!(w.meetings.list().await.len(), 1);
        assert_eq!(w.calendar.created().len(), 1);
        assert_eq!(
            w.runs.get(started.run_id).await.unwrap().stage,
            Stage::Done
        );
    })
    .await
    .expect("test timed out");
}
