//! Run ledger and run manager.
//!
//! The ledger is the single owner of run snapshots: every transition goes
//! through [`RunLedger::commit`], which updates the in-memory map, publishes
//! the matching event and persists the record. At most one non-terminal run
//! exists per lead; a run parked in `AWAITING_REPLY` still counts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::runner::PipelineRunner;
use super::types::{PipelineRun, RunOptions, Stage, StepOutcome};
use crate::capabilities::retry::RetryPolicy;
use crate::error::{AdapterError, PipelineError, StoreError};
use crate::events::bus::EventBus;
use crate::events::model::{EventKind, EventPayload, FailureNotice};
use crate::leads::registry::LeadRegistry;
use crate::meetings::Meeting;
use crate::store::DurableStore;

const STORE_TIMEOUT: Duration = Duration::from_secs(10);

struct ActiveRun {
    run_id: Uuid,
    /// Set to `true` to ask the run to stop.
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct LedgerState {
    runs: HashMap<Uuid, PipelineRun>,
    /// lead id → its one non-terminal run.
    active: HashMap<String, ActiveRun>,
}

pub struct RunLedger {
    state: RwLock<LedgerState>,
    store: Arc<dyn DurableStore>,
    bus: EventBus,
    retry: RetryPolicy,
}

impl RunLedger {
    pub fn new(store: Arc<dyn DurableStore>, bus: EventBus, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(LedgerState::default()),
            store,
            bus,
            retry,
        })
    }

    /// Reload runs from the store.
    ///
    /// Runs caught mid-flight are failed with class `interrupted`; nothing is
    /// re-executed. Runs awaiting a reply become active again.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let loaded = self.store.load_runs().await?;
        let mut interrupted = Vec::new();
        let count = loaded.len();
        {
            let mut state = self.state.write().await;
            for mut run in loaded {
                if run.stage.is_mid_flight() {
                    let stage = run.stage;
                    run.fail(stage, "interrupted", "Process restarted while the run was in flight");
                    interrupted.push(run.clone());
                } else if run.stage == Stage::AwaitingReply {
                    let (cancel, _) = watch::channel(false);
                    state.active.insert(
                        run.lead_id.clone(),
                        ActiveRun {
                            run_id: run.id,
                            cancel,
                        },
                    );
                }
                state.runs.insert(run.id, run);
            }
            for run in &interrupted {
                self.bus
                    .publish(EventKind::PipelineFailed, EventPayload::Run(Box::new(run.clone())));
            }
        }
        for run in &interrupted {
            warn!(run_id = %run.id, lead_id = %run.lead_id, "Run interrupted by restart, marked failed");
            self.persist(run).await;
        }
        info!(count, interrupted = interrupted.len(), "Run ledger hydrated from store");
        Ok(count)
    }

    /// Register a new run for its lead and announce it.
    ///
    /// Rejects the run if the lead already has a non-terminal one.
    pub async fn claim(&self, run: &PipelineRun) -> Result<watch::Receiver<bool>, PipelineError> {
        let rx = {
            let mut state = self.state.write().await;
            if let Some(active) = state.active.get(&run.lead_id) {
                return Err(PipelineError::AlreadyRunning {
                    lead_id: run.lead_id.clone(),
                    run_id: active.run_id,
                });
            }
            let (cancel, rx) = watch::channel(false);
            state.active.insert(
                run.lead_id.clone(),
                ActiveRun {
                    run_id: run.id,
                    cancel,
                },
            );
            state.runs.insert(run.id, run.clone());
            self.bus
                .publish(EventKind::RunStarted, EventPayload::Run(Box::new(run.clone())));
            rx
        };
        info!(run_id = %run.id, lead_id = %run.lead_id, skip_call = run.options.skip_call, "Run started");
        self.persist(run).await;
        Ok(rx)
    }

    /// Record a transition and publish `kind` for it.
    ///
    /// A terminal run is never overwritten: the stored terminal record is
    /// returned instead. A non-terminal commit after cancellation was
    /// requested turns into the `FAILED` transition.
    pub async fn commit(&self, mut run: PipelineRun, kind: EventKind) -> PipelineRun {
        {
            let mut state = self.state.write().await;
            if let Some(existing) = state.runs.get(&run.id)
                && existing.terminal
            {
                warn!(run_id = %run.id, stage = %run.stage, "Ignoring commit to a finished run");
                return existing.clone();
            }

            let cancel_requested = state
                .active
                .get(&run.lead_id)
                .is_some_and(|a| a.run_id == run.id && *a.cancel.borrow());
            if cancel_requested && !run.terminal {
                let stage = run.stage;
                run.fail(stage, "cancelled", "Run cancelled");
            }

            let kind = if run.stage == Stage::Failed {
                EventKind::PipelineFailed
            } else {
                kind
            };
            if run.terminal
                && state
                    .active
                    .get(&run.lead_id)
                    .is_some_and(|a| a.run_id == run.id)
            {
                state.active.remove(&run.lead_id);
            }
            state.runs.insert(run.id, run.clone());
            self.bus.publish(kind, EventPayload::Run(Box::new(run.clone())));
        }

        match (&run.last_error, run.stage) {
            (Some(err), Stage::Failed) => warn!(
                run_id = %run.id,
                lead_id = %run.lead_id,
                stage = %err.stage,
                error_class = %err.error_class,
                error = %err.message,
                "Run failed"
            ),
            _ => info!(run_id = %run.id, lead_id = %run.lead_id, stage = %run.stage, "Run advanced"),
        }
        self.persist(&run).await;
        run
    }

    /// Ask the lead's active run to stop.
    ///
    /// A parked run fails immediately; a live run fails at its next await
    /// point. Returns the run as currently recorded.
    pub async fn cancel(&self, lead_id: &str) -> Result<PipelineRun, PipelineError> {
        let parked = {
            let state = self.state.read().await;
            let active = state
                .active
                .get(lead_id)
                .ok_or_else(|| PipelineError::NoActiveRun(lead_id.to_string()))?;
            active.cancel.send_replace(true);
            let run = state
                .runs
                .get(&active.run_id)
                .cloned()
                .ok_or(PipelineError::RunNotFound(active.run_id))?;
            if run.stage != Stage::AwaitingReply {
                info!(run_id = %run.id, lead_id, stage = %run.stage, "Cancellation requested");
                return Ok(run);
            }
            run
        };
        Ok(self.commit(parked, EventKind::PipelineFailed).await)
    }

    /// The lead's run parked in `AWAITING_REPLY`, if any.
    pub async fn awaiting_reply(&self, lead_id: &str) -> Option<PipelineRun> {
        let state = self.state.read().await;
        let active = state.active.get(lead_id)?;
        state
            .runs
            .get(&active.run_id)
            .filter(|run| run.stage == Stage::AwaitingReply)
            .cloned()
    }

    pub async fn active_run(&self, lead_id: &str) -> Option<PipelineRun> {
        let state = self.state.read().await;
        let active = state.active.get(lead_id)?;
        state.runs.get(&active.run_id).cloned()
    }

    pub async fn get(&self, run_id: Uuid) -> Option<PipelineRun> {
        self.state.read().await.runs.get(&run_id).cloned()
    }

    /// Every run, newest first, optionally for one lead.
    pub async fn list(&self, lead_id: Option<&str>) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self
            .state
            .read()
            .await
            .runs
            .values()
            .filter(|run| lead_id.is_none_or(|id| run.lead_id == id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    async fn persist(&self, run: &PipelineRun) {
        let store = self.store.clone();
        let result = self
            .retry
            .run("store", STORE_TIMEOUT, || {
                let store = store.clone();
                async move {
                    store
                        .put_run(run)
                        .await
                        .map_err(|e| AdapterError::transient("store", e.to_string()))
                }
            })
            .await;

        if let Err(e) = result {
            warn!(run_id = %run.id, error = %e, "Run persistence exhausted retries");
            self.bus.publish(
                EventKind::PersistenceFailed,
                EventPayload::Failure(FailureNotice {
                    stage: Some(run.stage),
                    lead_id: Some(run.lead_id.clone()),
                    run_id: Some(run.id),
                    message_id: None,
                    error_class: "persistence".into(),
                    message: e.to_string(),
                }),
            );
        }
    }
}

/// A run that was accepted and is executing on its own task.
pub struct StartedRun {
    pub run_id: Uuid,
    /// Resolves with the run once it finishes or parks awaiting a reply.
    pub handle: JoinHandle<PipelineRun>,
}

/// Entry point for starting, resuming and cancelling outreach runs.
pub struct RunManager {
    ledger: Arc<RunLedger>,
    runner: Arc<PipelineRunner>,
    registry: Arc<LeadRegistry>,
}

impl RunManager {
    pub fn new(
        ledger: Arc<RunLedger>,
        runner: Arc<PipelineRunner>,
        registry: Arc<LeadRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            runner,
            registry,
        })
    }

    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        self.ledger.hydrate().await
    }

    /// Start an outreach run for `lead_id` on a new task.
    ///
    /// A second start while the lead has a non-terminal run is rejected with
    /// [`PipelineError::AlreadyRunning`].
    pub async fn start(&self, lead_id: &str, options: RunOptions) -> Result<StartedRun, PipelineError> {
        if self.registry.get(lead_id).await.is_none() {
            return Err(PipelineError::LeadNotFound(lead_id.to_string()));
        }
        let run = PipelineRun::new(lead_id, options);
        let run_id = run.id;
        let cancel = self.ledger.claim(&run).await?;

        let runner = self.runner.clone();
        let handle = tokio::spawn(async move { runner.execute(run, cancel).await });
        Ok(StartedRun { run_id, handle })
    }

    pub async fn cancel(&self, lead_id: &str) -> Result<PipelineRun, PipelineError> {
        self.ledger.cancel(lead_id).await
    }

    /// Resume the lead's parked run through `SCHEDULING` to `DONE`.
    pub async fn complete_scheduling(
        &self,
        lead_id: &str,
        meeting: &Meeting,
    ) -> Result<PipelineRun, PipelineError> {
        let mut run = self
            .ledger
            .awaiting_reply(lead_id)
            .await
            .ok_or_else(|| PipelineError::NotAwaitingReply(lead_id.to_string()))?;

        run.record(Stage::AwaitingReply, StepOutcome::Completed, "reply received");
        run.advance(Stage::Scheduling);
        let mut run = self.ledger.commit(run, EventKind::StageCompleted).await;
        if run.terminal {
            return Ok(run);
        }

        run.results.meeting_id = Some(meeting.id);
        run.record(
            Stage::Scheduling,
            StepOutcome::Completed,
            format!("meeting at {}", meeting.start.to_rfc3339()),
        );
        run.advance(Stage::Done);
        Ok(self.ledger.commit(run, EventKind::StageCompleted).await)
    }

    /// Close the lead's parked run after a negative reply.
    pub async fn decline(&self, lead_id: &str) -> Result<PipelineRun, PipelineError> {
        let mut run = self
            .ledger
            .awaiting_reply(lead_id)
            .await
            .ok_or_else(|| PipelineError::NotAwaitingReply(lead_id.to_string()))?;
        run.record(Stage::AwaitingReply, StepOutcome::Completed, "prospect declined");
        run.advance(Stage::Done);
        Ok(self.ledger.commit(run, EventKind::StageCompleted).await)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<PipelineRun, PipelineError> {
        self.ledger
            .get(run_id)
            .await
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    pub async fn list(&self, lead_id: Option<&str>) -> Vec<PipelineRun> {
        self.ledger.list(lead_id).await
    }

    pub async fn active_run(&self, lead_id: &str) -> Option<PipelineRun> {
        self.ledger.active_run(lead_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::Delivery;
    use crate::store::MemoryStore;

    fn ledger() -> (Arc<RunLedger>, Arc<MemoryStore>, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::default();
        (
            RunLedger::new(store.clone(), bus.clone(), RetryPolicy::immediate(2)),
            store,
            bus,
        )
    }

    fn kinds(bus: &EventBus) -> Vec<EventKind> {
        let mut sub = bus.subscribe();
        let mut out = Vec::new();
        while let Some(Delivery::Event(e)) = sub.try_recv() {
            out.push(e.kind);
        }
        out
    }

    #[tokio::test]
    async fn second_claim_for_lead_is_rejected() {
        let (ledger, _, _) = ledger();
        let first = PipelineRun::new("p1", RunOptions::default());
        ledger.claim(&first).await.unwrap();

        let err = ledger
            .claim(&PipelineRun::new("p1", RunOptions::default()))
            .await
            .unwrap_err();
        match err {
            PipelineError::AlreadyRunning { run_id, .. } => assert_eq!(run_id, first.id),
            other => panic!("unexpected {other:?}"),
        }

        // A different lead is unaffected.
        ledger
            .claim(&PipelineRun::new("p2", RunOptions::default()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_commit_frees_the_lead_and_is_final() {
        let (ledger, store, bus) = ledger();
        let mut run = PipelineRun::new("p1", RunOptions::default());
        ledger.claim(&run).await.unwrap();

        run.advance(Stage::Done);
        let done = ledger.commit(run.clone(), EventKind::StageCompleted).await;
        assert!(done.terminal);
        assert!(ledger.active_run("p1").await.is_none());

        // A stale writer cannot resurrect the run.
        let mut stale = run.clone();
        stale.stage = Stage::Emailing;
        stale.terminal = false;
        let kept = ledger.commit(stale, EventKind::StageCompleted).await;
        assert_eq!(kept.stage, Stage::Done);

        assert_eq!(kinds(&bus), vec![EventKind::RunStarted, EventKind::StageCompleted]);
        assert_eq!(store.get_run(run.id).await.unwrap().unwrap().stage, Stage::Done);
    }

    #[tokio::test]
    async fn cancel_fails_parked_run_immediately() {
        let (ledger, _, bus) = ledger();
        let mut run = PipelineRun::new("p1", RunOptions::default());
        ledger.claim(&run).await.unwrap();
        run.advance(Stage::AwaitingReply);
        ledger.commit(run, EventKind::EmailSent).await;

        let cancelled = ledger.cancel("p1").await.unwrap();
        assert_eq!(cancelled.stage, Stage::Failed);
        assert_eq!(cancelled.last_error.unwrap().error_class, "cancelled");
        assert!(ledger.active_run("p1").await.is_none());
        assert_eq!(kinds(&bus).last(), Some(&EventKind::PipelineFailed));
        assert!(matches!(
            ledger.cancel("p1").await,
            Err(PipelineError::NoActiveRun(_))
        ));
    }

    #[tokio::test]
    async fn cancel_of_live_run_applies_on_next_commit() {
        let (ledger, _, _) = ledger();
        let mut run = PipelineRun::new("p1", RunOptions::default());
        let cancel = ledger.claim(&run).await.unwrap();

        let pending = ledger.cancel("p1").await.unwrap();
        assert_eq!(pending.stage, Stage::Researching);
        assert!(*cancel.borrow());

        run.advance(Stage::Drafting);
        let committed = ledger.commit(run, EventKind::StageCompleted).await;
        assert_eq!(committed.stage, Stage::Failed);
    }

    #[tokio::test]
    async fn hydrate_fails_mid_flight_and_keeps_parked() {
        let store = Arc::new(MemoryStore::new());
        let mut mid = PipelineRun::new("p1", RunOptions::default());
        mid.advance(Stage::Calling);
        let mut parked = PipelineRun::new("p2", RunOptions::default());
        parked.advance(Stage::AwaitingReply);
        store.put_run(&mid).await.unwrap();
        store.put_run(&parked).await.unwrap();

        let ledger = RunLedger::new(store.clone(), EventBus::default(), RetryPolicy::immediate(1));
        assert_eq!(ledger.hydrate().await.unwrap(), 2);

        let mid = ledger.get(mid.id).await.unwrap();
        assert_eq!(mid.stage, Stage::Failed);
        let err = mid.last_error.unwrap();
        assert_eq!(err.error_class, "interrupted");
        assert_eq!(err.stage, Stage::Calling);
        assert_eq!(store.get_run(mid.id).await.unwrap().unwrap().stage, Stage::Failed);

        assert_eq!(ledger.awaiting_reply("p2").await.unwrap().id, parked.id);
        assert!(ledger.active_run("p1").await.is_none());
    }
}
