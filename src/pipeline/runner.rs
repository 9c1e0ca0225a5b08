//! Pipeline runner: drives one run through the outreach stages.
//!
//! Stages run strictly in order on the run's own task. Each adapter call is
//! retried per the configured policy and bounded by the stage timeout.
//! Research, drafting, fact-checking, calling, classification and artifact
//! generation degrade to a fallback and continue; a failed send (or no
//! recipient at all) fails the run. Every transition is committed to the
//! [`RunLedger`], which publishes the matching event.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::manager::RunLedger;
use super::outreach;
use super::transcript::{extract_emails, extract_meeting_time};
use super::types::{CallOutcome, PipelineRun, Stage, StepOutcome};
use crate::capabilities::Capabilities;
use crate::capabilities::types::{AdapterResult, CallStatus, Classified, FactVerdict};
use crate::config::{PipelineConfig, SchedulingConfig};
use crate::error::AdapterError;
use crate::events::model::EventKind;
use crate::leads::model::{Lead, LeadStatus};
use crate::leads::registry::LeadRegistry;

/// Why a stage stopped the run.
#[derive(Debug)]
enum Halt {
    Cancelled,
    Failed(AdapterError),
}

impl From<AdapterError> for Halt {
    fn from(e: AdapterError) -> Self {
        Self::Failed(e)
    }
}

/// Resolves once cancellation is requested. Never resolves if the ledger
/// dropped the sender.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

pub struct PipelineRunner {
    caps: Capabilities,
    registry: Arc<LeadRegistry>,
    ledger: Arc<RunLedger>,
    config: PipelineConfig,
    meeting_minutes: i64,
    /// Organizer address for calendar invites.
    organizer: String,
}

impl PipelineRunner {
    pub fn new(
        caps: Capabilities,
        registry: Arc<LeadRegistry>,
        ledger: Arc<RunLedger>,
        config: PipelineConfig,
        scheduling: &SchedulingConfig,
        organizer: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            caps,
            registry,
            ledger,
            config,
            meeting_minutes: scheduling.meeting_duration_minutes,
            organizer: organizer.unwrap_or_default(),
        })
    }

    /// One adapter call under the retry policy, abandoned on cancellation.
    async fn call<T, F, Fut>(
        &self,
        capability: &str,
        cancel: &mut watch::Receiver<bool>,
        op: F,
    ) -> Result<T, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        tokio::select! {
            result = self.config.retry.run(capability, self.config.stage_timeout, op) => {
                result.map_err(Halt::Failed)
            }
            _ = cancelled(cancel) => Err(Halt::Cancelled),
        }
    }

    /// Drive `run` until it finishes, fails, or parks in `AWAITING_REPLY`.
    pub async fn execute(&self, mut run: PipelineRun, mut cancel: watch::Receiver<bool>) -> PipelineRun {
        let Some(mut lead) = self.registry.get(&run.lead_id).await else {
            let stage = run.stage;
            run.fail(stage, "semantic", format!("lead {} not found", run.lead_id));
            return self.ledger.commit(run, EventKind::PipelineFailed).await;
        };

        while !run.terminal && run.stage != Stage::AwaitingReply {
            let stage = run.stage;
            debug!(run_id = %run.id, lead_id = %run.lead_id, stage = %stage, "Stage started");

            let step = match stage {
                Stage::Researching => self.research(&mut run, &lead, &mut cancel).await,
                Stage::Drafting => self.draft(&mut run, &lead, &mut cancel).await,
                Stage::FactChecking => self.fact_check(&mut run, &lead, &mut cancel).await,
                Stage::Calling => self.place_call(&mut run, &mut lead, &mut cancel).await,
                Stage::Classifying => self.classify(&mut run, &mut cancel).await,
                Stage::GeneratingArtifact => self.artifact(&mut run, &lead, &mut cancel).await,
                Stage::Emailing => self.email(&mut run, &mut cancel).await,
                Stage::AwaitingReply | Stage::Scheduling | Stage::Done | Stage::Failed => break,
            };

            match step {
                Ok(kind) => {
                    self.advance_from(&mut run, stage);
                    run = self.ledger.commit(run, kind).await;
                }
                Err(Halt::Cancelled) => {
                    run.fail(stage, "cancelled", "Run cancelled");
                    run = self.ledger.commit(run, EventKind::PipelineFailed).await;
                }
                Err(Halt::Failed(e)) => {
                    run.fail(stage, e.error_class(), e.to_string());
                    run = self.ledger.commit(run, EventKind::PipelineFailed).await;
                }
            }
        }

        if run.stage == Stage::AwaitingReply {
            info!(run_id = %run.id, lead_id = %run.lead_id, "Run parked awaiting reply");
        }
        run
    }

    /// Advance past `completed`, recording any stage skipped by configuration.
    fn advance_from(&self, run: &mut PipelineRun, completed: Stage) {
        let next = match completed {
            Stage::Researching => Stage::Drafting,
            Stage::Drafting if self.config.fact_check => Stage::FactChecking,
            Stage::Drafting | Stage::FactChecking => {
                if completed == Stage::Drafting {
                    run.record(Stage::FactChecking, StepOutcome::Skipped, "disabled");
                }
                if run.options.skip_call {
                    run.results.call_outcome = Some(CallOutcome::Skipped);
                    run.record(Stage::Calling, StepOutcome::Skipped, "skip_call");
                    run.record(Stage::Classifying, StepOutcome::Skipped, "skip_call");
                    run.record(Stage::GeneratingArtifact, StepOutcome::Skipped, "skip_call");
                    Stage::Emailing
                } else {
                    Stage::Calling
                }
            }
            Stage::Calling => Stage::Classifying,
            Stage::Classifying if self.config.generate_artifact => Stage::GeneratingArtifact,
            Stage::Classifying => {
                run.record(Stage::GeneratingArtifact, StepOutcome::Skipped, "disabled");
                Stage::Emailing
            }
            Stage::GeneratingArtifact => Stage::Emailing,
            Stage::Emailing if self.config.await_reply => Stage::AwaitingReply,
            Stage::Emailing => Stage::Done,
            other => other,
        };
        run.advance(next);
    }

    // ── Stages ──────────────────────────────────────────────────────

    async fn research(
        &self,
        run: &mut PipelineRun,
        lead: &Lead,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<EventKind, Halt> {
        let research = &self.caps.research;
        match self.call("research", cancel, || research.research(lead)).await {
            Ok(summary) => {
                run.results.research = Some(summary);
                run.record(Stage::Researching, StepOutcome::Completed, "");
            }
            Err(Halt::Failed(e)) => {
                warn!(run_id = %run.id, error = %e, "Research failed, using basic profile");
                run.results.research = Some(format!(
                    "{} is a local business{}.",
                    lead.name,
                    if lead.city.is_empty() {
                        String::new()
                    } else {
                        format!(" in {}", lead.city)
                    }
                ));
                run.record(Stage::Researching, StepOutcome::Fallback, e.to_string());
            }
            Err(halt) => return Err(halt),
        }
        Ok(EventKind::StageCompleted)
    }

    async fn draft(
        &self,
        run: &mut PipelineRun,
        lead: &Lead,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<EventKind, Halt> {
        let writer = &self.caps.writer;
        let research = run.results.research.clone().unwrap_or_default();
        match self
            .call("draft", cancel, || writer.draft_proposal(lead, &research))
            .await
        {
            Ok(text) => {
                run.results.proposal = Some(text);
                run.record(Stage::Drafting, StepOutcome::Completed, "");
            }
            Err(Halt::Failed(e)) => {
                warn!(run_id = %run.id, error = %e, "Drafting failed, using template proposal");
                run.results.proposal = Some(format!(
                    "We'd love to help {} reach more customers online with a modern, \
                     mobile-friendly website that shows your hours, menu and reviews.",
                    lead.name
                ));
                run.record(Stage::Drafting, StepOutcome::Fallback, e.to_string());
            }
            Err(halt) => return Err(halt),
        }
        Ok(EventKind::StageCompleted)
    }

    async fn fact_check(
        &self,
        run: &mut PipelineRun,
        lead: &Lead,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<EventKind, Halt> {
        let writer = &self.caps.writer;
        let draft = run.results.proposal.clone().unwrap_or_default();
        match self
            .call("fact_check", cancel, || writer.fact_check(lead, &draft))
            .await
        {
            Ok(check) => {
                if check.verdict == FactVerdict::Revised {
                    run.results.proposal = Some(check.text);
                }
                run.results.fact_check = Some(check.verdict);
                run.record(Stage::FactChecking, StepOutcome::Completed, "");
            }
            Err(Halt::Failed(e)) => {
                warn!(run_id = %run.id, error = %e, "Fact check failed, draft goes out unchecked");
                run.results.fact_check = Some(FactVerdict::Unchecked);
                run.record(Stage::FactChecking, StepOutcome::Fallback, e.to_string());
            }
            Err(halt) => return Err(halt),
        }
        Ok(EventKind::StageCompleted)
    }

    /// Place the call and poll for its transcript. Any failure leaves the run
    /// without a transcript; classification then records `unknown`.
    async fn place_call(
        &self,
        run: &mut PipelineRun,
        lead: &mut Lead,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<EventKind, Halt> {
        let script = run.results.proposal.clone().unwrap_or_default();
        match self.call_and_wait(lead, &script, cancel).await {
            Ok(transcript) => {
                let emails = extract_emails(&transcript);
                if let Some(email) = emails.first()
                    && lead.email.trim().is_empty()
                    && let Some(updated) = self.registry.fill_email(&lead.place_id, email).await
                {
                    info!(run_id = %run.id, lead_id = %lead.place_id, email = %email, "E-mail captured from call");
                    *lead = updated;
                }
                run.results.proposed_meeting_time = Some(extract_meeting_time(&transcript, Utc::now()));
                run.results.transcript = Some(transcript);
                run.record(Stage::Calling, StepOutcome::Completed, "");
            }
            Err(Halt::Failed(e)) => {
                warn!(run_id = %run.id, error = %e, "Call failed, continuing without transcript");
                run.record(Stage::Calling, StepOutcome::Fallback, e.to_string());
            }
            Err(halt) => return Err(halt),
        }
        Ok(EventKind::StageCompleted)
    }

    async fn call_and_wait(
        &self,
        lead: &Lead,
        script: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<String, Halt> {
        let telephony = &self.caps.telephony;
        let handle = self
            .call("calling", cancel, || telephony.place_call(lead, script))
            .await?;

        for attempt in 1..=self.config.call_poll_attempts.max(1) {
            let status = self
                .call("calling", cancel, || telephony.fetch_transcript(&handle))
                .await?;
            match status {
                CallStatus::Completed { transcript } => return Ok(transcript),
                CallStatus::Failed { reason } => {
                    return Err(Halt::Failed(AdapterError::unavailable("calling", reason)));
                }
                CallStatus::InProgress => {
                    debug!(call_id = %handle.call_id, attempt, "Call still in progress");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.call_poll_interval) => {}
                        _ = cancelled(cancel) => return Err(Halt::Cancelled),
                    }
                }
            }
        }
        Err(Halt::Failed(AdapterError::Timeout {
            capability: "calling".into(),
            timeout: self.config.call_poll_interval * self.config.call_poll_attempts,
        }))
    }

    async fn classify(
        &self,
        run: &mut PipelineRun,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<EventKind, Halt> {
        let Some(transcript) = run.results.transcript.clone() else {
            run.results.call_outcome = Some(CallOutcome::Unknown);
            run.record(Stage::Classifying, StepOutcome::Skipped, "no transcript");
            return Ok(EventKind::CallOutcomeClassified);
        };

        let classifier = &self.caps.outcome;
        let (outcome, step, note) = match self
            .call("classify_outcome", cancel, || classifier.classify_outcome(&transcript))
            .await
        {
            Ok(Classified::Parsed { value }) => (value, StepOutcome::Completed, String::new()),
            Ok(Classified::Unparseable { raw }) => {
                warn!(run_id = %run.id, raw = %truncate(&raw, 120), "Unparseable call outcome, recording unknown");
                (
                    CallOutcome::Unknown,
                    StepOutcome::Fallback,
                    format!("unparseable classifier output: {}", truncate(&raw, 200)),
                )
            }
            Err(Halt::Failed(e)) => {
                warn!(run_id = %run.id, error = %e, "Outcome classification failed, recording unknown");
                (CallOutcome::Unknown, StepOutcome::Fallback, e.to_string())
            }
            Err(halt) => return Err(halt),
        };
        info!(run_id = %run.id, lead_id = %run.lead_id, outcome = %outcome, "Call outcome classified");
        run.results.call_outcome = Some(outcome);
        run.record(Stage::Classifying, step, note);
        Ok(EventKind::CallOutcomeClassified)
    }

    async fn artifact(
        &self,
        run: &mut PipelineRun,
        lead: &Lead,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<EventKind, Halt> {
        let generator = &self.caps.artifacts;
        let proposal = run.results.proposal.clone().unwrap_or_default();
        match self
            .call("artifact", cancel, || generator.generate_artifact(lead, &proposal))
            .await
        {
            Ok(artifact) => {
                run.record(
                    Stage::GeneratingArtifact,
                    StepOutcome::Completed,
                    artifact.filename.clone(),
                );
                run.results.artifact = Some(artifact);
            }
            Err(Halt::Failed(e)) => {
                warn!(run_id = %run.id, error = %e, "Artifact generation failed, e-mail goes without attachment");
                run.record(Stage::GeneratingArtifact, StepOutcome::Fallback, e.to_string());
            }
            Err(halt) => return Err(halt),
        }
        Ok(EventKind::StageCompleted)
    }

    /// Recipient: the lead's address, then one heard on the call, then the
    /// configured fallback.
    fn recipient(&self, lead: &Lead, transcript: Option<&str>) -> Option<String> {
        let known = lead.email.trim();
        if !known.is_empty() {
            return Some(known.to_string());
        }
        transcript
            .and_then(|t| extract_emails(t).into_iter().next())
            .or_else(|| self.config.fallback_email.clone())
    }

    async fn email(
        &self,
        run: &mut PipelineRun,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<EventKind, Halt> {
        let lead = self
            .registry
            .get(&run.lead_id)
            .await
            .ok_or_else(|| AdapterError::semantic("email", format!("lead {} vanished", run.lead_id)))?;
        let recipient = self
            .recipient(&lead, run.results.transcript.as_deref())
            .ok_or_else(|| AdapterError::semantic("email", "no recipient address available"))?;

        let message = outreach::compose(
            &lead,
            &run.results,
            &recipient,
            &self.config.sender_name,
            &self.organizer,
            self.meeting_minutes,
        );
        let sender = &self.caps.email;
        let receipt = self.call("email", cancel, || sender.send_email(&message)).await?;

        info!(
            run_id = %run.id,
            lead_id = %run.lead_id,
            to = %recipient,
            attachments = message.attachments.len(),
            "Outreach e-mail sent"
        );
        run.results.email_sent = true;
        run.results.recipient = Some(recipient);
        run.results.receipt = Some(receipt);
        run.record(Stage::Emailing, StepOutcome::Completed, "");

        if lead.status == LeadStatus::New {
            self.registry.set_status(&lead.place_id, LeadStatus::Contacted).await;
        }
        Ok(EventKind::EmailSent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::fake::*;
    use crate::capabilities::retry::RetryPolicy;
    use crate::events::bus::EventBus;
    use crate::events::model::{Delivery, EventPayload};
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct Harness {
        registry: Arc<LeadRegistry>,
        ledger: Arc<RunLedger>,
        bus: EventBus,
        research: Arc<FakeResearch>,
        telephony: Arc<FakeTelephony>,
        outcome: Arc<FakeOutcomeClassifier>,
        artifacts: Arc<FakeArtifacts>,
        mailer: Arc<RecordingMailer>,
    }

    impl Harness {
        async fn new(lead: Lead) -> Self {
            let store = Arc::new(MemoryStore::new());
            let bus = EventBus::default();
            let registry = LeadRegistry::new(store.clone(), bus.clone(), RetryPolicy::immediate(1));
            registry.upsert(vec![lead]).await;
            let ledger = RunLedger::new(store, bus.clone(), RetryPolicy::immediate(1));
            Self {
                registry,
                ledger,
                bus,
                research: Arc::new(FakeResearch::default()),
                telephony: Arc::new(FakeTelephony::default()),
                outcome: Arc::new(FakeOutcomeClassifier::default()),
                artifacts: Arc::new(FakeArtifacts::default()),
                mailer: Arc::new(RecordingMailer::default()),
            }
        }

        fn runner(&self, config: PipelineConfig) -> Arc<PipelineRunner> {
            let mut caps = Capabilities::fake();
            caps.research = self.research.clone();
            caps.telephony = self.telephony.clone();
            caps.outcome = self.outcome.clone();
            caps.artifacts = self.artifacts.clone();
            caps.email = self.mailer.clone();
            PipelineRunner::new(
                caps,
                self.registry.clone(),
                self.ledger.clone(),
                config,
                &SchedulingConfig::default(),
                Some("sales@rapidreach.test".into()),
            )
        }

        async fn run(&self, config: PipelineConfig, lead_id: &str, skip_call: bool) -> PipelineRun {
            let run = PipelineRun::new(
                lead_id,
                crate::pipeline::types::RunOptions { skip_call },
            );
            let cancel = self.ledger.claim(&run).await.unwrap();
            self.runner(config).execute(run, cancel).await
        }

        fn run_stages(&self) -> Vec<(EventKind, Stage)> {
            let mut sub = self.bus.subscribe();
            let mut out = Vec::new();
            while let Some(Delivery::Event(e)) = sub.try_recv() {
                if let EventPayload::Run(run) = e.payload {
                    out.push((e.kind, run.stage));
                }
            }
            out
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry: RetryPolicy::immediate(2),
            stage_timeout: Duration::from_secs(5),
            call_poll_interval: Duration::from_millis(1),
            call_poll_attempts: 3,
            ..Default::default()
        }
    }

    fn lead() -> Lead {
        Lead::new("p1", "Joe's Cafe")
            .with_phone("512-555-1234")
            .with_city("Austin")
    }

    #[tokio::test]
    async fn full_run_parks_awaiting_reply() {
        let h = Harness::new(lead()).await;
        let run = h.run(config(), "p1", false).await;

        assert_eq!(run.stage, Stage::AwaitingReply);
        assert!(!run.terminal);
        assert!(run.results.research.is_some());
        assert_eq!(run.results.call_outcome, Some(CallOutcome::AgreedToEmail));
        assert_eq!(run.results.recipient.as_deref(), Some("joe@joescafe.com"));
        assert!(run.results.email_sent);
        assert!(run.results.proposed_meeting_time.is_some());

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        let names: Vec<&str> = sent[0].attachments.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["joe_s_cafe_proposal.pdf", "invite.ics"]);

        let lead = h.registry.get("p1").await.unwrap();
        assert_eq!(lead.email, "joe@joescafe.com");
        assert_eq!(lead.status, LeadStatus::Contacted);

        assert_eq!(
            h.run_stages(),
            vec![
                (EventKind::RunStarted, Stage::Researching),
                (EventKind::StageCompleted, Stage::Drafting),
                (EventKind::StageCompleted, Stage::FactChecking),
                (EventKind::StageCompleted, Stage::Calling),
                (EventKind::StageCompleted, Stage::Classifying),
                (EventKind::CallOutcomeClassified, Stage::GeneratingArtifact),
                (EventKind::StageCompleted, Stage::Emailing),
                (EventKind::EmailSent, Stage::AwaitingReply),
            ]
        );
    }

    #[tokio::test]
    async fn skip_call_goes_straight_to_email() {
        let h = Harness::new(lead().with_email("owner@joescafe.com")).await;
        let config = PipelineConfig {
            await_reply: false,
            ..config()
        };
        let run = h.run(config, "p1", true).await;

        assert_eq!(run.stage, Stage::Done);
        assert_eq!(run.results.call_outcome, Some(CallOutcome::Skipped));
        assert_eq!(h.telephony.calls(), 0);
        assert_eq!(h.outcome.calls(), 0);
        assert_eq!(h.artifacts.calls(), 0);
        assert!(
            h.run_stages()
                .contains(&(EventKind::StageCompleted, Stage::Emailing))
        );
        assert!(
            !h.run_stages()
                .iter()
                .any(|(_, stage)| *stage == Stage::Calling)
        );
    }

    #[tokio::test]
    async fn send_failure_preserves_earlier_results() {
        let h = Harness::new(lead()).await;
        h.mailer
            .faults
            .fail_always(AdapterError::transient("email", "421 try later"));
        let run = h.run(config(), "p1", false).await;

        assert_eq!(run.stage, Stage::Failed);
        assert!(run.terminal);
        let err = run.last_error.as_ref().unwrap();
        assert_eq!(err.stage, Stage::Emailing);
        assert_eq!(err.error_class, "transient");
        assert!(run.results.research.as_deref().is_some_and(|r| !r.is_empty()));
        assert!(run.results.proposal.as_deref().is_some_and(|p| !p.is_empty()));
        assert_eq!(run.results.call_outcome, Some(CallOutcome::AgreedToEmail));
        assert_eq!(h.mailer.calls(), 2);
        assert_eq!(
            h.run_stages().last(),
            Some(&(EventKind::PipelineFailed, Stage::Failed))
        );
        assert!(h.ledger.active_run("p1").await.is_none());
    }

    #[tokio::test]
    async fn unparseable_outcome_is_unknown_and_observable() {
        let h = Harness::new(lead()).await;
        h.outcome
            .force(Classified::unparseable("the owner seemed busy, maybe?"));
        let run = h.run(config(), "p1", false).await;

        assert_eq!(run.results.call_outcome, Some(CallOutcome::Unknown));
        let step = run
            .step_log
            .iter()
            .find(|s| s.stage == Stage::Classifying)
            .unwrap();
        assert_eq!(step.outcome, StepOutcome::Fallback);
        assert!(step.note.contains("unparseable"));
        assert!(run.results.email_sent);
    }

    #[tokio::test]
    async fn research_outage_falls_back() {
        let h = Harness::new(lead()).await;
        h.research
            .faults
            .fail_always(AdapterError::unavailable("research", "no key"));
        let run = h.run(config(), "p1", false).await;

        assert_eq!(h.research.calls(), 1);
        assert!(run.results.research.as_deref().unwrap().contains("Joe's Cafe"));
        assert_eq!(run.step_log[0].outcome, StepOutcome::Fallback);
        assert_eq!(run.stage, Stage::AwaitingReply);
    }

    #[tokio::test]
    async fn failed_call_records_unknown_outcome() {
        let h = Harness::new(lead().with_email("owner@joescafe.com")).await;
        h.telephony
            .faults
            .fail_always(AdapterError::unavailable("calling", "cooldown"));
        let run = h.run(config(), "p1", false).await;

        assert!(run.results.transcript.is_none());
        assert_eq!(run.results.call_outcome, Some(CallOutcome::Unknown));
        assert_eq!(h.outcome.calls(), 0);
        assert_eq!(run.results.recipient.as_deref(), Some("owner@joescafe.com"));
    }

    #[tokio::test]
    async fn no_recipient_fails_the_run() {
        let h = Harness::new(lead()).await;
        h.telephony
            .faults
            .fail_always(AdapterError::unavailable("calling", "down"));
        let run = h.run(config(), "p1", false).await;

        assert_eq!(run.stage, Stage::Failed);
        let err = run.last_error.unwrap();
        assert_eq!(err.stage, Stage::Emailing);
        assert_eq!(err.error_class, "semantic");
        assert_eq!(h.mailer.calls(), 0);
    }

    #[tokio::test]
    async fn fallback_recipient_is_used() {
        let h = Harness::new(lead()).await;
        h.telephony
            .faults
            .fail_always(AdapterError::unavailable("calling", "down"));
        let config = PipelineConfig {
            fallback_email: Some("leads@rapidreach.test".into()),
            ..config()
        };
        let run = h.run(config, "p1", false).await;
        assert_eq!(run.results.recipient.as_deref(), Some("leads@rapidreach.test"));
    }

    #[tokio::test]
    async fn call_poll_exhaustion_degrades() {
        let h = Harness::new(lead().with_email("owner@joescafe.com")).await;
        h.telephony.set_pending_polls(10);
        let run = h.run(config(), "p1", false).await;

        let step = run.step_log.iter().find(|s| s.stage == Stage::Calling).unwrap();
        assert_eq!(step.outcome, StepOutcome::Fallback);
        assert_eq!(run.results.call_outcome, Some(CallOutcome::Unknown));
        assert!(run.results.email_sent);
    }

    #[tokio::test]
    async fn cancellation_stops_a_live_run() {
        let h = Harness::new(lead()).await;
        h.telephony.set_pending_polls(u32::MAX);
        let config = PipelineConfig {
            call_poll_interval: Duration::from_secs(30),
            call_poll_attempts: 100,
            ..config()
        };
        let run = PipelineRun::new("p1", Default::default());
        let cancel = h.ledger.claim(&run).await.unwrap();
        let runner = h.runner(config);
        let task = tokio::spawn(async move { runner.execute(run, cancel).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.ledger.cancel("p1").await.unwrap();
        let run = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(run.stage, Stage::Failed);
        let err = run.last_error.unwrap();
        assert_eq!(err.error_class, "cancelled");
        assert_eq!(err.stage, Stage::Calling);
        assert!(h.mailer.sent().is_empty());
    }
}
