//! Shared types for the outreach pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capabilities::types::{ArtifactRef, DeliveryReceipt, FactVerdict};

// ── Stage ───────────────────────────────────────────────────────────

/// Pipeline state. Stages only ever advance in declaration order; any state
/// may jump to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Researching,
    Drafting,
    FactChecking,
    Calling,
    Classifying,
    GeneratingArtifact,
    Emailing,
    AwaitingReply,
    Scheduling,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// A stage where a live task owns the run. Runs found in one of these at
    /// startup were interrupted by a crash.
    pub fn is_mid_flight(self) -> bool {
        !self.is_terminal() && self != Self::AwaitingReply
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Researching => "RESEARCHING",
            Self::Drafting => "DRAFTING",
            Self::FactChecking => "FACT_CHECKING",
            Self::Calling => "CALLING",
            Self::Classifying => "CLASSIFYING",
            Self::GeneratingArtifact => "GENERATING_ARTIFACT",
            Self::Emailing => "EMAILING",
            Self::AwaitingReply => "AWAITING_REPLY",
            Self::Scheduling => "SCHEDULING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Call outcome ────────────────────────────────────────────────────

/// Result of classifying a call transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Interested,
    AgreedToEmail,
    NotInterested,
    /// No usable signal: no transcript, or the classifier answered outside
    /// the known set.
    Unknown,
    /// The call stage was configured off for this run.
    Skipped,
}

impl CallOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interested => "interested",
            Self::AgreedToEmail => "agreed_to_email",
            Self::NotInterested => "not_interested",
            Self::Unknown => "unknown",
            Self::Skipped => "skipped",
        }
    }

    /// Parse a classifier label. Anything outside the known set is `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "interested" => Some(Self::Interested),
            "agreed_to_email" => Some(Self::AgreedToEmail),
            "not_interested" => Some(Self::NotInterested),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Run ─────────────────────────────────────────────────────────────

/// Per-run options supplied by the trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Go straight from drafting/fact-checking to e-mail without calling.
    #[serde(default)]
    pub skip_call: bool,
}

/// Payloads recorded by each stage. Never cleared once set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResults {
    #[serde(default)]
    pub research: Option<String>,
    #[serde(default)]
    pub proposal: Option<String>,
    #[serde(default)]
    pub fact_check: Option<FactVerdict>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub call_outcome: Option<CallOutcome>,
    /// Follow-up time the prospect proposed on the call.
    #[serde(default)]
    pub proposed_meeting_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub email_sent: bool,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub receipt: Option<DeliveryReceipt>,
    #[serde(default)]
    pub meeting_id: Option<Uuid>,
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    /// The adapter failed and a degraded default was recorded instead.
    Fallback,
    Skipped,
    Failed,
}

/// One entry in a run's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub stage: Stage,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
    pub at: DateTime<Utc>,
}

/// Last error that moved a run to `FAILED` (or forced a fallback).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub stage: Stage,
    pub error_class: String,
    pub message: String,
}

/// One execution of the outreach state machine for one lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub lead_id: String,
    pub stage: Stage,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default)]
    pub results: StageResults,
    #[serde(default)]
    pub step_log: Vec<StepRecord>,
    #[serde(default)]
    pub last_error: Option<RunError>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terminal: bool,
}

impl PipelineRun {
    pub fn new(lead_id: impl Into<String>, options: RunOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id: lead_id.into(),
            stage: Stage::Researching,
            options,
            results: StageResults::default(),
            step_log: Vec::new(),
            last_error: None,
            started_at: Utc::now(),
            finished_at: None,
            terminal: false,
        }
    }

    /// Append an audit record for `stage`.
    pub fn record(&mut self, stage: Stage, outcome: StepOutcome, note: impl Into<String>) {
        self.step_log.push(StepRecord {
            stage,
            outcome,
            note: note.into(),
            at: Utc::now(),
        });
    }

    /// Move to `next`. Returns `false` (and changes nothing) if that would
    /// move backwards or leave a terminal state.
    pub fn advance(&mut self, next: Stage) -> bool {
        if self.terminal || (next != Stage::Failed && next < self.stage) {
            return false;
        }
        self.stage = next;
        if next.is_terminal() {
            self.terminal = true;
            self.finished_at = Some(Utc::now());
        }
        true
    }

    /// Move to `FAILED`, keeping every recorded payload.
    pub fn fail(&mut self, stage: Stage, error_class: impl Into<String>, message: impl Into<String>) {
        let message = message.into();
        self.record(stage, StepOutcome::Failed, message.clone());
        self.last_error = Some(RunError {
            stage,
            error_class: error_class.into(),
            message,
        });
        self.advance(Stage::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Researching < Stage::Drafting);
        assert!(Stage::Emailing < Stage::AwaitingReply);
        assert!(Stage::Scheduling < Stage::Done);
    }

    #[test]
    fn stage_serializes_screaming_case() {
        let json = serde_json::to_string(&Stage::FactChecking).unwrap();
        assert_eq!(json, "\"FACT_CHECKING\"");
        assert_eq!(Stage::GeneratingArtifact.to_string(), "GENERATING_ARTIFACT");
    }

    #[test]
    fn advance_refuses_to_go_back() {
        let mut run = PipelineRun::new("p1", RunOptions::default());
        assert!(run.advance(Stage::Emailing));
        assert!(!run.advance(Stage::Drafting));
        assert_eq!(run.stage, Stage::Emailing);
    }

    #[test]
    fn fail_keeps_results_and_is_final() {
        let mut run = PipelineRun::new("p1", RunOptions::default());
        run.results.research = Some("summary".into());
        run.advance(Stage::Emailing);
        run.fail(Stage::Emailing, "transient", "smtp 451");
        assert_eq!(run.stage, Stage::Failed);
        assert!(run.terminal);
        assert!(run.finished_at.is_some());
        assert_eq!(run.results.research.as_deref(), Some("summary"));
        assert_eq!(run.last_error.as_ref().map(|e| e.stage), Some(Stage::Emailing));
        assert!(!run.advance(Stage::Done));
    }

    #[test]
    fn unknown_outcome_labels_are_rejected() {
        assert_eq!(CallOutcome::from_label("Agreed to email"), Some(CallOutcome::AgreedToEmail));
        assert_eq!(CallOutcome::from_label("maybe later"), None);
    }

    #[test]
    fn mid_flight_excludes_parked_and_terminal() {
        assert!(Stage::Calling.is_mid_flight());
        assert!(!Stage::AwaitingReply.is_mid_flight());
        assert!(!Stage::Done.is_mid_flight());
    }
}
