//! Outreach pipeline.
//!
//! A run moves one lead through research, drafting, an optional fact check,
//! a phone call, outcome classification, an optional proposal deck and the
//! outreach e-mail, then parks until the inbound router sees a reply:
//!
//! 1. `RunManager::start()`: claim the lead, spawn the run task
//! 2. `PipelineRunner::execute()`: drive the stages, degrading where allowed
//! 3. `RunLedger::commit()`: persist each transition and publish its event
//! 4. `RunManager::complete_scheduling()`: finish a parked run after a booking

pub mod manager;
pub mod outreach;
pub mod runner;
pub mod transcript;
pub mod types;

pub use manager::{RunLedger, RunManager, StartedRun};
pub use runner::PipelineRunner;
pub use types::{CallOutcome, PipelineRun, RunOptions, Stage, StageResults, StepOutcome};
