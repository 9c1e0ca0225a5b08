//! `DurableStore` trait: the narrow persistence interface behind the registry,
//! the run ledger and the meeting book.
//!
//! Writes are whole-record upserts keyed by identity. Callers own retry policy.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::leads::model::Lead;
use crate::meetings::Meeting;
use crate::pipeline::types::PipelineRun;

#[async_trait]
pub trait DurableStore: Send + Sync {
    // ── Leads ───────────────────────────────────────────────────────

    async fn get_lead(&self, place_id: &str) -> Result<Option<Lead>, StoreError>;

    /// Insert or replace the lead with the same place id.
    async fn put_lead(&self, lead: &Lead) -> Result<(), StoreError>;

    async fn load_leads(&self) -> Result<Vec<Lead>, StoreError>;

    // ── Runs ────────────────────────────────────────────────────────

    /// Insert or replace the run with the same id.
    async fn put_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError>;

    /// All runs, oldest first.
    async fn load_runs(&self) -> Result<Vec<PipelineRun>, StoreError>;

    // ── Meetings ────────────────────────────────────────────────────

    async fn put_meeting(&self, meeting: &Meeting) -> Result<(), StoreError>;

    /// All meetings, oldest first.
    async fn load_meetings(&self) -> Result<Vec<Meeting>, StoreError>;
}
