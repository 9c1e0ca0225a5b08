//! In-memory `DurableStore`, used when no database path is configured and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::DurableStore;
use crate::error::StoreError;
use crate::leads::model::Lead;
use crate::meetings::Meeting;
use crate::pipeline::types::PipelineRun;

#[derive(Default)]
pub struct MemoryStore {
    leads: RwLock<HashMap<String, Lead>>,
    runs: RwLock<Vec<PipelineRun>>,
    meetings: RwLock<Vec<Meeting>>,
    /// Number of upcoming writes that fail, for exercising retry paths.
    failing_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write calls fail with a query error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self, what: &str) -> Result<(), StoreError> {
        let remaining = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(StoreError::Query(format!("{what}: injected failure"))),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_lead(&self, place_id: &str) -> Result<Option<Lead>, StoreError> {
        Ok(self.leads.read().await.get(place_id).cloned())
    }

    async fn put_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        self.check_write("put_lead")?;
        self.leads
            .write()
            .await
            .insert(lead.place_id.clone(), lead.clone());
        Ok(())
    }

    async fn load_leads(&self) -> Result<Vec<Lead>, StoreError> {
        let mut leads: Vec<Lead> = self.leads.read().await.values().cloned().collect();
        leads.sort_by(|a, b| a.discovered_at.cmp(&b.discovered_at));
        Ok(leads)
    }

    async fn put_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.check_write("put_run")?;
        let mut runs = self.runs.write().await;
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.runs.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn load_runs(&self) -> Result<Vec<PipelineRun>, StoreError> {
        Ok(self.runs.read().await.clone())
    }

    async fn put_meeting(&self, meeting: &Meeting) -> Result<(), StoreError> {
        self.check_write("put_meeting")?;
        self.meetings.write().await.push(meeting.clone());
        Ok(())
    }

    async fn load_meetings(&self) -> Result<Vec<Meeting>, StoreError> {
        Ok(self.meetings.read().await.clone())
    }
}
