//! libSQL backend: async `DurableStore` implementation.
//!
//! Records are stored as JSON bodies keyed by identity, with a few indexed
//! columns duplicated out of the body for filtering. Supports local file and
//! in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::leads::model::Lead;
use crate::meetings::Meeting;
use crate::pipeline::types::PipelineRun;
use crate::store::migrations;
use crate::store::traits::DurableStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a single-column `SELECT body ...` and decode every row.
    async fn query_bodies<T: DeserializeOwned>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<T>, StoreError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let body: String = row
                        .get(0)
                        .map_err(|e| StoreError::Query(format!("{op} row parse: {e}")))?;
                    out.push(from_json(op, &body)?);
                }
                Ok(None) => break,
                Err(e) => return Err(StoreError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn to_json<T: serde::Serialize>(op: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(format!("{op}: {e}")))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn from_json<T: DeserializeOwned>(op: &str, body: &str) -> Result<T, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Serialization(format!("{op}: {e}")))
}

#[async_trait]
impl DurableStore for LibSqlStore {
    // ── Leads ───────────────────────────────────────────────────────

    async fn get_lead(&self, place_id: &str) -> Result<Option<Lead>, StoreError> {
        let mut leads: Vec<Lead> = self
            .query_bodies(
                "get_lead",
                "SELECT body FROM leads WHERE place_id = ?1",
                params![place_id],
            )
            .await?;
        Ok(leads.pop())
    }

    async fn put_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        let body = to_json("put_lead", lead)?;
        self.conn()
            .execute(
                "INSERT INTO leads (place_id, status, body, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (place_id) DO UPDATE SET status = ?2, body = ?3, updated_at = ?4",
                params![
                    lead.place_id.clone(),
                    lead.status.to_string(),
                    body,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("put_lead: {e}")))?;

        debug!(lead_id = %lead.place_id, "Lead persisted");
        Ok(())
    }

    async fn load_leads(&self) -> Result<Vec<Lead>, StoreError> {
        let mut leads: Vec<Lead> = self
            .query_bodies("load_leads", "SELECT body FROM leads", ())
            .await?;
        leads.sort_by(|a, b| a.discovered_at.cmp(&b.discovered_at));
        Ok(leads)
    }

    // ── Runs ────────────────────────────────────────────────────────

    async fn put_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let body = to_json("put_run", run)?;
        self.conn()
            .execute(
                "INSERT INTO pipeline_runs (id, lead_id, stage, terminal, body, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (id) DO UPDATE SET stage = ?3, terminal = ?4, body = ?5, updated_at = ?7",
                params![
                    run.id.to_string(),
                    run.lead_id.clone(),
                    run.stage.as_str(),
                    run.terminal as i64,
                    body,
                    run.started_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("put_run: {e}")))?;

        debug!(run_id = %run.id, stage = %run.stage, "Run persisted");
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        let mut runs: Vec<PipelineRun> = self
            .query_bodies(
                "get_run",
                "SELECT body FROM pipeline_runs WHERE id = ?1",
                params![id.to_string()],
            )
            .await?;
        Ok(runs.pop())
    }

    async fn load_runs(&self) -> Result<Vec<PipelineRun>, StoreError> {
        self.query_bodies(
            "load_runs",
            "SELECT body FROM pipeline_runs ORDER BY started_at ASC",
            (),
        )
        .await
    }

    // ── Meetings ────────────────────────────────────────────────────

    async fn put_meeting(&self, meeting: &Meeting) -> Result<(), StoreError> {
        let body = to_json("put_meeting", meeting)?;
        self.conn()
            .execute(
                "INSERT INTO meetings (id, lead_id, run_id, start_at, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET body = ?5",
                params![
                    meeting.id.to_string(),
                    meeting.lead_id.clone(),
                    opt_text_owned(meeting.run_id.map(|id| id.to_string())),
                    meeting.start.to_rfc3339(),
                    body,
                    meeting.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("put_meeting: {e}")))?;
        Ok(())
    }

    async fn load_meetings(&self) -> Result<Vec<Meeting>, StoreError> {
        self.query_bodies(
            "load_meetings",
            "SELECT body FROM meetings ORDER BY created_at ASC",
            (),
        )
        .await
    }
}
