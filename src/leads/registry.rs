//! Lead registry: authoritative in-memory map of place id → lead.
//!
//! All writes go through the merge engine and are serialized per identity,
//! so concurrent upserts for one lead can neither tear a merge nor persist
//! out of order. Events are published while the map's write lock is held,
//! which lets [`LeadRegistry::subscribe_with_snapshot`] pair a snapshot with
//! the exact sequence number it reflects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::merge::merge;
use super::model::{Lead, LeadFilter, LeadStatus};
use crate::capabilities::retry::RetryPolicy;
use crate::error::{AdapterError, StoreError};
use crate::events::bus::{EventBus, Subscription};
use crate::events::model::{EventKind, EventPayload, FailureNotice};
use crate::store::DurableStore;

/// Upper bound for one durable-store write attempt.
const STORE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LeadRegistry {
    leads: RwLock<HashMap<String, Lead>>,
    key_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    store: Arc<dyn DurableStore>,
    bus: EventBus,
    retry: RetryPolicy,
}

impl LeadRegistry {
    pub fn new(store: Arc<dyn DurableStore>, bus: EventBus, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            leads: RwLock::new(HashMap::new()),
            key_locks: StdMutex::new(HashMap::new()),
            store,
            bus,
            retry,
        })
    }

    /// Load persisted leads. No events are published for hydrated records.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let loaded = self.store.load_leads().await?;
        let mut leads = self.leads.write().await;
        for lead in loaded {
            leads.insert(lead.place_id.clone(), lead);
        }
        info!(count = leads.len(), "Lead registry hydrated from store");
        Ok(leads.len())
    }

    fn key_lock(&self, place_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(place_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Merge each candidate into the registry.
    ///
    /// Returns the stored value per candidate and whether it changed. Only
    /// changed values are persisted and announced (`lead_found` for a new
    /// identity, `lead_updated` otherwise).
    pub async fn upsert(&self, candidates: Vec<Lead>) -> Vec<(Lead, bool)> {
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.place_id.trim().is_empty() {
                warn!(name = %candidate.name, "Skipping lead without place id");
                continue;
            }
            let key_lock = self.key_lock(&candidate.place_id);
            let _guard = key_lock.lock().await;

            let (stored, changed) = {
                let mut leads = self.leads.write().await;
                let existing = leads.get(&candidate.place_id);
                let merged = merge(existing, &candidate);
                let kind = if existing.is_none() {
                    EventKind::LeadFound
                } else {
                    EventKind::LeadUpdated
                };
                let changed = existing != Some(&merged);
                if changed {
                    leads.insert(merged.place_id.clone(), merged.clone());
                    self.bus.publish(kind, EventPayload::Lead(merged.clone()));
                }
                (merged, changed)
            };

            if changed {
                self.persist(&stored).await;
            } else {
                debug!(lead_id = %stored.place_id, "Upsert left lead unchanged");
            }
            out.push((stored, changed));
        }
        out
    }

    /// Apply `update` to an existing lead in place (operational writes such as
    /// status transitions). Returns `None` for an unknown id.
    pub async fn apply<F>(&self, place_id: &str, update: F) -> Option<(Lead, bool)>
    where
        F: FnOnce(&mut Lead),
    {
        let key_lock = self.key_lock(place_id);
        let _guard = key_lock.lock().await;

        let (stored, changed) = {
            let mut leads = self.leads.write().await;
            let lead = leads.get_mut(place_id)?;
            let before = lead.clone();
            update(lead);
            let changed = *lead != before;
            if changed {
                self.bus
                    .publish(EventKind::LeadUpdated, EventPayload::Lead(lead.clone()));
            }
            (lead.clone(), changed)
        };

        if changed {
            self.persist(&stored).await;
        }
        Some((stored, changed))
    }

    /// Set a lead's status. Returns the updated lead, `None` for an unknown id.
    pub async fn set_status(&self, place_id: &str, status: LeadStatus) -> Option<Lead> {
        let (lead, changed) = self.apply(place_id, |lead| lead.status = status).await?;
        if changed {
            info!(lead_id = %place_id, status = %status, "Lead status changed");
        }
        Some(lead)
    }

    /// Fill the lead's e-mail if it has none. Never overwrites a known address.
    pub async fn fill_email(&self, place_id: &str, email: &str) -> Option<Lead> {
        let email = email.trim().to_string();
        self.apply(place_id, |lead| {
            if lead.email.trim().is_empty() && !email.is_empty() {
                lead.email = email;
            }
        })
        .await
        .map(|(lead, _)| lead)
    }

    async fn persist(&self, lead: &Lead) {
        let store = self.store.clone();
        let result = self
            .retry
            .run("store", STORE_TIMEOUT, || {
                let store = store.clone();
                async move {
                    store
                        .put_lead(lead)
                        .await
                        .map_err(|e| AdapterError::transient("store", e.to_string()))
                }
            })
            .await;

        if let Err(e) = result {
            warn!(lead_id = %lead.place_id, error = %e, "Lead persistence exhausted retries");
            self.bus.publish(
                EventKind::PersistenceFailed,
                EventPayload::Failure(FailureNotice {
                    stage: None,
                    lead_id: Some(lead.place_id.clone()),
                    run_id: None,
                    message_id: None,
                    error_class: "persistence".into(),
                    message: e.to_string(),
                }),
            );
        }
    }

    pub async fn get(&self, place_id: &str) -> Option<Lead> {
        self.leads.read().await.get(place_id).cloned()
    }

    /// Leads matching `filter`, oldest discovery first. Iterates a snapshot.
    pub async fn list(&self, filter: &LeadFilter) -> impl Iterator<Item = Lead> {
        let mut leads: Vec<Lead> = self
            .leads
            .read()
            .await
            .values()
            .filter(|lead| filter.matches(lead))
            .cloned()
            .collect();
        leads.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.place_id.cmp(&b.place_id))
        });
        leads.into_iter()
    }

    /// Find a lead by e-mail address (case-insensitive).
    pub async fn find_by_email(&self, email: &str) -> Option<Lead> {
        let email = email.trim();
        if email.is_empty() {
            return None;
        }
        self.leads
            .read()
            .await
            .values()
            .find(|lead| lead.email.trim().eq_ignore_ascii_case(email))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.leads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leads.read().await.is_empty()
    }

    /// Snapshot of every lead plus a live subscription starting right after it.
    ///
    /// Returns the sequence number the snapshot reflects.
    pub async fn subscribe_with_snapshot(&self) -> (u64, Vec<Lead>, Subscription) {
        let leads = self.leads.read().await;
        let (seq, subscription) = self.bus.subscribe_live();
        let mut snapshot: Vec<Lead> = leads.values().cloned().collect();
        drop(leads);
        snapshot.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.place_id.cmp(&b.place_id))
        });
        (seq, snapshot, subscription)
    }
}
