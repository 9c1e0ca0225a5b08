//! Dedup/merge engine: combines two records for the same place into the richest union.
//!
//! Rules, applied per field:
//! - an empty incoming value never overwrites a populated one;
//! - `status` and `rating` are operational: a populated incoming value wins;
//! - `name` and `address` are identity-adjacent: the existing value is kept
//!   unless it is a placeholder;
//! - every other text field keeps the existing value and only fills gaps.
//!
//! `merge(Some(x), x) == x` and `merge(Some(merge(Some(a), b)), b) == merge(Some(a), b)`.

use std::collections::HashMap;

use super::model::{Lead, LeadStatus};

/// Values a provider emits when it has no real name or address.
const PLACEHOLDERS: &[&str] = &["unknown", "unknown business", "n/a", "na", "none", "-"];

fn is_empty(value: &str) -> bool {
    value.trim().is_empty()
}

fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || PLACEHOLDERS.iter().any(|p| v.eq_ignore_ascii_case(p))
}

/// Keep `existing` unless it is empty.
fn fill_gap(existing: &str, incoming: &str) -> String {
    if is_empty(existing) {
        incoming.to_string()
    } else {
        existing.to_string()
    }
}

/// Keep `existing` unless it is a placeholder and `incoming` has something.
fn keep_identity(existing: &str, incoming: &str) -> String {
    if is_placeholder(existing) && !is_empty(incoming) {
        incoming.to_string()
    } else {
        existing.to_string()
    }
}

/// Merge an incoming record into the existing one (if any).
///
/// With no existing record the incoming record is returned as-is.
pub fn merge(existing: Option<&Lead>, incoming: &Lead) -> Lead {
    let Some(existing) = existing else {
        return incoming.clone();
    };

    Lead {
        place_id: if is_empty(&existing.place_id) {
            incoming.place_id.clone()
        } else {
            existing.place_id.clone()
        },
        name: keep_identity(&existing.name, &incoming.name),
        address: keep_identity(&existing.address, &incoming.address),
        city: fill_gap(&existing.city, &incoming.city),
        phone: fill_gap(&existing.phone, &incoming.phone),
        email: fill_gap(&existing.email, &incoming.email),
        rating: incoming.rating.or(existing.rating),
        category: fill_gap(&existing.category, &incoming.category),
        has_website: existing.has_website || incoming.has_website,
        status: if incoming.status == LeadStatus::New {
            existing.status
        } else {
            incoming.status
        },
        notes: fill_gap(&existing.notes, &incoming.notes),
        discovered_at: existing.discovered_at.min(incoming.discovered_at),
    }
}

/// Collapse a discovery batch so each place id appears once, in first-seen order.
///
/// Records without a place id cannot be keyed and are dropped.
pub fn dedup_batch(batch: Vec<Lead>) -> Vec<Lead> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Lead> = HashMap::new();

    for lead in batch {
        if is_empty(&lead.place_id) {
            tracing::debug!(name = %lead.name, "Dropping discovery record without place id");
            continue;
        }
        match merged.get(&lead.place_id) {
            Some(existing) => {
                let next = merge(Some(existing), &lead);
                merged.insert(lead.place_id.clone(), next);
            }
            None => {
                order.push(lead.place_id.clone());
                merged.insert(lead.place_id.clone(), lead);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| merged.remove(&id))
        .collect()
}
