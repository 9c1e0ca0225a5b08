//! Telephony decorator that refuses repeat calls to the same number.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use super::types::{AdapterResult, CallHandle, CallStatus, Telephony};
use crate::error::AdapterError;
use crate::leads::model::Lead;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3600);

/// Normalise a North American number to `+1XXXXXXXXXX`.
///
/// Returns `None` when fewer than 10 digits remain.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 10 {
        return None;
    }
    if digits.len() == 10 && !digits.starts_with('1') {
        return Some(format!("+1{digits}"));
    }
    Some(format!("+{digits}"))
}

pub struct CooldownTelephony {
    inner: Arc<dyn Telephony>,
    window: Duration,
    last_call: Mutex<HashMap<String, Instant>>,
}

impl CooldownTelephony {
    pub fn new(inner: Arc<dyn Telephony>, window: Duration) -> Self {
        Self {
            inner,
            window,
            last_call: Mutex::new(HashMap::new()),
        }
    }

    fn calls(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.last_call.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a number's cooldown slot while a call is being placed.
///
/// Released on drop unless the call went out, so an error or an elapsed
/// timeout leaves the number free for a retry.
struct Reservation<'a> {
    owner: &'a CooldownTelephony,
    phone: String,
    at: Instant,
    placed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.placed {
            return;
        }
        let mut last_call = self.owner.calls();
        if last_call.get(&self.phone) == Some(&self.at) {
            last_call.remove(&self.phone);
        }
    }
}

#[async_trait]
impl Telephony for CooldownTelephony {
    async fn place_call(&self, lead: &Lead, script: &str) -> AdapterResult<CallHandle> {
        let phone = normalize_phone(&lead.phone).ok_or_else(|| {
            AdapterError::semantic("calling", format!("invalid phone number {:?}", lead.phone))
        })?;

        let mut reservation = {
            let mut last_call = self.calls();
            if let Some(at) = last_call.get(&phone)
                && at.elapsed() < self.window
            {
                let wait = self.window.saturating_sub(at.elapsed());
                warn!(lead_id = %lead.place_id, phone = %phone, wait_secs = wait.as_secs(), "Call refused, number in cooldown");
                return Err(AdapterError::unavailable(
                    "calling",
                    format!("{phone} was called recently, retry in {}s", wait.as_secs()),
                ));
            }
            let at = Instant::now();
            last_call.insert(phone.clone(), at);
            Reservation {
                owner: self,
                phone: phone.clone(),
                at,
                placed: false,
            }
        };

        let mut normalized = lead.clone();
        normalized.phone = phone.clone();
        info!(lead_id = %lead.place_id, phone = %phone, "Placing call");
        let handle = self.inner.place_call(&normalized, script).await?;
        reservation.placed = true;
        Ok(handle)
    }

    async fn fetch_transcript(&self, handle: &CallHandle) -> AdapterResult<CallStatus> {
        self.inner.fetch_transcript(handle).await
    }
}
