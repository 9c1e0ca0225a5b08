//! Discovery ingestion: paginated search, filtering, batch dedup, registry upsert.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use super::merge::dedup_batch;
use super::model::Lead;
use super::registry::LeadRegistry;
use crate::capabilities::retry::RetryPolicy;
use crate::capabilities::types::{LeadSearch, SearchFilters};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;

/// Chains whose locations are listed under the bare brand, optionally
/// followed by more words ("Starbucks Reserve", "CVS Pharmacy").
static CHAIN_BRAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:the\s+)?(?:starbucks|subway|walmart|target|costco|walgreens|cvs|7-eleven|dunkin|burger\s+king|taco\s+bell|chick-fil-a|pizza\s+hut)\b",
    )
    .expect("valid regex")
});

/// Possessive brands. These only match the whole name or a branch qualifier
/// after it, so "Wendy's Bakery" is not taken for the chain.
static CHAIN_POSSESSIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:mcdonald'?s|wendy'?s|domino'?s(?:\s+pizza)?|papa\s+john'?s(?:\s+pizza)?)\s*(?:$|[-#(,|@])",
    )
    .expect("valid regex")
});

/// Whether a business name belongs to a well-known chain.
pub fn is_chain(name: &str) -> bool {
    let name = name.trim().to_lowercase().replace('\u{2019}', "'");
    CHAIN_BRAND.is_match(&name) || CHAIN_POSSESSIVE.is_match(&name)
}

/// Whether a search result should be ingested.
pub fn passes_filters(lead: &Lead, filters: &SearchFilters, exclude_chains: bool) -> bool {
    if exclude_chains && is_chain(&lead.name) {
        return false;
    }
    if let Some(min) = filters.min_rating
        && lead.rating.unwrap_or(0.0) < min
    {
        return false;
    }
    if filters.only_without_website && lead.has_website {
        return false;
    }
    true
}

/// Outcome of one discovery run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub area: String,
    pub pages: usize,
    /// Distinct identities kept after filtering and dedup.
    pub found: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Results dropped by the filters.
    pub filtered: usize,
    /// At least one page came from a mock/fallback provider.
    pub degraded: bool,
}

pub struct DiscoveryService {
    registry: Arc<LeadRegistry>,
    search: Arc<dyn LeadSearch>,
    config: DiscoveryConfig,
    retry: RetryPolicy,
    timeout: Duration,
    active: Mutex<HashSet<String>>,
}

/// Releases the per-area slot when a discovery finishes or is dropped.
struct AreaGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for AreaGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl DiscoveryService {
    pub fn new(
        registry: Arc<LeadRegistry>,
        search: Arc<dyn LeadSearch>,
        config: DiscoveryConfig,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            search,
            config,
            retry,
            timeout,
            active: Mutex::new(HashSet::new()),
        })
    }

    fn claim(&self, area: &str) -> Result<AreaGuard<'_>, DiscoveryError> {
        let key = area.trim().to_lowercase();
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.clone()) {
            return Err(DiscoveryError::AlreadyRunning {
                area: area.to_string(),
            });
        }
        Ok(AreaGuard {
            active: &self.active,
            key,
        })
    }

    pub fn is_running(&self, area: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&area.trim().to_lowercase())
    }

    /// Search `area`, filter, dedup and merge the results into the registry.
    ///
    /// A second call for the same area while one is running is rejected.
    /// A failure on the first page fails the run; a failure on a later page
    /// keeps what was already fetched.
    pub async fn discover(
        &self,
        area: &str,
        filters: &SearchFilters,
    ) -> Result<DiscoveryReport, DiscoveryError> {
        let _guard = self.claim(area)?;
        info!(area, category = %filters.category, "Discovery started");

        let mut report = DiscoveryReport {
            area: area.to_string(),
            ..Default::default()
        };
        let mut batch = Vec::new();
        let mut page_token: Option<String> = None;

        for page_no in 0..self.config.max_pages.max(1) {
            let token = page_token.clone();
            let result = self
                .retry
                .run("search", self.timeout, || {
                    self.search.search_leads(area, filters, token.as_deref())
                })
                .await;

            let page = match result {
                Ok(page) => page,
                Err(e) if page_no == 0 => return Err(DiscoveryError::Search(e)),
                Err(e) => {
                    warn!(area, page = page_no, error = %e, "Search page failed, keeping earlier pages");
                    break;
                }
            };

            report.pages += 1;
            report.degraded |= page.degraded;
            for lead in page.leads {
                if passes_filters(&lead, filters, self.config.exclude_chains) {
                    batch.push(lead);
                } else {
                    report.filtered += 1;
                }
            }

            match page.next_page {
                Some(next) if batch.len() < self.config.max_results => page_token = Some(next),
                _ => break,
            }
        }

        let mut batch = dedup_batch(batch);
        batch.truncate(self.config.max_results);
        report.found = batch.len();

        let mut known = HashSet::new();
        for lead in &batch {
            if self.registry.get(&lead.place_id).await.is_some() {
                known.insert(lead.place_id.clone());
            }
        }

        for (lead, changed) in self.registry.upsert(batch).await {
            match (changed, known.contains(&lead.place_id)) {
                (false, _) => report.unchanged += 1,
                (true, false) => report.new += 1,
                (true, true) => report.updated += 1,
            }
        }

        info!(
            area,
            pages = report.pages,
            found = report.found,
            new = report.new,
            updated = report.updated,
            filtered = report.filtered,
            degraded = report.degraded,
            "Discovery finished"
        );
        Ok(report)
    }
}
