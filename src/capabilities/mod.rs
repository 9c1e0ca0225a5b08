//! Capability adapters: one trait per external service, plus live and fake
//! implementations selected at construction time.

pub mod cooldown;
pub mod fake;
pub mod llm;
pub mod maps;
pub mod retry;
pub mod smtp;
pub mod types;

use std::sync::Arc;

use tracing::info;

pub use retry::RetryPolicy;
pub use types::*;

use crate::config::AdapterKeys;
use cooldown::{CooldownTelephony, DEFAULT_COOLDOWN};

/// The full set of adapters the engine talks to.
#[derive(Clone)]
pub struct Capabilities {
    pub search: Arc<dyn LeadSearch>,
    pub research: Arc<dyn Research>,
    pub writer: Arc<dyn ProposalWriter>,
    pub telephony: Arc<dyn Telephony>,
    pub outcome: Arc<dyn OutcomeClassifier>,
    pub artifacts: Arc<dyn ArtifactGenerator>,
    pub email: Arc<dyn EmailSender>,
    pub inbox: Arc<dyn Inbox>,
    pub replies: Arc<dyn ReplyClassifier>,
    pub calendar: Arc<dyn Calendar>,
}

impl Capabilities {
    /// Every capability backed by its in-process fake.
    pub fn fake() -> Self {
        Self {
            search: Arc::new(fake::FakeSearch::default()),
            research: Arc::new(fake::FakeResearch::default()),
            writer: Arc::new(fake::FakeWriter::default()),
            telephony: Arc::new(fake::FakeTelephony::default()),
            outcome: Arc::new(fake::FakeOutcomeClassifier::default()),
            artifacts: Arc::new(fake::FakeArtifacts::default()),
            email: Arc::new(fake::RecordingMailer::default()),
            inbox: Arc::new(fake::FakeInbox::default()),
            replies: Arc::new(fake::FakeReplyClassifier::default()),
            calendar: Arc::new(fake::FakeCalendar::default()),
        }
    }

    /// Live adapters where credentials exist, fakes elsewhere.
    pub fn from_config(keys: &AdapterKeys) -> Self {
        let mut caps = Self::fake();

        if let Some(api_key) = &keys.llm_api_key {
            let client = Arc::new(llm::LlmClient::new(
                keys.llm_base_url.clone(),
                api_key.clone(),
                keys.llm_model.clone(),
            ));
            caps.research = client.clone();
            caps.writer = client.clone();
            caps.outcome = client.clone();
            caps.replies = client;
            info!(model = %keys.llm_model, "Using live LLM adapter");
        } else {
            info!("LLM_API_KEY not set, using fake text adapters");
        }

        if let Some(api_key) = &keys.maps_api_key {
            caps.search = Arc::new(maps::PlacesSearch::new(api_key.clone()));
            info!("Using Google Places search");
        } else {
            info!("GOOGLE_MAPS_API_KEY not set, discovery returns mock leads");
        }

        if let Some(smtp) = &keys.smtp {
            info!(host = %smtp.host, "Using SMTP mailer");
            caps.email = Arc::new(smtp::SmtpMailer::new(smtp.clone()));
        } else {
            info!("SMTP_HOST not set, outbound e-mail is recorded in memory");
        }

        caps.telephony = Arc::new(CooldownTelephony::new(caps.telephony, DEFAULT_COOLDOWN));
        caps
    }
}
