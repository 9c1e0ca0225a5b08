//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::capabilities::retry::RetryPolicy;
use crate::error::ConfigError;

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Port for the dashboard WebSocket + control API.
    pub http_port: u16,
    /// libSQL database file. `None` keeps state in memory only.
    pub db_path: Option<PathBuf>,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub scheduling: SchedulingConfig,
    pub bus: BusConfig,
    pub router: RouterConfig,
    pub discovery: DiscoveryConfig,
    pub keys: AdapterKeys,
}

impl AppConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            http_port: env_parse("RAPIDREACH_PORT", 8000),
            db_path: std::env::var("RAPIDREACH_DB_PATH").ok().map(PathBuf::from),
            log_dir: std::env::var("RAPIDREACH_LOG_DIR").ok().map(PathBuf::from),
            pipeline: PipelineConfig::from_env(),
            scheduling: SchedulingConfig::from_env(),
            bus: BusConfig::from_env(),
            router: RouterConfig::from_env(),
            discovery: DiscoveryConfig::from_env(),
            keys: AdapterKeys::from_env(),
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduling;
        if s.business_hours_start >= s.business_hours_end || s.business_hours_end > 24 {
            return Err(ConfigError::InvalidValue {
                key: "BUSINESS_HOURS_START/BUSINESS_HOURS_END".into(),
                message: format!(
                    "{}..{} is not a valid range of hours",
                    s.business_hours_start, s.business_hours_end
                ),
            });
        }
        let open_minutes = i64::from(s.business_hours_end - s.business_hours_start) * 60;
        if s.meeting_duration_minutes <= 0 || s.meeting_duration_minutes > open_minutes {
            return Err(ConfigError::InvalidValue {
                key: "MEETING_DURATION_MINUTES".into(),
                message: format!("{} does not fit business hours", s.meeting_duration_minutes),
            });
        }
        if s.days_ahead <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "SCHEDULING_DAYS_AHEAD".into(),
                message: "must be positive".into(),
            });
        }
        if self.pipeline.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_RETRY_ATTEMPTS".into(),
                message: "at least one attempt is required".into(),
            });
        }
        if self.bus.backlog_capacity == 0 || self.bus.subscriber_queue == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EVENT_BACKLOG_CAPACITY/EVENT_SUBSCRIBER_QUEUE".into(),
                message: "must be positive".into(),
            });
        }
        if let Some(smtp) = &self.keys.smtp
            && smtp.from_address.is_empty()
        {
            return Err(ConfigError::MissingEnvVar("SMTP_FROM_ADDRESS".into()));
        }
        Ok(())
    }
}

/// Stage toggles and per-stage policy for the pipeline runner.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Run the FACT_CHECKING stage.
    pub fact_check: bool,
    /// Run the GENERATING_ARTIFACT stage.
    pub generate_artifact: bool,
    /// Park the run in AWAITING_REPLY after the e-mail instead of finishing.
    pub await_reply: bool,
    /// Upper bound for a single capability call.
    pub stage_timeout: Duration,
    /// Retry policy for transient adapter failures.
    pub retry: RetryPolicy,
    /// Delay between transcript polls after a call was placed.
    pub call_poll_interval: Duration,
    /// Maximum transcript polls before the call counts as failed.
    pub call_poll_attempts: u32,
    /// Recipient used when neither the lead nor the transcript yields an address.
    pub fallback_email: Option<String>,
    /// Signature used in outreach e-mails.
    pub sender_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fact_check: true,
            generate_artifact: true,
            await_reply: true,
            stage_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            call_poll_interval: Duration::from_secs(5),
            call_poll_attempts: 60, // 5 minutes at the default interval
            fallback_email: None,
            sender_name: "The RapidReach Team".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fact_check: env_flag("PIPELINE_FACT_CHECK", defaults.fact_check),
            generate_artifact: env_flag("PIPELINE_GENERATE_ARTIFACT", defaults.generate_artifact),
            await_reply: env_flag("PIPELINE_AWAIT_REPLY", defaults.await_reply),
            stage_timeout: Duration::from_secs(env_parse("PIPELINE_STAGE_TIMEOUT_SECS", 120)),
            retry: RetryPolicy {
                max_attempts: env_parse("PIPELINE_RETRY_ATTEMPTS", defaults.retry.max_attempts),
                ..defaults.retry
            },
            call_poll_interval: Duration::from_secs(env_parse("CALL_POLL_INTERVAL_SECS", 5)),
            call_poll_attempts: env_parse("CALL_POLL_ATTEMPTS", defaults.call_poll_attempts),
            fallback_email: std::env::var("FALLBACK_EMAIL").ok().filter(|s| !s.is_empty()),
            sender_name: std::env::var("SENDER_NAME").unwrap_or(defaults.sender_name),
        }
    }
}

/// Constraints applied when picking a meeting slot.
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    /// Minimum lead time between now and the meeting start.
    pub min_notice: Duration,
    /// First bookable hour (UTC, inclusive).
    pub business_hours_start: u32,
    /// Last bookable hour (UTC, exclusive); meetings must end by then.
    pub business_hours_end: u32,
    pub meeting_duration_minutes: i64,
    /// How far ahead availability is requested.
    pub days_ahead: i64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            min_notice: Duration::from_secs(2 * 3600),
            business_hours_start: 9,
            business_hours_end: 17,
            meeting_duration_minutes: 30,
            days_ahead: 14,
        }
    }
}

impl SchedulingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_notice: Duration::from_secs(env_parse("MEETING_MIN_NOTICE_MINUTES", 120u64) * 60),
            business_hours_start: env_parse("BUSINESS_HOURS_START", defaults.business_hours_start),
            business_hours_end: env_parse("BUSINESS_HOURS_END", defaults.business_hours_end),
            meeting_duration_minutes: env_parse(
                "MEETING_DURATION_MINUTES",
                defaults.meeting_duration_minutes,
            ),
            days_ahead: env_parse("SCHEDULING_DAYS_AHEAD", defaults.days_ahead),
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Events retained for replay to new observers.
    pub backlog_capacity: usize,
    /// Per-subscriber outbound queue bound before the oldest events are dropped.
    pub subscriber_queue: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: 256,
            subscriber_queue: 128,
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backlog_capacity: env_parse("EVENT_BACKLOG_CAPACITY", defaults.backlog_capacity),
            subscriber_queue: env_parse("EVENT_SUBSCRIBER_QUEUE", defaults.subscriber_queue),
        }
    }
}

/// Inbound notification router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on the recently-seen message set.
    pub dedup_capacity: usize,
    /// How long a handled message id is remembered.
    pub dedup_window: Duration,
    pub poll_interval_secs: u64,
    /// Our own sending address; messages from it are ignored.
    pub sales_address: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 1024,
            dedup_window: Duration::from_secs(3600),
            poll_interval_secs: 60,
            sales_address: None,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dedup_capacity: env_parse("INBOX_DEDUP_CAPACITY", defaults.dedup_capacity),
            dedup_window: Duration::from_secs(env_parse("INBOX_DEDUP_WINDOW_SECS", 3600)),
            poll_interval_secs: env_parse("INBOX_POLL_INTERVAL_SECS", defaults.poll_interval_secs),
            sales_address: std::env::var("SALES_EMAIL").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// Discovery ingestion settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub max_pages: usize,
    pub max_results: usize,
    pub exclude_chains: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_pages: 3,
            max_results: 20,
            exclude_chains: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_pages: env_parse("DISCOVERY_MAX_PAGES", defaults.max_pages),
            max_results: env_parse("DISCOVERY_MAX_RESULTS", defaults.max_results),
            exclude_chains: env_flag("DISCOVERY_EXCLUDE_CHAINS", defaults.exclude_chains),
        }
    }
}

/// Credentials for the live adapters. A missing key selects the fake adapter.
#[derive(Debug, Clone, Default)]
pub struct AdapterKeys {
    pub llm_base_url: String,
    pub llm_api_key: Option<SecretString>,
    pub llm_model: String,
    pub maps_api_key: Option<SecretString>,
    pub smtp: Option<SmtpConfig>,
}

impl AdapterKeys {
    pub fn from_env() -> Self {
        Self {
            llm_base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_api_key: env_secret("LLM_API_KEY"),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4.1".to_string()),
            maps_api_key: env_secret("GOOGLE_MAPS_API_KEY"),
            smtp: SmtpConfig::from_env(),
        }
    }
}

/// SMTP transport settings for outreach e-mail.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `SMTP_HOST` is not set (fake mailer is used).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;
        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        Some(Self {
            host,
            port: env_parse("SMTP_PORT", 587),
            password: SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default()),
            from_address: std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone()),
            username,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .map(SecretString::from)
}
