//! Error types for RapidReach.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Inbound routing error: {0}")]
    Router(#[from] RouterError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Failure of a capability adapter call.
///
/// The variant decides the policy: `Timeout` and `Transient` are retried,
/// `Unavailable` falls back (or fails the run) without retrying, `Semantic`
/// maps straight to a fallback value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("{capability} timed out after {timeout:?}")]
    Timeout {
        capability: String,
        timeout: Duration,
    },

    #[error("{capability} transient failure: {reason}")]
    Transient { capability: String, reason: String },

    #[error("{capability} unavailable: {reason}")]
    Unavailable { capability: String, reason: String },

    #[error("{capability} returned an invalid result: {reason}")]
    Semantic { capability: String, reason: String },
}

impl AdapterError {
    pub fn transient(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            capability: capability.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            capability: capability.into(),
            reason: reason.into(),
        }
    }

    pub fn semantic(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Semantic {
            capability: capability.into(),
            reason: reason.into(),
        }
    }

    /// Whether the retry policy should try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient { .. })
    }

    /// Stable label carried in failure events.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Transient { .. } => "transient",
            Self::Unavailable { .. } => "unavailable",
            Self::Semantic { .. } => "semantic",
        }
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Lead {lead_id} already has an active run {run_id}")]
    AlreadyRunning { lead_id: String, run_id: Uuid },

    #[error("Lead {0} not found")]
    LeadNotFound(String),

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Lead {0} has no run awaiting a reply")]
    NotAwaitingReply(String),

    #[error("Lead {0} has no active run")]
    NoActiveRun(String),
}

/// Discovery ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Discovery for {area} is already running")]
    AlreadyRunning { area: String },

    #[error("Lead search failed: {0}")]
    Search(#[from] AdapterError),
}

/// Inbound notification routing errors.
///
/// Every variant except `ScanInProgress` leaves the message unread so that a
/// later poll picks it up again.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("An inbox scan is already in progress")]
    ScanInProgress,

    #[error("Failed to list unread messages: {0}")]
    List(AdapterError),

    #[error("Failed to read message {message_id}: {source}")]
    Read {
        message_id: String,
        #[source]
        source: AdapterError,
    },

    #[error("Failed to classify message {message_id}: {source}")]
    Classify {
        message_id: String,
        #[source]
        source: AdapterError,
    },

    #[error("Calendar failure for message {message_id}: {source}")]
    Calendar {
        message_id: String,
        #[source]
        source: AdapterError,
    },

    #[error("No free slot satisfies the scheduling constraints for message {message_id}")]
    NoSlot { message_id: String },
}

impl RouterError {
    /// Stable label carried in failure events.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::ScanInProgress => "scan_in_progress",
            Self::List(e) => e.error_class(),
            Self::Read { source, .. }
            | Self::Classify { source, .. }
            | Self::Calendar { source, .. } => source.error_class(),
            Self::NoSlot { .. } => "no_slot",
        }
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
