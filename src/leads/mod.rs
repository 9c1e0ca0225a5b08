//! Leads: data model, merge engine, registry and discovery ingestion.

pub mod discovery;
pub mod merge;
pub mod model;
pub mod registry;

pub use discovery::{DiscoveryReport, DiscoveryService};
pub use merge::merge;
pub use model::{Lead, LeadFilter, LeadStatus};
pub use registry::LeadRegistry;
