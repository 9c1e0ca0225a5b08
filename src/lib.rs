//! RapidReach: outreach pipeline orchestration engine.

pub mod capabilities;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod inbound;
pub mod leads;
pub mod meetings;
pub mod pipeline;
pub mod store;
