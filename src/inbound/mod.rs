//! Inbound replies: push and poll channels, dedup, intent routing and
//! meeting booking.

pub mod poller;
pub mod router;
pub mod scheduling;

pub use poller::spawn_inbox_poller;
pub use router::{InboundRouter, RouteOutcome, ScanReport};
