//! Observer-facing HTTP surface: WebSocket event stream, REST reads,
//! control triggers and the inbox webhook.

pub mod ws;

pub use ws::{AppState, dashboard_routes};
