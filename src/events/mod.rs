//! Event bus and event model.

pub mod bus;
pub mod model;

pub use bus::{EventBus, Subscription};
pub use model::{Delivery, Event, EventKind, EventPayload, FailureNotice, ReplyNotice, WsMessage};
