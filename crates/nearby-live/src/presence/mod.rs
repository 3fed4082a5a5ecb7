//! Presence registry: who is online right now.
//!
//! Membership is driven entirely by the transport's presence events. A user
//! is online while they hold an active announcement; there is no local
//! timeout demotion. The local session keeps its own announcement alive
//! with a heartbeat.

mod event_translator;
mod heartbeat;
mod registry;
mod types;

pub use registry::PresenceRegistry;
pub use types::{PresenceEvent, PresenceRecord};
