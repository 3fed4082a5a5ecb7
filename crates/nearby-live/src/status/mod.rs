//! Ephemeral geolocated status ("open to hang") with automatic expiry.

mod store;
mod types;

pub use store::EphemeralStatusStore;
pub use types::{Coordinates, EphemeralStatus, StatusEvent, StatusKind};
