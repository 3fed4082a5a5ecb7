//! Configuration schema types for nearby.
//!
//! All structs use `serde(default)` so partial configs work correctly.
//! Missing fields are filled with the defaults the live engine expects.

mod backend;
mod notifications;
mod presence;
mod realtime;
mod status;
mod system;

pub use backend::*;
pub use notifications::*;
pub use presence::*;
pub use realtime::*;
pub use status::*;
pub use system::*;

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration.
///
/// Only override what you want to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct NearbyConfig {
    pub backend: BackendConfig,
    pub realtime: RealtimeConfig,
    pub presence: PresenceConfig,
    pub status: StatusConfig,
    pub notifications: NotificationsConfig,
    pub logging: LoggingConfig,
}
