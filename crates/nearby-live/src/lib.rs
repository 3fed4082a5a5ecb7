//! Live engine: presence, ephemeral status, and notification delivery over
//! a realtime change feed.

pub mod backend;
pub mod error;
pub mod notifications;
pub mod presence;
pub mod realtime;
pub mod session;
pub mod status;
pub mod subscription;

pub use backend::{
    ChangeEvent, ChangeFeed, ChangeKind, Clock, Geolocator, MemoryBackend, MonotonicClock,
    NotificationStore, RestStore, RowEvent, RowFilter, RowStore, StaticGeolocator, SupabaseFeed,
    SystemClock, TopicSpec,
};
pub use error::{GeoError, LiveError};
pub use notifications::{
    FeedOrder, NewNotification, Notification, NotificationFeed, NotificationKind, RelatedUser,
};
pub use presence::{PresenceEvent, PresenceRecord, PresenceRegistry};
pub use realtime::{RealtimeClient, RealtimeConfig, RealtimeEvent};
pub use session::{LiveServices, LiveSession};
pub use status::{Coordinates, EphemeralStatus, EphemeralStatusStore, StatusEvent, StatusKind};
pub use subscription::{HandleId, SubscriptionHandle, SubscriptionManager};
