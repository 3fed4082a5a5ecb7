pub mod errors;
pub mod id;

pub use errors::{ConfigError, NearbyError};
pub use id::{new_id, SessionId};

pub type Result<T> = std::result::Result<T, NearbyError>;
