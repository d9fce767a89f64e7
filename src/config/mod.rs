//! Configuration schema and persistence

mod schema;
mod store;

pub use schema::{
    AppConfig, BackendConfig, ChannelConfig, PlaybackConfig, MAX_RECOVERY_ATTEMPTS,
    MIN_DETECTION_INTERVAL_MS,
};
pub use store::{ConfigChange, ConfigSection, ConfigStore};
