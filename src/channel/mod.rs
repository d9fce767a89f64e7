//! Realtime event channel
//!
//! WebSocket client for the camera server's event feed: camera status,
//! upstream stream health and heartbeat traffic.

pub mod client;
pub mod types;

pub use client::{reconnect_delay, ChannelClient, EventHandler, Subscription};
pub use types::{
    CameraStatus, ChannelEvent, ConnectionState, Inbound, StreamHealth, StreamHealthStatus,
};
