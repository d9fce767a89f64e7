//! camwatch - playback supervision for live HLS camera walls
//!
//! This crate keeps a wall of live camera streams playing: it detects
//! frozen or stalled players, walks a graduated recovery ladder, and
//! listens to the camera server's realtime event channel.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod playback;
pub mod supervisor;
pub mod utils;

pub use error::{AppError, Result};
