//! Decoder and video sink seams
//!
//! The session never talks to a concrete player. A [`DecoderFactory`]
//! creates segmented-stream decoders bound to a [`VideoSink`]; both report
//! activity as [`MediaEvent`]s.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::session::MediaEventSender;
use crate::error::Result;

/// Sink readiness, ordered from "nothing loaded" to "can play through"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    #[default]
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

impl ReadyState {
    /// Only metadata or the current frame is available (buffering)
    pub fn is_buffering(self) -> bool {
        matches!(self, ReadyState::HaveMetadata | ReadyState::HaveCurrentData)
    }
}

/// Point-in-time view of the sink sampled by each detection cycle
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackSnapshot {
    pub paused: bool,
    pub ended: bool,
    pub ready_state: ReadyState,
    /// Current play position in seconds
    pub position: f64,
    /// End of the buffered range containing the play position, if any
    pub buffered_end: Option<f64>,
}

/// Classification of a decoder error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaErrorKind {
    Network,
    Media,
    Other,
}

impl fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaErrorKind::Network => write!(f, "network"),
            MediaErrorKind::Media => write!(f, "media"),
            MediaErrorKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub fatal: bool,
    pub details: String,
}

impl MediaError {
    pub fn fatal(kind: MediaErrorKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            fatal: true,
            details: details.into(),
        }
    }
}

/// Events raised by a decoder or its sink
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    ManifestParsed,
    FragmentLoaded,
    BufferAppended,
    Playing,
    Progress,
    Error(MediaError),
}

impl MediaEvent {
    /// Events that prove data is still flowing
    pub fn is_liveness(&self) -> bool {
        matches!(
            self,
            MediaEvent::FragmentLoaded
                | MediaEvent::BufferAppended
                | MediaEvent::Playing
                | MediaEvent::Progress
        )
    }
}

/// Playback refused by the sink (e.g. autoplay policy)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRejected(pub String);

impl fmt::Display for PlayRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "play rejected: {}", self.0)
    }
}

impl std::error::Error for PlayRejected {}

/// Video output surface
///
/// Supplied by the host; a session attaches to it but never owns it.
pub trait VideoSink: Send + Sync {
    fn snapshot(&self) -> PlaybackSnapshot;

    /// Whether the sink can play the manifest format without a decoder
    fn can_play_native(&self) -> bool;

    fn set_source(&self, url: &str);

    fn clear_source(&self);

    fn play(&self) -> std::result::Result<(), PlayRejected>;

    /// Reload the current source in place
    fn reload(&self);

    fn seek(&self, position: f64);
}

/// One decoder instance attached to a sink
///
/// Owned exclusively by the session that created it.
pub trait HlsDecoder: Send {
    /// Resume segment fetching
    fn start_load(&mut self);

    /// Stop segment fetching
    fn stop_load(&mut self);

    /// Built-in recovery for media (decode/buffer) errors
    fn recover_media_error(&mut self);

    /// Detach from the sink and release resources
    fn destroy(&mut self);
}

/// Creates decoders
pub trait DecoderFactory: Send + Sync {
    /// Whether segmented-stream decoding is available in this environment
    fn is_supported(&self) -> bool;

    /// Create a decoder for `url`, attach it to `sink` and start loading.
    /// Activity must be reported through `events`.
    fn attach(
        &self,
        url: &str,
        sink: Arc<dyn VideoSink>,
        events: MediaEventSender,
    ) -> Result<Box<dyn HlsDecoder>>;
}
