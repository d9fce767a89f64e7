//! HLS playback supervision
//!
//! A [`StreamSession`] owns one decoder attachment, watches it with the
//! [`LivenessDetector`] and walks the [`RecoveryPolicy`] ladder when the
//! picture freezes. Decoders and sinks are supplied by the host through the
//! traits in [`media`].

pub mod liveness;
pub mod media;
pub mod recovery;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use liveness::{Anomaly, AnomalyClass, LivenessDetector};
pub use media::{
    DecoderFactory, HlsDecoder, MediaError, MediaErrorKind, MediaEvent, PlayRejected,
    PlaybackSnapshot, ReadyState, VideoSink,
};
pub use recovery::{RecoveryPlan, RecoveryPolicy, RecoveryStrategy};
pub use session::{MediaEventSender, SessionStats, StreamSession};
