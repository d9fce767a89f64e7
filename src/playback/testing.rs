//! Recording doubles for decoder and sink

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::media::{
    DecoderFactory, HlsDecoder, PlayRejected, PlaybackSnapshot, ReadyState, VideoSink,
};
use super::session::MediaEventSender;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Attach(String),
    StartLoad,
    StopLoad,
    RecoverMediaError,
    Destroy,
    SetSource(String),
    ClearSource,
    Play,
    Reload,
    Seek(f64),
}

/// Shared log of everything the session did to its decoders and sink
#[derive(Default)]
pub struct Recorder {
    actions: Mutex<Vec<Action>>,
    senders: Mutex<Vec<MediaEventSender>>,
    live: AtomicUsize,
}

impl Recorder {
    fn record(&self, action: Action) {
        self.actions.lock().push(action);
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().clone()
    }

    pub fn count(&self, action: &Action) -> usize {
        self.actions.lock().iter().filter(|a| *a == action).count()
    }

    pub fn attached_urls(&self) -> Vec<String> {
        self.actions
            .lock()
            .iter()
            .filter_map(|a| match a {
                Action::Attach(url) => Some(url.clone()),
                _ => None,
            })
            .collect()
    }

    /// Decoders attached and not yet destroyed
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn last_sender(&self) -> Option<MediaEventSender> {
        self.senders.lock().last().cloned()
    }
}

pub struct MockFactory {
    recorder: Arc<Recorder>,
    supported: bool,
    pub fail_attach: bool,
}

impl MockFactory {
    pub fn new(recorder: Arc<Recorder>, supported: bool) -> Self {
        Self {
            recorder,
            supported,
            fail_attach: false,
        }
    }
}

impl DecoderFactory for MockFactory {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn attach(
        &self,
        url: &str,
        _sink: Arc<dyn VideoSink>,
        events: MediaEventSender,
    ) -> Result<Box<dyn HlsDecoder>> {
        if self.fail_attach {
            return Err(AppError::Decoder("attach refused".to_string()));
        }
        self.recorder.record(Action::Attach(url.to_string()));
        self.recorder.senders.lock().push(events);
        self.recorder.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDecoder {
            recorder: self.recorder.clone(),
            destroyed: false,
        }))
    }
}

struct MockDecoder {
    recorder: Arc<Recorder>,
    destroyed: bool,
}

impl HlsDecoder for MockDecoder {
    fn start_load(&mut self) {
        self.recorder.record(Action::StartLoad);
    }

    fn stop_load(&mut self) {
        self.recorder.record(Action::StopLoad);
    }

    fn recover_media_error(&mut self) {
        self.recorder.record(Action::RecoverMediaError);
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            self.recorder.live.fetch_sub(1, Ordering::SeqCst);
            self.recorder.record(Action::Destroy);
        }
    }
}

/// Sink whose playback state is set directly by the test
pub struct MockSink {
    recorder: Arc<Recorder>,
    native: bool,
    state: Mutex<PlaybackSnapshot>,
}

impl MockSink {
    pub fn new(recorder: Arc<Recorder>, native: bool) -> Self {
        Self {
            recorder,
            native,
            state: Mutex::new(PlaybackSnapshot::default()),
        }
    }

    pub fn set(&self, snapshot: PlaybackSnapshot) {
        *self.state.lock() = snapshot;
    }
}

impl VideoSink for MockSink {
    fn snapshot(&self) -> PlaybackSnapshot {
        *self.state.lock()
    }

    fn can_play_native(&self) -> bool {
        self.native
    }

    fn set_source(&self, url: &str) {
        self.recorder.record(Action::SetSource(url.to_string()));
    }

    fn clear_source(&self) {
        self.recorder.record(Action::ClearSource);
    }

    fn play(&self) -> std::result::Result<(), PlayRejected> {
        self.recorder.record(Action::Play);
        Ok(())
    }

    fn reload(&self) {
        self.recorder.record(Action::Reload);
    }

    fn seek(&self, position: f64) {
        self.recorder.record(Action::Seek(position));
    }
}

/// Playing at `position` with ten seconds buffered ahead
pub fn playing_at(position: f64) -> PlaybackSnapshot {
    PlaybackSnapshot {
        paused: false,
        ended: false,
        ready_state: ReadyState::HaveEnoughData,
        position,
        buffered_end: Some(position + 10.0),
    }
}
