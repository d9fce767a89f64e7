//! Camera supervisor
//!
//! Hosts one [`StreamSession`] per camera on a shared event bus, reacts to
//! server-side stream health from the realtime channel and forwards session
//! errors to the operational backend.

pub mod backend;

pub use backend::HttpBackend;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, StreamHealthStatus};
use crate::config::PlaybackConfig;
use crate::error::{AppError, Result};
use crate::events::{ErrorReason, EventBus, SessionEvent, SessionEventKind};
use crate::playback::{
    DecoderFactory, HlsDecoder, MediaEventSender, SessionStats, StreamSession, VideoSink,
};
use crate::utils::redact_url;

/// Error classes understood by the reporting backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    Timeout,
    HlsError,
    NetworkError,
    DecodeError,
    Other,
}

impl StreamErrorKind {
    pub fn classify(reason: &ErrorReason) -> Self {
        match reason {
            ErrorReason::Timeout => StreamErrorKind::Timeout,
            ErrorReason::RecoveryExhausted => StreamErrorKind::HlsError,
            ErrorReason::NotSupported => StreamErrorKind::Other,
            ErrorReason::Fatal(detail) => {
                let detail = detail.to_ascii_lowercase();
                if detail.contains("network") || detail.contains("load") {
                    StreamErrorKind::NetworkError
                } else if ["decode", "media", "codec", "buffer"]
                    .iter()
                    .any(|k| detail.contains(k))
                {
                    StreamErrorKind::DecodeError
                } else {
                    StreamErrorKind::HlsError
                }
            }
        }
    }
}

/// Payload sent to the error reporting endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamErrorReport {
    pub camera_id: String,
    pub error_type: StreamErrorKind,
    pub message: String,
    /// Source URL without its query string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Starts a camera's upstream stream on the server
#[async_trait]
pub trait StreamControl: Send + Sync {
    async fn start_stream(&self, camera_id: &str) -> Result<()>;
}

/// Receives classified stream errors for observability
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report_error(&self, report: &StreamErrorReport) -> Result<()>;
}

/// Per-camera view exposed to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraView {
    pub camera_id: String,
    pub url: String,
    /// Last status pushed by the server, verbatim
    pub server_status: Option<String>,
    pub offline: bool,
    pub last_error: Option<ErrorReason>,
    pub stats: SessionStats,
}

struct Camera {
    session: StreamSession,
    url: String,
    server_status: Option<String>,
    offline: bool,
    last_error: Option<ErrorReason>,
}

/// Used when the host has no segmented decoder: sessions fall back to
/// native sink playback or report `not supported`.
struct NoDecoder;

impl DecoderFactory for NoDecoder {
    fn is_supported(&self) -> bool {
        false
    }

    fn attach(
        &self,
        _url: &str,
        _sink: Arc<dyn VideoSink>,
        _events: MediaEventSender,
    ) -> Result<Box<dyn HlsDecoder>> {
        Err(AppError::NotSupported(
            "no segmented decoder available".to_string(),
        ))
    }
}

pub struct CameraSupervisor {
    playback: PlaybackConfig,
    factory: Arc<dyn DecoderFactory>,
    events: Arc<EventBus>,
    /// Taken by `run_reporting`; queues errors raised before it starts
    errors: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    control: Option<Arc<dyn StreamControl>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    cameras: RwLock<HashMap<String, Camera>>,
}

impl CameraSupervisor {
    pub fn new(playback: PlaybackConfig) -> Self {
        let events = Arc::new(EventBus::new());
        let errors = events.subscribe_errors();
        Self {
            playback,
            factory: Arc::new(NoDecoder),
            events,
            errors: Mutex::new(Some(errors)),
            control: None,
            reporter: None,
            cameras: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_decoder_factory(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_stream_control(mut self, control: Arc<dyn StreamControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start supervising `camera_id`, or point its session at a new URL
    pub async fn open(&self, camera_id: &str, url: &str, sink: Arc<dyn VideoSink>) -> Result<()> {
        let mut cameras = self.cameras.write().await;

        if let Some(camera) = cameras.get_mut(camera_id) {
            camera.session.load(url)?;
            camera.url = url.to_string();
            camera.offline = false;
            camera.last_error = None;
            return Ok(());
        }

        let session = StreamSession::with_event_bus(
            camera_id,
            self.playback.clone(),
            self.factory.clone(),
            sink,
            self.events.clone(),
        );
        session.load(url)?;
        info!("Camera {} opened ({})", camera_id, redact_url(url));

        cameras.insert(
            camera_id.to_string(),
            Camera {
                session,
                url: url.to_string(),
                server_status: None,
                offline: false,
                last_error: None,
            },
        );
        Ok(())
    }

    /// Stop supervising `camera_id` and release its decoder
    pub async fn close(&self, camera_id: &str) -> Result<()> {
        let camera = self
            .cameras
            .write()
            .await
            .remove(camera_id)
            .ok_or_else(|| AppError::NotFound(format!("camera {}", camera_id)))?;

        camera.session.shutdown().await;
        info!("Camera {} closed", camera_id);
        Ok(())
    }

    /// Manual retry: clears the offline state and force-reloads
    pub async fn retry(&self, camera_id: &str) -> Result<()> {
        let mut cameras = self.cameras.write().await;
        let camera = cameras
            .get_mut(camera_id)
            .ok_or_else(|| AppError::NotFound(format!("camera {}", camera_id)))?;

        camera.offline = false;
        camera.last_error = None;
        camera.session.force_reload()
    }

    pub async fn status(&self, camera_id: &str) -> Result<CameraView> {
        let cameras = self.cameras.read().await;
        let camera = cameras
            .get(camera_id)
            .ok_or_else(|| AppError::NotFound(format!("camera {}", camera_id)))?;

        Ok(CameraView {
            camera_id: camera_id.to_string(),
            url: camera.url.clone(),
            server_status: camera.server_status.clone(),
            offline: camera.offline,
            last_error: camera.last_error.clone(),
            stats: camera.session.stats().await?,
        })
    }

    pub async fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// React to an event from the realtime channel
    pub async fn handle_channel_event(&self, event: &ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::StreamHealth(health) => match health.status {
                StreamHealthStatus::Restarted | StreamHealthStatus::Online => {
                    let cameras = self.cameras.read().await;
                    if let Some(camera) = cameras.get(&health.id) {
                        info!(
                            "Camera {} upstream {:?}, reloading player",
                            health.id, health.status
                        );
                        camera.session.force_reload()?;
                    }
                }
                StreamHealthStatus::Frozen => {
                    warn!("Camera {} upstream frozen: {}", health.id, health.message);
                    match &self.control {
                        Some(control) => control.start_stream(&health.id).await?,
                        None => debug!("No stream control configured, not restarting {}", health.id),
                    }
                }
                StreamHealthStatus::Offline | StreamHealthStatus::RestartFailed => {
                    warn!(
                        "Camera {} upstream {:?}: {}",
                        health.id, health.status, health.message
                    );
                    if let Some(camera) = self.cameras.write().await.get_mut(&health.id) {
                        camera.offline = true;
                    }
                }
            },
            ChannelEvent::CameraStatus(status) => {
                debug!("Camera {} status {}", status.id, status.status);
                if let Some(camera) = self.cameras.write().await.get_mut(&status.id) {
                    camera.offline = status.status.eq_ignore_ascii_case("offline");
                    camera.server_status = Some(status.status.clone());
                }
            }
            ChannelEvent::Error { message } => warn!("Channel reported error: {}", message),
            ChannelEvent::Connected(_) | ChannelEvent::Pong => {}
        }
        Ok(())
    }

    /// Consume session events until shutdown: track offline state and
    /// report errors to the backend
    ///
    /// Errors come from the bus's lossless queue; everything else from the
    /// broadcast, which may lag.
    pub async fn run_reporting(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let taken = self.errors.lock().take();
        let Some(mut errors) = taken else {
            warn!("Supervisor reporting is already running");
            return;
        };
        let mut events = self.events.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                Some(event) = errors.recv() => self.on_session_event(event).await,
                event = events.recv() => match event {
                    Ok(event) if event.is_error() => {}
                    Ok(event) => self.on_session_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Supervisor lagged by {} session events, resyncing", n);
                        self.resync_offline().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Supervisor reporting stopped");
    }

    /// Lagging may have swallowed `Recover` events: clear the offline mark
    /// of cameras whose session has come back since its last error
    async fn resync_offline(&self) {
        let mut cameras = self.cameras.write().await;
        for (camera_id, camera) in cameras.iter_mut() {
            if !camera.offline || camera.last_error.is_none() {
                continue;
            }
            if let Ok(stats) = camera.session.stats().await {
                if stats.attached && !stats.exhausted {
                    debug!("Camera {} recovered while events were lagging", camera_id);
                    camera.offline = false;
                }
            }
        }
    }

    async fn on_session_event(&self, event: SessionEvent) {
        let camera_id = event.session_id;
        match event.kind {
            SessionEventKind::Freeze { anomaly } => {
                debug!("Camera {} froze: {:?}", camera_id, anomaly);
            }
            SessionEventKind::Recover => {
                if let Some(camera) = self.cameras.write().await.get_mut(&camera_id) {
                    camera.offline = false;
                }
            }
            SessionEventKind::Error { reason } => {
                let url = {
                    let mut cameras = self.cameras.write().await;
                    cameras.get_mut(&camera_id).map(|camera| {
                        camera.offline = true;
                        camera.last_error = Some(reason.clone());
                        redact_url(&camera.url).to_string()
                    })
                };
                warn!("Camera {} error: {}", camera_id, reason);

                let Some(reporter) = &self.reporter else {
                    return;
                };
                let report = StreamErrorReport {
                    camera_id: camera_id.clone(),
                    error_type: StreamErrorKind::classify(&reason),
                    message: reason.to_string(),
                    url,
                    occurred_at: Utc::now(),
                };
                if let Err(e) = reporter.report_error(&report).await {
                    warn!("Failed to report error for camera {}: {}", camera_id, e);
                }
            }
        }
    }
}
