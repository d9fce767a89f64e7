//! Stream session
//!
//! A [`StreamSession`] supervises one decoder attachment. All mutable state
//! (attachment, counters, timers) lives in a single actor task; the handle
//! only sends commands. Every timer is a deadline polled by the actor's
//! `select!`, so tearing the session down cancels them by clearing them and
//! no deferred step can touch a decoder after `destroy()`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use super::liveness::{Anomaly, LivenessDetector};
use super::media::{
    DecoderFactory, HlsDecoder, MediaError, MediaErrorKind, MediaEvent, PlaybackSnapshot,
    ReadyState, VideoSink,
};
use super::recovery::{RecoveryPolicy, RecoveryStrategy};
use crate::config::PlaybackConfig;
use crate::error::{AppError, Result};
use crate::events::{ErrorReason, EventBus, SessionEvent, SessionEventKind, SessionSubscriber};
use crate::utils::{redact_url, LogThrottler};
use crate::warn_throttled;

enum SessionCommand {
    Load {
        url: String,
    },
    Destroy,
    ForceReload,
    /// `generation` is `None` for sink events, which always apply to the
    /// current attachment
    Media {
        generation: Option<u64>,
        event: MediaEvent,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    CurrentUrl {
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Channel a decoder uses to report activity back to its session
///
/// Stamped with the attachment generation; events from a decoder that has
/// since been replaced are discarded. Holds only a weak reference, so a
/// decoder never keeps its session alive.
#[derive(Clone, Debug)]
pub struct MediaEventSender {
    generation: u64,
    tx: mpsc::WeakUnboundedSender<SessionCommand>,
}

impl MediaEventSender {
    /// Returns `false` once the session is gone
    pub fn send(&self, event: MediaEvent) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx
                .send(SessionCommand::Media {
                    generation: Some(self.generation),
                    event,
                })
                .is_ok(),
            None => false,
        }
    }
}

/// Snapshot of a session's recovery state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub recovery_attempts: u32,
    /// Wall-clock time of the last liveness-bearing event
    pub last_update_time: Option<DateTime<Utc>>,
    pub is_recovering: bool,
    pub consecutive_anomalies: u32,
    pub attached: bool,
    /// Recovery attempts ran out; waiting for `force_reload`
    pub exhausted: bool,
}

/// Handle to a supervised playback session
pub struct StreamSession {
    id: String,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    events: Arc<EventBus>,
    task: JoinHandle<()>,
}

impl StreamSession {
    /// Create a session with its own event bus
    pub fn new(
        id: impl Into<String>,
        config: PlaybackConfig,
        factory: Arc<dyn DecoderFactory>,
        sink: Arc<dyn VideoSink>,
    ) -> Self {
        Self::with_event_bus(id, config, factory, sink, Arc::new(EventBus::new()))
    }

    /// Create a session publishing on a shared event bus
    pub fn with_event_bus(
        id: impl Into<String>,
        config: PlaybackConfig,
        factory: Arc<dyn DecoderFactory>,
        sink: Arc<dyn VideoSink>,
        events: Arc<EventBus>,
    ) -> Self {
        let id = id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(
            id.clone(),
            config,
            factory,
            sink,
            events.clone(),
            cmd_tx.downgrade(),
        );
        let task = tokio::spawn(actor.run(cmd_rx));

        Self {
            id,
            cmd_tx,
            events,
            task,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attach to `url`, replacing any current attachment
    ///
    /// Loading a different URL while attached behaves like
    /// [`force_reload`](Self::force_reload) against the new URL.
    pub fn load(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::InvalidUrl("empty manifest URL".to_string()));
        }
        self.send(SessionCommand::Load {
            url: url.to_string(),
        })
    }

    /// Cancel all timers and release the attachment. Idempotent.
    pub fn destroy(&self) -> Result<()> {
        self.send(SessionCommand::Destroy)
    }

    /// Reset the attempt counter and hard-reload unconditionally
    pub fn force_reload(&self) -> Result<()> {
        self.send(SessionCommand::ForceReload)
    }

    /// Feed a sink-originated event (e.g. `playing`) into the session
    pub fn report(&self, event: MediaEvent) -> Result<()> {
        self.send(SessionCommand::Media {
            generation: None,
            event,
        })
    }

    pub async fn current_url(&self) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::CurrentUrl { reply })?;
        rx.await.map_err(|_| AppError::SessionClosed)
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Stats { reply })?;
        rx.await.map_err(|_| AppError::SessionClosed)
    }

    /// Subscribe to this session's freeze / recover / error notifications
    pub fn subscribe(&self) -> SessionSubscriber {
        self.events.subscribe_session(self.id.clone())
    }

    /// Stop the actor, tearing down any attachment, and wait for it to exit
    pub async fn shutdown(self) {
        let StreamSession { cmd_tx, task, .. } = self;
        drop(cmd_tx);
        let _ = task.await;
    }

    fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| AppError::SessionClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingStep {
    Execute(RecoveryStrategy),
    /// Second half of a full reset
    Reattach,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timers {
    detection: Option<Instant>,
    freshness: Option<Instant>,
    recovery: Option<(Instant, PendingStep)>,
    settle: Option<Instant>,
}

/// Evidence collected toward confirming the last recovery action
#[derive(Debug, Clone, Copy)]
struct Confirmation {
    /// When the action completed
    since: Instant,
    /// Play position at the first clean, playable cycle after `since`
    baseline: Option<f64>,
}

enum Attachment {
    Decoder(Box<dyn HlsDecoder>),
    /// The sink plays the manifest itself
    Native,
}

struct SessionActor {
    id: String,
    config: PlaybackConfig,
    policy: RecoveryPolicy,
    factory: Arc<dyn DecoderFactory>,
    sink: Arc<dyn VideoSink>,
    events: Arc<EventBus>,
    tx: mpsc::WeakUnboundedSender<SessionCommand>,
    throttler: LogThrottler,

    source_url: Option<String>,
    attachment: Option<Attachment>,
    generation: u64,
    /// Start playback once the next attachment is ready
    autoplay: bool,
    confirmation: Option<Confirmation>,
    detector: LivenessDetector,
    recovery_attempts: u32,
    consecutive_anomalies: u32,
    is_recovering: bool,
    exhausted: bool,
    last_media_error: Option<Instant>,
    last_update: Option<DateTime<Utc>>,
    timers: Timers,
}

impl SessionActor {
    fn new(
        id: String,
        config: PlaybackConfig,
        factory: Arc<dyn DecoderFactory>,
        sink: Arc<dyn VideoSink>,
        events: Arc<EventBus>,
        tx: mpsc::WeakUnboundedSender<SessionCommand>,
    ) -> Self {
        let detector = LivenessDetector::new(&config, Instant::now());
        Self {
            id,
            policy: RecoveryPolicy::from_config(&config),
            config,
            factory,
            sink,
            events,
            tx,
            throttler: LogThrottler::with_secs(30),
            source_url: None,
            attachment: None,
            generation: 0,
            autoplay: false,
            confirmation: None,
            detector,
            recovery_attempts: 0,
            consecutive_anomalies: 0,
            is_recovering: false,
            exhausted: false,
            last_media_error: None,
            last_update: None,
            timers: Timers::default(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        loop {
            let timers = self.timers;
            tokio::select! {
                biased;
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = wait_until(timers.freshness) => self.on_freshness_timeout(),
                _ = wait_until(timers.recovery.map(|(at, _)| at)) => self.on_recovery_due(),
                _ = wait_until(timers.settle) => self.on_settled(),
                _ = wait_until(timers.detection) => self.on_detection_tick(),
            }
        }

        debug!("Session {} handle dropped, shutting down", self.id);
        self.teardown();
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Load { url } => self.load(url),
            SessionCommand::Destroy => {
                info!("Session {} destroyed", self.id);
                self.teardown();
            }
            SessionCommand::ForceReload => self.force_reload(),
            SessionCommand::Media { generation, event } => self.on_media_event(generation, event),
            SessionCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            SessionCommand::CurrentUrl { reply } => {
                let _ = reply.send(self.source_url.clone());
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn load(&mut self, url: String) {
        let source_changed = self.attachment.is_some()
            && self.source_url.as_deref().is_some_and(|current| current != url);
        if source_changed {
            info!(
                "Session {} source changed to {}, reloading",
                self.id,
                redact_url(&url)
            );
            self.source_url = Some(url);
            self.force_reload();
            return;
        }

        self.teardown();
        self.reset_recovery_state();
        self.source_url = Some(url.clone());

        let now = Instant::now();
        self.detector.reset(now);
        self.autoplay = true;
        if !self.attach(&url) {
            return;
        }

        info!("Session {} loading {}", self.id, redact_url(&url));
        self.timers.detection = Some(now + self.config.detection_interval());
        self.timers.freshness = Some(now + self.config.freshness_timeout());
    }

    fn force_reload(&mut self) {
        let Some(url) = self.source_url.clone() else {
            warn!("Session {} force reload requested without a source", self.id);
            return;
        };

        info!("Session {} force reload", self.id);
        self.reset_recovery_state();
        self.timers.recovery = None;
        self.timers.settle = None;

        self.is_recovering = true;
        if !self.hard_reload(&url) {
            return;
        }

        let now = Instant::now();
        if self.timers.detection.is_none() {
            self.timers.detection = Some(now + self.config.detection_interval());
        }
        self.timers.freshness = Some(now + self.config.freshness_timeout());
        self.finish_recovery(now);
    }

    /// Release the attachment and cancel every timer
    fn teardown(&mut self) {
        self.timers = Timers::default();
        self.detach();
        self.is_recovering = false;
        self.last_media_error = None;
    }

    fn reset_recovery_state(&mut self) {
        self.recovery_attempts = 0;
        self.consecutive_anomalies = 0;
        self.is_recovering = false;
        self.exhausted = false;
        self.last_media_error = None;
        self.confirmation = None;
    }

    fn detach(&mut self) {
        let Some(attachment) = self.attachment.take() else {
            return;
        };
        // Anything the old decoder still sends is now stale
        self.generation += 1;
        if let Attachment::Decoder(mut decoder) = attachment {
            decoder.destroy();
        }
        self.sink.clear_source();
    }

    /// Create a new attachment for `url`. On failure the session has
    /// already reported a terminal error.
    fn attach(&mut self, url: &str) -> bool {
        if self.factory.is_supported() {
            self.generation += 1;
            let events = MediaEventSender {
                generation: self.generation,
                tx: self.tx.clone(),
            };
            match self.factory.attach(url, self.sink.clone(), events) {
                Ok(decoder) => self.attachment = Some(Attachment::Decoder(decoder)),
                Err(e) => {
                    error!("Session {} failed to attach decoder: {}", self.id, e);
                    self.fail(ErrorReason::Fatal(e.to_string()));
                    return false;
                }
            }
        } else if self.sink.can_play_native() {
            self.generation += 1;
            self.sink.set_source(url);
            self.attachment = Some(Attachment::Native);
            self.autoplay_if_requested();
        } else {
            warn!(
                "Session {}: no segmented decoder and no native playback",
                self.id
            );
            self.fail(ErrorReason::NotSupported);
            return false;
        }

        self.detector.on_attach(Instant::now());
        true
    }

    /// One play attempt per attachment, and only if playback was wanted
    fn autoplay_if_requested(&mut self) {
        if !std::mem::take(&mut self.autoplay) {
            return;
        }
        if let Err(e) = self.sink.play() {
            debug!("Session {} autoplay rejected: {}", self.id, e);
        }
    }

    fn fail(&mut self, reason: ErrorReason) {
        let terminal = reason.is_terminal();
        self.emit(SessionEventKind::Error { reason });
        if terminal {
            self.teardown();
        }
    }

    fn emit(&self, kind: SessionEventKind) {
        self.events.publish(SessionEvent {
            session_id: self.id.clone(),
            kind,
        });
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            recovery_attempts: self.recovery_attempts,
            last_update_time: self.last_update,
            is_recovering: self.is_recovering,
            consecutive_anomalies: self.consecutive_anomalies,
            attached: self.attachment.is_some(),
            exhausted: self.exhausted,
        }
    }

    // ── Detection ────────────────────────────────────────────────────────────

    fn on_detection_tick(&mut self) {
        let now = Instant::now();
        self.timers.detection = Some(now + self.config.detection_interval());

        if self.attachment.is_none() {
            return;
        }

        let snapshot = self.sink.snapshot();
        match self.detector.evaluate(&snapshot, now) {
            Some(anomaly) => self.on_anomaly(anomaly),
            None => self.on_healthy_cycle(&snapshot),
        }
    }

    fn on_anomaly(&mut self, anomaly: Anomaly) {
        self.consecutive_anomalies += 1;

        if self.is_recovering {
            debug!(
                "Session {} anomaly during recovery ({:?}), waiting",
                self.id, anomaly
            );
            return;
        }

        if self.exhausted {
            warn_throttled!(
                self.throttler,
                "exhausted",
                "Session {} still degraded ({:?}), recovery exhausted",
                self.id,
                anomaly
            );
            return;
        }

        warn!(
            "Session {} {:?} detected: {:?} (consecutive: {})",
            self.id,
            anomaly.class(),
            anomaly,
            self.consecutive_anomalies
        );
        self.emit(SessionEventKind::Freeze { anomaly });
        self.attempt_recovery();
    }

    fn on_healthy_cycle(&mut self, snapshot: &PlaybackSnapshot) {
        self.consecutive_anomalies = 0;
        if self.is_recovering || (self.recovery_attempts == 0 && !self.exhausted) {
            return;
        }

        if self.progress_confirmed(snapshot) {
            info!(
                "Session {} recovered after {} attempt(s)",
                self.id, self.recovery_attempts
            );
            self.recovery_attempts = 0;
            self.exhausted = false;
            self.confirmation = None;
            self.throttler.clear("exhausted");
        }
    }

    /// A fresh attachment looks clean for a few cycles whether or not data
    /// flows. Recovery only counts once a liveness event has landed after
    /// the action completed and the play position has moved between two
    /// clean, playable cycles.
    fn progress_confirmed(&mut self, snapshot: &PlaybackSnapshot) -> bool {
        let last_liveness = self.detector.last_liveness();
        let min_advance = self.config.stuck_clock_min_advance;
        let Some(pending) = self.confirmation.as_mut() else {
            return false;
        };

        let playable = !snapshot.paused && snapshot.ready_state >= ReadyState::HaveFutureData;
        if !playable || last_liveness <= pending.since {
            pending.baseline = None;
            return false;
        }

        match pending.baseline {
            Some(baseline) => (snapshot.position - baseline).abs() > min_advance,
            None => {
                pending.baseline = Some(snapshot.position);
                false
            }
        }
    }

    fn on_freshness_timeout(&mut self) {
        self.timers.freshness = None;
        error!(
            "Session {} received no liveness event for {:?}, marking offline",
            self.id,
            self.config.freshness_timeout()
        );
        self.fail(ErrorReason::Timeout);
    }

    // ── Recovery ladder ──────────────────────────────────────────────────────

    fn attempt_recovery(&mut self) {
        if self.is_recovering {
            return;
        }

        if self.recovery_attempts >= self.policy.max_attempts {
            if !self.exhausted {
                self.exhausted = true;
                error!(
                    "Session {} recovery failed after {} attempts",
                    self.id, self.recovery_attempts
                );
                self.fail(ErrorReason::RecoveryExhausted);
            }
            return;
        }

        let Some(plan) = self.policy.plan(self.recovery_attempts + 1) else {
            return;
        };
        self.recovery_attempts += 1;
        self.is_recovering = true;

        info!(
            "Session {} scheduling {} (attempt {}/{}) in {:?}",
            self.id, plan.strategy, self.recovery_attempts, self.policy.max_attempts, plan.delay
        );
        self.timers.recovery = Some((
            Instant::now() + plan.delay,
            PendingStep::Execute(plan.strategy),
        ));
    }

    fn on_recovery_due(&mut self) {
        let Some((_, step)) = self.timers.recovery.take() else {
            return;
        };
        let Some(url) = self.source_url.clone() else {
            return;
        };
        let now = Instant::now();

        match step {
            PendingStep::Execute(strategy) => {
                if self.attachment.is_none() {
                    trace!("Session {} detached before {} ran", self.id, strategy);
                    return;
                }
                info!("Session {} running {}", self.id, strategy);
                match strategy {
                    RecoveryStrategy::SoftReload => {
                        self.soft_reload();
                        self.finish_recovery(now);
                    }
                    RecoveryStrategy::HardReload => {
                        if self.hard_reload(&url) {
                            self.finish_recovery(now);
                        }
                    }
                    RecoveryStrategy::FullReset => {
                        self.detach();
                        self.timers.recovery =
                            Some((now + self.config.full_reset_delay(), PendingStep::Reattach));
                    }
                }
            }
            PendingStep::Reattach => {
                self.autoplay = true;
                if self.attach(&url) {
                    info!("Session {} re-attached after full reset", self.id);
                    self.emit(SessionEventKind::Recover);
                    self.finish_recovery(now);
                }
            }
        }
    }

    fn soft_reload(&mut self) {
        match self.attachment.as_mut() {
            Some(Attachment::Decoder(decoder)) => {
                decoder.stop_load();
                decoder.start_load();
            }
            Some(Attachment::Native) => {
                let position = self.sink.snapshot().position;
                self.sink.reload();
                self.sink.seek(position);
            }
            None => {}
        }
    }

    /// Recreate the attachment, keeping the sink paused if it was
    fn hard_reload(&mut self, url: &str) -> bool {
        self.autoplay = !self.sink.snapshot().paused;
        self.detach();
        if !self.attach(url) {
            return false;
        }
        self.emit(SessionEventKind::Recover);
        true
    }

    fn finish_recovery(&mut self, now: Instant) {
        self.timers.settle = Some(now + self.config.recovery_settle());
        self.confirmation = Some(Confirmation {
            since: now,
            baseline: None,
        });
    }

    fn on_settled(&mut self) {
        self.timers.settle = None;
        self.is_recovering = false;
        debug!("Session {} recovery settled", self.id);
    }

    // ── Media events ─────────────────────────────────────────────────────────

    fn on_media_event(&mut self, generation: Option<u64>, event: MediaEvent) {
        if self.attachment.is_none() {
            trace!("Session {} ignoring {:?}: not attached", self.id, event);
            return;
        }
        if generation.is_some_and(|g| g != self.generation) {
            trace!("Session {} ignoring stale {:?}", self.id, event);
            return;
        }

        let now = Instant::now();
        if event.is_liveness() {
            self.detector.record_liveness(now);
            self.last_update = Some(Utc::now());
            self.timers.freshness = Some(now + self.config.freshness_timeout());
        }

        match event {
            MediaEvent::ManifestParsed => {
                debug!("Session {} manifest parsed", self.id);
                self.autoplay_if_requested();
            }
            MediaEvent::Playing => self.detector.mark_playing(),
            MediaEvent::Error(err) => self.on_media_error(err, now),
            _ => {}
        }
    }

    fn on_media_error(&mut self, err: MediaError, now: Instant) {
        if !err.fatal {
            debug!(
                "Session {} non-fatal {} error: {}",
                self.id, err.kind, err.details
            );
            return;
        }

        let native = matches!(self.attachment, Some(Attachment::Native));
        match err.kind {
            MediaErrorKind::Network => {
                warn!(
                    "Session {} fatal network error ({}), resuming load",
                    self.id, err.details
                );
                if native {
                    self.soft_reload();
                } else if let Some(Attachment::Decoder(decoder)) = self.attachment.as_mut() {
                    decoder.start_load();
                }
            }
            MediaErrorKind::Media => {
                let repeated = self
                    .last_media_error
                    .is_some_and(|at| now.saturating_duration_since(at) < self.config.media_error_grace());
                if repeated || native {
                    warn!(
                        "Session {} media error persists ({}), escalating",
                        self.id, err.details
                    );
                    self.last_media_error = None;
                    self.attempt_recovery();
                } else {
                    warn!(
                        "Session {} fatal media error ({}), recovering",
                        self.id, err.details
                    );
                    if let Some(Attachment::Decoder(decoder)) = self.attachment.as_mut() {
                        decoder.recover_media_error();
                    }
                    self.last_media_error = Some(now);
                }
            }
            MediaErrorKind::Other => {
                error!(
                    "Session {} unrecoverable decoder error: {}",
                    self.id, err.details
                );
                self.fail(ErrorReason::Fatal(err.details));
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
