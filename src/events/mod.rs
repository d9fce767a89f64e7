//! Session notifications
//!
//! Stream sessions publish freeze, recover and error notifications on an
//! [`EventBus`]. One bus is usually shared by every camera on a wall;
//! [`SessionSubscriber`] narrows it back down to a single session.
//!
//! A lagging broadcast receiver loses the oldest events. Errors decide
//! whether a camera is shown offline, so they are also copied to a queue
//! that never drops them (see [`EventBus::subscribe_errors`]).

pub mod types;

pub use types::{ErrorReason, SessionEvent, SessionEventKind};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{trace, warn};

/// Ring buffer size; a subscriber further behind than this lags
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for session events
///
/// # Example
///
/// ```no_run
/// use camwatch::events::{EventBus, SessionEvent, SessionEventKind};
///
/// # async fn demo() {
/// let bus = EventBus::new();
/// let mut cam1 = bus.subscribe_session("cam-1");
///
/// bus.publish(SessionEvent {
///     session_id: "cam-2".to_string(),
///     kind: SessionEventKind::Recover,
/// });
/// bus.publish(SessionEvent {
///     session_id: "cam-1".to_string(),
///     kind: SessionEventKind::Recover,
/// });
///
/// // Only the cam-1 event arrives
/// let event = cam1.recv().await.unwrap();
/// assert_eq!(event.session_id, "cam-1");
/// # }
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    errors: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            errors: Mutex::new(None),
        }
    }

    /// Fire-and-forget; dropped when nobody listens
    pub fn publish(&self, event: SessionEvent) {
        trace!("[{}] {:?}", event.session_id, event.kind);
        if event.is_error() {
            let mut errors = self.errors.lock();
            if let Some(tx) = errors.as_ref() {
                if tx.send(event.clone()).is_err() {
                    *errors = None;
                }
            }
        }
        let _ = self.tx.send(event);
    }

    /// Every `Error` event from now on, without loss
    ///
    /// Single consumer: a new call replaces the previous queue.
    pub fn subscribe_errors(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.errors.lock() = Some(tx);
        rx
    }

    /// Events from every session
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Events from one session only
    pub fn subscribe_session(&self, session_id: impl Into<String>) -> SessionSubscriber {
        SessionSubscriber {
            rx: self.tx.subscribe(),
            session_id: session_id.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver filtered to a single session
///
/// Lag is logged and skipped rather than surfaced.
pub struct SessionSubscriber {
    rx: broadcast::Receiver<SessionEvent>,
    session_id: String,
}

impl SessionSubscriber {
    /// Next event for this session; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.session_id == self.session_id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!("Subscriber for {} lagged by {} events", self.session_id, n)
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-queued event for this session, without waiting
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.session_id == self.session_id => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(n)) => {
                    warn!("Subscriber for {} lagged by {} events", self.session_id, n)
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, kind: SessionEventKind) -> SessionEvent {
        SessionEvent {
            session_id: id.to_string(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_session_filter() {
        let bus = EventBus::new();
        let mut all = bus.subscribe();
        let mut cam2 = bus.subscribe_session("cam-2");
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(event("cam-1", SessionEventKind::Recover));
        bus.publish(event(
            "cam-2",
            SessionEventKind::Error {
                reason: ErrorReason::Timeout,
            },
        ));

        assert_eq!(all.recv().await.unwrap().session_id, "cam-1");
        assert_eq!(all.recv().await.unwrap().session_id, "cam-2");

        let got = cam2.recv().await.unwrap();
        assert!(got.is_error());
        assert!(cam2.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lag_is_skipped() {
        let bus = EventBus::new();
        let mut cam1 = bus.subscribe_session("cam-1");

        for _ in 0..EVENT_CHANNEL_CAPACITY + 10 {
            bus.publish(event("cam-1", SessionEventKind::Recover));
        }

        let mut received = 0;
        while cam1.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, EVENT_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_errors_survive_lag() {
        let bus = EventBus::new();
        let mut all = bus.subscribe();
        let mut errors = bus.subscribe_errors();

        bus.publish(event(
            "cam-1",
            SessionEventKind::Error {
                reason: ErrorReason::RecoveryExhausted,
            },
        ));
        for _ in 0..EVENT_CHANNEL_CAPACITY {
            bus.publish(event("cam-2", SessionEventKind::Recover));
        }

        assert!(matches!(all.recv().await, Err(RecvError::Lagged(1))));
        let error = errors.try_recv().unwrap();
        assert_eq!(error.session_id, "cam-1");
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_bus() {
        let bus = EventBus::new();
        let mut cam1 = bus.subscribe_session("cam-1");
        drop(bus);
        assert!(cam1.recv().await.is_none());
    }
}
