//! Realtime channel client
//!
//! Keeps one WebSocket open to the event server, sends a heartbeat while
//! open, reconnects with multiplicative backoff and fans recognized events
//! out to subscribers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{encode, ChannelEvent, ConnectionState, Inbound};
use crate::config::ChannelConfig;
use crate::error::{AppError, Result};
use crate::utils::{redact_url, LogThrottler};
use crate::warn_throttled;

/// Subscriber callback. Errors are logged; they never stop delivery.
pub type EventHandler = Arc<dyn Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync>;

type StateCallback = Arc<dyn Fn(bool) + Send + Sync>;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    handlers: Vec<(u64, EventHandler)>,
}

struct Shared {
    state: RwLock<ConnectionState>,
    subscribers: Mutex<Subscribers>,
    on_state: Mutex<Option<StateCallback>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    reconnect_attempts: AtomicU32,
    throttler: LogThrottler,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn notify_state(&self, connected: bool) {
        let callback = self.on_state.lock().clone();
        if let Some(callback) = callback {
            callback(connected);
        }
    }

    fn handle_text(&self, text: &str) {
        match ChannelEvent::parse(text) {
            Ok(Inbound::Event(event)) => self.dispatch(&event),
            Ok(Inbound::Unknown(kind)) => debug!("Ignoring channel message of type '{}'", kind),
            Err(e) => warn!("Dropping malformed channel message: {}", e),
        }
    }

    /// Deliver to every current subscriber in subscription order
    fn dispatch(&self, event: &ChannelEvent) {
        let handlers: Vec<EventHandler> = self
            .subscribers
            .lock()
            .handlers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Channel handler failed on '{}': {:#}", event.event_type(), e),
                Err(_) => error!("Channel handler panicked on '{}'", event.event_type()),
            }
        }
    }
}

/// Handle returned by [`ChannelClient::on`]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Remove exactly this handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut subscribers = shared.subscribers.lock();
        let before = subscribers.handlers.len();
        subscribers.handlers.retain(|(id, _)| *id != self.id);
        subscribers.handlers.len() != before
    }
}

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(base * factor^(attempt-1), max)`
pub fn reconnect_delay(attempt: u32, config: &ChannelConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay = config.reconnect_base_delay_ms as f64 * config.reconnect_factor.powi(exponent);
    let capped = delay.min(config.reconnect_max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Realtime event channel client
pub struct ChannelClient {
    config: ChannelConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelClient {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Closed),
                subscribers: Mutex::new(Subscribers::default()),
                on_state: Mutex::new(None),
                outbound: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                throttler: LogThrottler::with_secs(60),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the connection loop
    ///
    /// `on_state_change` is called with `true` on every open and `false` on
    /// every close. Fails once the client has been disconnected.
    pub fn connect<F>(&self, on_state_change: F) -> Result<()>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(AppError::Channel("client has been disconnected".to_string()));
        }

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!("Channel client already connecting");
            return Ok(());
        }

        *self.shared.on_state.lock() = Some(Arc::new(on_state_change));
        self.shared.reconnect_attempts.store(0, Ordering::SeqCst);

        let url = connection_url(&self.config);
        *task = Some(tokio::spawn(run(
            self.shared.clone(),
            self.config.clone(),
            url,
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Close the socket for good
    ///
    /// Cancels the heartbeat and any pending reconnect, drops all
    /// subscribers and reports `false` to the state callback.
    pub async fn disconnect(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.shared.subscribers.lock().handlers.clear();
        *self.shared.outbound.lock() = None;
        self.shared.set_state(ConnectionState::Closed);
        self.shared.notify_state(false);
        *self.shared.on_state.lock() = None;
        info!("Channel disconnected");
    }

    /// Register a subscriber
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut subscribers = self.shared.subscribers.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.handlers.push((id, Arc::new(handler)));

        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Send a `{type, data}` message. Dropped with a warning unless open.
    pub fn send(&self, kind: &str, data: Value) {
        if self.state() != ConnectionState::Open {
            warn!("Channel not open, dropping '{}' message", kind);
            return;
        }

        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(tx) if tx.send(encode(kind, data)).is_ok() => {}
            _ => warn!("Channel closing, dropping '{}' message", kind),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Reconnect attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Whether the connection loop has stopped (disconnected or gave up)
    pub fn is_finished(&self) -> bool {
        self.task.lock().as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().handlers.len()
    }

    #[cfg(test)]
    fn dispatch(&self, event: &ChannelEvent) {
        self.shared.dispatch(event);
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Endpoint with the auth token appended as a query parameter
fn connection_url(config: &ChannelConfig) -> String {
    match config.auth_token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => {
            let separator = if config.endpoint.contains('?') { '&' } else { '?' };
            format!(
                "{}{}token={}",
                config.endpoint,
                separator,
                urlencoding::encode(token)
            )
        }
        None => config.endpoint.clone(),
    }
}

async fn run(shared: Arc<Shared>, config: ChannelConfig, url: String, cancel: CancellationToken) {
    let endpoint = redact_url(&url).to_string();

    loop {
        shared.set_state(ConnectionState::Connecting);
        debug!("Channel connecting to {}", endpoint);

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((socket, _)) => {
                info!("Channel connected to {}", endpoint);
                shared.reconnect_attempts.store(0, Ordering::SeqCst);
                shared.throttler.clear("connect");
                shared.set_state(ConnectionState::Open);
                shared.notify_state(true);

                let reason = pump(&shared, &config, socket, &cancel).await;

                *shared.outbound.lock() = None;
                shared.set_state(ConnectionState::Closed);
                if cancel.is_cancelled() {
                    break;
                }
                info!("Channel to {} closed: {}", endpoint, reason);
                shared.notify_state(false);
            }
            Err(e) => {
                shared.set_state(ConnectionState::Closed);
                warn_throttled!(
                    shared.throttler,
                    "connect",
                    "Channel connect to {} failed: {}",
                    endpoint,
                    e
                );
                shared.notify_state(false);
            }
        }

        let attempt = shared.reconnect_attempts.load(Ordering::SeqCst) + 1;
        if attempt > config.max_reconnect_attempts {
            error!(
                "Channel giving up on {} after {} reconnect attempts",
                endpoint, config.max_reconnect_attempts
            );
            break;
        }
        shared.reconnect_attempts.store(attempt, Ordering::SeqCst);

        let delay = reconnect_delay(attempt, &config);
        info!(
            "Channel reconnecting in {:?} (attempt {}/{})",
            delay, attempt, config.max_reconnect_attempts
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(ConnectionState::Closed);
}

/// Drive one open socket until it closes; returns why
async fn pump(
    shared: &Shared,
    config: &ChannelConfig,
    socket: Socket,
    cancel: &CancellationToken,
) -> String {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    *shared.outbound.lock() = Some(tx);

    let period = config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ping = encode("ping", json!({}));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return "disconnected".to_string();
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(Message::Text(ping.clone())).await {
                    return format!("heartbeat failed: {}", e);
                }
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    return format!("send failed: {}", e);
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => format!("closed by server ({}): {}", frame.code, frame.reason),
                        None => "closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("socket error: {}", e),
                None => return "stream ended".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::types::CameraStatus;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    struct TestServer {
        endpoint: String,
        uri: oneshot::Receiver<String>,
        received: mpsc::UnboundedReceiver<String>,
    }

    /// Accepts one client, sends `script`, then records what the client sends
    async fn spawn_server(script: Vec<String>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, uri) = oneshot::channel();
        let (frame_tx, received) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                let _ = uri_tx.send(req.uri().to_string());
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();

            for text in script {
                ws.send(Message::Text(text)).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = frame_tx.send(text);
                }
            }
        });

        TestServer {
            endpoint: format!("ws://{}/ws", addr),
            uri,
            received,
        }
    }

    fn config(endpoint: &str) -> ChannelConfig {
        ChannelConfig {
            endpoint: endpoint.to_string(),
            auth_token: Some("s3cret/+".to_string()),
            ..ChannelConfig::default()
        }
    }

    fn state_watch(client: &ChannelClient) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        client
            .connect(move |connected| {
                let _ = tx.send(connected);
            })
            .unwrap();
        rx
    }

    #[test]
    fn test_reconnect_delay_growth() {
        let config = ChannelConfig::default();
        let delays: Vec<Duration> = (1..=10).map(|k| reconnect_delay(k, &config)).collect();

        assert_eq!(delays[0], Duration::from_millis(1_000));
        assert_eq!(delays[1], Duration::from_millis(1_500));
        assert_eq!(delays[2], Duration::from_millis(2_250));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[9], Duration::from_secs(30));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
    }

    #[test]
    fn test_token_in_query() {
        let mut config = config("wss://nvr.local/ws");
        assert_eq!(connection_url(&config), "wss://nvr.local/ws?token=s3cret%2F%2B");

        config.endpoint = "wss://nvr.local/ws?v=2".to_string();
        assert_eq!(
            connection_url(&config),
            "wss://nvr.local/ws?v=2&token=s3cret%2F%2B"
        );

        config.auth_token = None;
        assert_eq!(connection_url(&config), "wss://nvr.local/ws?v=2");
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let client = ChannelClient::new(ChannelConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        client.on(move |_| {
            o.lock().push("first");
            anyhow::bail!("handler exploded")
        });
        client.on(|_| panic!("handler panicked"));
        let o = order.clone();
        client.on(move |_| {
            o.lock().push("third");
            Ok(())
        });

        client.dispatch(&ChannelEvent::Pong);
        client.dispatch(&ChannelEvent::Pong);

        assert_eq!(*order.lock(), vec!["first", "third", "first", "third"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_handler() {
        let client = ChannelClient::new(ChannelConfig::default());
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        let first = client.on(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let h = hits.clone();
        let _second = client.on(move |_| {
            h.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });

        assert!(first.unsubscribe());
        client.dispatch(&ChannelEvent::Pong);

        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(client.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_send_when_closed_is_noop() {
        let client = ChannelClient::new(ChannelConfig::default());
        client.send("subscribe", json!({"camera": "cam-1"}));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_only_recognized_events_delivered() {
        let script = vec![
            r#"{"type":"viewer_count","data":{"count":3}}"#.to_string(),
            r#"{"type":"motion","data":{"id":"cam-1"}}"#.to_string(),
            r#"{"type":"snapshot_ready","data":{"id":"cam-2"}}"#.to_string(),
            r#"{"type":"camera_status","data":{"id":"cam-7","status":"OFFLINE"}}"#.to_string(),
        ];
        let server = spawn_server(script).await;
        let client = ChannelClient::new(config(&server.endpoint));

        let (tx, mut delivered) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        client.on(move |event| {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(event.clone());
            Ok(())
        });
        let mut states = state_watch(&client);

        assert_eq!(timeout(Duration::from_secs(5), states.recv()).await.unwrap(), Some(true));
        let event = timeout(Duration::from_secs(5), delivered.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            event,
            ChannelEvent::CameraStatus(CameraStatus {
                id: "cam-7".to_string(),
                status: "OFFLINE".to_string(),
                last_seen: None,
            })
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let uri = server.uri.await.unwrap();
        assert_eq!(uri, "/ws?token=s3cret%2F%2B");

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.subscriber_count(), 0);
        assert_eq!(states.recv().await, Some(false));
    }

    #[tokio::test]
    async fn test_heartbeat_and_outbound() {
        let mut server = spawn_server(Vec::new()).await;
        let client = ChannelClient::new(ChannelConfig {
            heartbeat_interval_secs: 1,
            ..config(&server.endpoint)
        });
        let mut states = state_watch(&client);
        assert_eq!(timeout(Duration::from_secs(5), states.recv()).await.unwrap(), Some(true));

        client.send("subscribe", json!({"camera": "cam-1"}));
        let frame = timeout(Duration::from_secs(5), server.received.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"type": "subscribe", "data": {"camera": "cam-1"}}));

        let frame = timeout(Duration::from_secs(5), server.received.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"type": "ping", "data": {}}));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        // Stock attempt budget, shortened delays
        let config = ChannelConfig {
            endpoint: format!("ws://{}/ws", addr),
            auth_token: None,
            reconnect_base_delay_ms: 5,
            reconnect_max_delay_ms: 20,
            ..ChannelConfig::default()
        };
        assert_eq!(config.max_reconnect_attempts, 10);
        let client = ChannelClient::new(config);
        let mut states = state_watch(&client);

        timeout(Duration::from_secs(10), async {
            while !client.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(client.reconnect_attempts(), 10);
        assert_eq!(client.state(), ConnectionState::Closed);

        // Initial attempt plus ten retries, each reported as a close
        let mut closes = 0;
        while let Ok(connected) = states.try_recv() {
            assert!(!connected);
            closes += 1;
        }
        assert_eq!(closes, 11);
    }

    #[tokio::test]
    async fn test_disconnect_is_terminal() {
        let client = ChannelClient::new(ChannelConfig::default());
        client.disconnect().await;
        assert!(client.connect(|_| {}).is_err());
    }
}
