//! Client for the signaling server.
//!
//! Owns the single logical connection: polling handshake, WebSocket upgrade,
//! namespace connect, heartbeat, reconnect with exponential backoff, and
//! resumption of a persisted session id. Inbound traffic is decoded once into
//! [`ChannelEvent`]s delivered in order on one bounded queue.

use crate::session_store::SessionStore;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tether_protocol::{
    AppPacket, Handshake, InboundSignal, MESSAGE_EVENT, OutboundSignal, Packet, REGISTER_EVENT,
    Registration, SessionToken, SignalingConfig, parse_handshake,
};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const EVENT_QUEUE_CAPACITY: usize = 64;
const MAX_BACKOFF_SECS: u64 = 30;
const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(20_000);

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("network error: {0}")]
    TransientNetwork(String),
    #[error("malformed server data: {0}")]
    ProtocolParse(String),
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),
    #[error("stored session was rejected by the server")]
    SessionExpired,
    #[error("channel not open")]
    NotOpen,
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
}

impl SignalingError {
    /// Whether the automatic reconnect path should keep trying after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SignalingError::InvalidUrl(_) | SignalingError::NotOpen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connecting,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub sid: String,
    /// Socket id from the namespace connect ack.
    pub socket_id: Option<String>,
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    MessageReceived(InboundSignal),
    ConnectionStatusChanged { connected: bool, reason: String },
    SessionEstablished(SessionInfo),
}

/// Everything the channel needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct SignalingSettings {
    pub base_url: Url,
    pub api_key: String,
    pub host_id_param: String,
    pub path: String,
    pub max_reconnect_attempts: u32,
    pub tls_cert: Option<String>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub registration: Registration,
}

impl SignalingSettings {
    pub fn from_config(config: &SignalingConfig, hostname: &str) -> Result<Self, SignalingError> {
        let base_url = Url::parse(config.url.trim())
            .map_err(|e| SignalingError::InvalidUrl(format!("{}: {e}", config.url)))?;
        if !matches!(base_url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                base_url.scheme()
            )));
        }
        if base_url.host_str().is_none_or(str::is_empty) {
            return Err(SignalingError::InvalidUrl(format!("{} has no host", config.url)));
        }
        Ok(Self {
            base_url,
            api_key: config.api_key.clone().unwrap_or_default(),
            host_id_param: config.host_id_param.clone(),
            path: config.path.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            tls_cert: config.tls_cert.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            registration: Registration {
                host_id: config.host_id.clone(),
                hostname: hostname.to_string(),
                os: std::env::consts::OS.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })
    }

    fn host_id(&self) -> &str {
        &self.registration.host_id
    }

    fn secure(&self) -> bool {
        matches!(self.base_url.scheme(), "https" | "wss")
    }

    fn endpoint(&self, scheme: &str) -> Url {
        let mut url = self.base_url.clone();
        // http<->ws and https<->wss are both special schemes, so this cannot fail.
        let _ = url.set_scheme(scheme);
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}/{}", self.path.trim_start_matches('/')));
        url.set_query(None);
        url.set_fragment(None);
        url
    }

    /// `GET <http(s)>://host/<path>?EIO=4&transport=polling&type=device&<param>=<id>`
    pub fn polling_url(&self) -> Url {
        let mut url = self.endpoint(if self.secure() { "https" } else { "http" });
        url.query_pairs_mut()
            .append_pair("EIO", "4")
            .append_pair("transport", "polling")
            .append_pair("type", "device")
            .append_pair(&self.host_id_param, self.host_id());
        url
    }

    /// `<ws(s)>://host/<path>?EIO=4&transport=websocket&sid=<sid>&type=device&<param>=<id>`
    pub fn websocket_url(&self, sid: &str) -> Url {
        let mut url = self.endpoint(if self.secure() { "wss" } else { "ws" });
        url.query_pairs_mut()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket")
            .append_pair("sid", sid)
            .append_pair("type", "device")
            .append_pair(&self.host_id_param, self.host_id());
        url
    }

    fn authorization(&self) -> String {
        format!("ApiKey {}", self.api_key)
    }
}

/// `min(30, 2^attempt)` seconds for the 1-based attempt number.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

/// Bump the attempt counter unless it already reached `max`.
fn next_attempt(attempts: &mut u32, max: u32) -> Option<u32> {
    if *attempts >= max {
        return None;
    }
    *attempts += 1;
    Some(*attempts)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Pong bookkeeping. The link is stale once no pong has been seen for more
/// than twice the server's ping timeout.
#[derive(Debug)]
struct HeartbeatMonitor {
    last_pong: Instant,
    stale: bool,
}

impl HeartbeatMonitor {
    fn new(now: Instant) -> Self {
        Self {
            last_pong: now,
            stale: false,
        }
    }

    /// Record a pong. Returns true if this ends a stale episode.
    fn pong(&mut self, now: Instant) -> bool {
        self.last_pong = now;
        std::mem::replace(&mut self.stale, false)
    }

    /// Returns true exactly once per stale episode.
    fn check(&mut self, now: Instant, ping_timeout: Duration) -> bool {
        if self.stale || now.duration_since(self.last_pong) <= ping_timeout * 2 {
            return false;
        }
        self.stale = true;
        true
    }
}

struct ConnState {
    sid: Option<String>,
    socket_id: Option<String>,
    resumed: bool,
    ping_interval: Duration,
    ping_timeout: Duration,
    attempts: u32,
    heartbeat: HeartbeatMonitor,
}

/// Receive and heartbeat tasks of one socket, cancelled and joined together.
struct Generation {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Generation {
    async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[derive(Default)]
struct ReconnectSlot {
    running: Option<(CancellationToken, JoinHandle<()>)>,
    /// A connection was lost while the reconnect task was already running.
    requested: bool,
}

struct Inner {
    settings: SignalingSettings,
    store: Arc<dyn SessionStore>,
    http: reqwest::Client,
    ws_connector: Option<tokio_tungstenite::Connector>,
    events: mpsc::Sender<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
    /// The single writer lock. Every outbound frame goes through it.
    writer: Mutex<Option<WsSink>>,
    conn: std::sync::Mutex<ConnState>,
    /// Serializes connect/reconnect/disconnect and holds the live generation.
    generation: Mutex<Option<Generation>>,
    reconnect: std::sync::Mutex<ReconnectSlot>,
    disconnecting: AtomicBool,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

impl SignalingChannel {
    pub fn new(
        settings: SignalingSettings,
        store: Arc<dyn SessionStore>,
    ) -> anyhow::Result<(Self, mpsc::Receiver<ChannelEvent>)> {
        let mut http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.handshake_timeout);
        if let Some(path) = &settings.tls_cert {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read TLS cert from {path}"))?;
            let cert = reqwest::Certificate::from_pem(&pem).context("Invalid TLS certificate")?;
            http = http.add_root_certificate(cert);
            info!(path, "Pinned server certificate");
        }
        let http = http.build().context("Failed to build HTTP client")?;

        let ws_connector = if settings.secure() {
            Some(build_tls_connector(settings.tls_cert.as_deref())?)
        } else {
            None
        };

        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Inner {
            settings,
            store,
            http,
            ws_connector,
            events,
            state,
            writer: Mutex::new(None),
            conn: std::sync::Mutex::new(ConnState {
                sid: None,
                socket_id: None,
                resumed: false,
                ping_interval: DEFAULT_PING_INTERVAL,
                ping_timeout: DEFAULT_PING_TIMEOUT,
                attempts: 0,
                heartbeat: HeartbeatMonitor::new(Instant::now()),
            }),
            generation: Mutex::new(None),
            reconnect: std::sync::Mutex::new(ReconnectSlot::default()),
            disconnecting: AtomicBool::new(false),
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        ))
    }

    /// Establish the connection, resuming a stored session when possible.
    /// On a retryable failure the error is returned and the backoff path
    /// keeps trying in the background.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let inner = &self.inner;
        inner.disconnecting.store(false, Ordering::SeqCst);
        inner.lock_conn().attempts = 0;
        info!(url = %inner.settings.base_url, host_id = inner.settings.host_id(), "Connecting to signaling server");

        match inner.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Signaling connect failed: {e}");
                inner
                    .emit(ChannelEvent::ConnectionStatusChanged {
                        connected: false,
                        reason: failure_reason(&e).to_string(),
                    })
                    .await;
                if e.is_retryable() {
                    inner.schedule_reconnect(false);
                }
                Err(e)
            }
        }
    }

    /// Close the connection and suppress auto-reconnect until the next `connect`.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.disconnecting.store(true, Ordering::SeqCst);

        let running = inner.lock_reconnect().running.take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            let _ = handle.await;
        }

        let mut slot = inner.generation.lock().await;
        if let Some(mut sink) = inner.writer.lock().await.take() {
            let frame = Packet::Message(AppPacket::Disconnect).encode();
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                debug!("Failed to send disconnect frame: {e}");
            }
            let _ = sink.close().await;
        }
        if let Some(generation) = slot.take() {
            generation.shutdown().await;
        }
        drop(slot);

        let was = inner.state.send_replace(ConnectionState::Disconnected);
        if was != ConnectionState::Disconnected {
            info!("Signaling channel disconnected");
            inner
                .emit(ChannelEvent::ConnectionStatusChanged {
                    connected: false,
                    reason: "disconnected".into(),
                })
                .await;
        }
    }

    /// Send one event frame. Fails fast with `NotOpen` if the namespace is not connected.
    pub async fn send(&self, event: &str, payload: Value) -> Result<(), SignalingError> {
        if self.state() != ConnectionState::Open {
            return Err(SignalingError::NotOpen);
        }
        self.inner
            .write_frame(Packet::event(event, payload).encode())
            .await
    }

    /// Connectivity came back: start a fresh retry episode whose first
    /// attempt runs without waiting out a backoff delay.
    pub fn network_restored(&self) {
        let inner = &self.inner;
        if inner.disconnecting.load(Ordering::SeqCst) {
            return;
        }
        inner.lock_conn().attempts = 0;
        if self.state() == ConnectionState::Open {
            return;
        }
        info!("Network restored, restarting signaling reconnect");
        let running = inner.lock_reconnect().running.take();
        if let Some((cancel, _)) = running {
            cancel.cancel();
        }
        inner.schedule_reconnect(true);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn sid(&self) -> Option<String> {
        self.inner.lock_conn().sid.clone()
    }

    pub fn ping_interval(&self) -> Duration {
        self.inner.lock_conn().ping_interval
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_conn().attempts
    }
}

/// Sends peer signals to viewers.
#[async_trait::async_trait]
pub trait SignalSender: Send + Sync {
    async fn send_signal(&self, message: OutboundSignal) -> Result<(), SignalingError>;
}

#[async_trait::async_trait]
impl SignalSender for SignalingChannel {
    async fn send_signal(&self, message: OutboundSignal) -> Result<(), SignalingError> {
        let payload = message
            .to_event_payload()
            .map_err(|e| SignalingError::ProtocolParse(e.to_string()))?;
        debug!(to = %message.to, kind = message.signal.kind().as_str(), "Sending peer signal");
        self.send(MESSAGE_EVENT, payload).await
    }
}

fn failure_reason(e: &SignalingError) -> &'static str {
    match e {
        SignalingError::TransientNetwork(_) => "network-error",
        SignalingError::ProtocolParse(_) => "protocol-error",
        SignalingError::HandshakeFailure(_) => "handshake-failed",
        SignalingError::SessionExpired => "session-expired",
        SignalingError::NotOpen => "not-open",
        SignalingError::InvalidUrl(_) => "invalid-url",
    }
}

impl Inner {
    fn lock_conn(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reconnect(&self) -> std::sync::MutexGuard<'_, ReconnectSlot> {
        self.reconnect.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Signaling event dropped (no consumer)");
        }
    }

    async fn write_frame(&self, frame: String) -> Result<(), SignalingError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(SignalingError::NotOpen)?;
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|e| SignalingError::TransientNetwork(e.to_string()))
    }

    /// One full connection attempt, replacing any previous generation.
    async fn establish(self: &Arc<Self>) -> Result<(), SignalingError> {
        let mut slot = self.generation.lock().await;
        match self.establish_locked(&mut slot).await {
            Err(SignalingError::SessionExpired) => {
                info!("Resumed session rejected, performing fresh handshake");
                self.establish_locked(&mut slot).await
            }
            other => other,
        }
    }

    async fn establish_locked(
        self: &Arc<Self>,
        slot: &mut Option<Generation>,
    ) -> Result<(), SignalingError> {
        if let Some(previous) = slot.take() {
            previous.shutdown().await;
        }
        *self.writer.lock().await = None;

        let (sid, stream, resumed) = match self.open_session().await {
            Ok(opened) => opened,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);
        {
            let mut conn = self.lock_conn();
            conn.sid = Some(sid);
            conn.socket_id = None;
            conn.resumed = resumed;
            conn.heartbeat = HeartbeatMonitor::new(Instant::now());
        }
        self.state.send_replace(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let upgraded = async {
            self.write_frame(Packet::Upgrade.encode()).await?;
            self.write_frame(Packet::connect().encode()).await
        };
        if let Err(e) = upgraded.await {
            *self.writer.lock().await = None;
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(e);
        }

        let tasks = vec![
            tokio::spawn(Arc::clone(self).receive_loop(source, cancel.clone())),
            tokio::spawn(Arc::clone(self).heartbeat_loop(cancel.clone())),
        ];
        *slot = Some(Generation {
            cancel: cancel.clone(),
            tasks,
        });

        // The receive loop moves the state to Open on the namespace ack, or to
        // Disconnected if the socket dies first.
        let mut state_rx = self.state.subscribe();
        let settled = tokio::time::timeout(
            self.settings.handshake_timeout,
            state_rx.wait_for(|s| matches!(s, ConnectionState::Open | ConnectionState::Disconnected)),
        )
        .await
        .map(|r| r.map(|s| *s));

        let failure = match settled {
            Ok(Ok(ConnectionState::Open)) => return Ok(()),
            Ok(_) if self.lock_conn().resumed && self.store_was_cleared() => {
                SignalingError::SessionExpired
            }
            Ok(_) => SignalingError::TransientNetwork("socket closed before namespace ack".into()),
            Err(_) => SignalingError::HandshakeFailure("namespace connect not acknowledged".into()),
        };
        if let Some(generation) = slot.take() {
            generation.shutdown().await;
        }
        *self.writer.lock().await = None;
        self.state.send_replace(ConnectionState::Disconnected);
        Err(failure)
    }

    fn store_was_cleared(&self) -> bool {
        matches!(self.store.load(), Ok(None))
    }

    /// Resume the stored session if it is still valid, else do a fresh handshake.
    async fn open_session(&self) -> Result<(String, WsStream, bool), SignalingError> {
        if let Some(token) = self.valid_token() {
            self.state.send_replace(ConnectionState::Connecting);
            info!("Attempting to resume stored signaling session");
            match self.open_socket(&token.sid, true).await {
                Ok(stream) => return Ok((token.sid, stream, true)),
                Err(SignalingError::SessionExpired) => {
                    info!("Stored session expired on the server, clearing it");
                    if let Err(e) = self.store.clear() {
                        warn!("Failed to clear session token: {e}");
                    }
                }
                Err(e) => debug!("Session resumption failed: {e}"),
            }
        }

        self.state.send_replace(ConnectionState::Handshaking);
        let handshake = self.handshake().await?;
        {
            let mut conn = self.lock_conn();
            conn.ping_interval = Duration::from_millis(handshake.ping_interval);
            conn.ping_timeout = Duration::from_millis(handshake.ping_timeout);
        }
        if let Err(e) = self
            .store
            .save(&SessionToken::new(handshake.sid.clone(), now_ms()))
        {
            warn!("Failed to persist session token: {e}");
        }

        self.state.send_replace(ConnectionState::Connecting);
        let stream = self.open_socket(&handshake.sid, false).await?;
        Ok((handshake.sid, stream, false))
    }

    fn valid_token(&self) -> Option<SessionToken> {
        match self.store.load() {
            Ok(Some(token)) if token.is_valid_at(now_ms()) => Some(token),
            Ok(Some(_)) => {
                debug!("Stored session token is stale, ignoring it");
                if let Err(e) = self.store.clear() {
                    warn!("Failed to clear session token: {e}");
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to load session token: {e}");
                None
            }
        }
    }

    async fn handshake(&self) -> Result<Handshake, SignalingError> {
        let url = self.settings.polling_url();
        debug!(%url, "Signaling handshake");
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.settings.authorization())
            .send()
            .await
            .map_err(|e| SignalingError::TransientNetwork(format!("handshake request: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SignalingError::TransientNetwork(format!(
                "handshake returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(SignalingError::HandshakeFailure(format!(
                "server returned {status}"
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SignalingError::TransientNetwork(format!("handshake body: {e}")))?;
        let handshake =
            parse_handshake(&body).map_err(|e| SignalingError::HandshakeFailure(e.to_string()))?;
        if !handshake.supports_websocket() {
            return Err(SignalingError::HandshakeFailure(
                "server does not offer the websocket upgrade".into(),
            ));
        }
        info!(
            ping_interval_ms = handshake.ping_interval,
            ping_timeout_ms = handshake.ping_timeout,
            "Signaling handshake complete"
        );
        Ok(handshake)
    }

    async fn open_socket(&self, sid: &str, resuming: bool) -> Result<WsStream, SignalingError> {
        let url = self.settings.websocket_url(sid);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        let auth = HeaderValue::from_str(&self.settings.authorization())
            .map_err(|e| SignalingError::HandshakeFailure(format!("API key header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let connect = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            self.ws_connector.clone(),
        );
        match tokio::time::timeout(self.settings.connect_timeout, connect).await {
            Err(_) => Err(SignalingError::TransientNetwork(
                "websocket connect timed out".into(),
            )),
            Ok(Ok((stream, _))) => {
                debug!(resuming, "WebSocket open");
                Ok(stream)
            }
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                Err(match status {
                    400 | 404 if resuming => SignalingError::SessionExpired,
                    500.. => SignalingError::TransientNetwork(format!("upgrade returned {status}")),
                    _ => SignalingError::HandshakeFailure(format!("upgrade returned {status}")),
                })
            }
            Ok(Err(e)) => Err(SignalingError::TransientNetwork(format!(
                "websocket connect: {e}"
            ))),
        }
    }

    async fn receive_loop(self: Arc<Self>, mut source: WsSource, cancel: CancellationToken) {
        let idle = self.settings.idle_timeout;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = tokio::time::timeout(idle, source.next()) => next,
            };
            match next {
                Err(_) => {
                    debug!(idle_secs = idle.as_secs(), "Signaling socket idle, sending liveness probe");
                    if let Err(e) = self.write_frame(Packet::Ping(String::new()).encode()).await {
                        self.on_transport_lost(&cancel, &format!("probe failed: {e}")).await;
                        return;
                    }
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    if !self.handle_frame(text.as_str(), &cancel).await {
                        return;
                    }
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    debug!(?frame, "Server closed signaling socket");
                    self.on_transport_lost(&cancel, "server-closed").await;
                    return;
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    self.on_transport_lost(&cancel, &format!("socket error: {e}")).await;
                    return;
                }
                Ok(None) => {
                    self.on_transport_lost(&cancel, "socket-ended").await;
                    return;
                }
            }
        }
    }

    /// Handle one text frame. Returns false once the connection is gone.
    async fn handle_frame(self: &Arc<Self>, text: &str, cancel: &CancellationToken) -> bool {
        let packet = match Packet::decode(text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Dropping malformed signaling frame");
                return true;
            }
        };
        match packet {
            Packet::Ping(data) => {
                self.note_heartbeat();
                if let Err(e) = self.write_frame(Packet::Pong(data).encode()).await {
                    self.on_transport_lost(cancel, &format!("pong failed: {e}")).await;
                    return false;
                }
            }
            Packet::Pong(_) => self.note_heartbeat(),
            Packet::Message(AppPacket::Connect(data)) => {
                return self.on_namespace_connected(data, cancel).await;
            }
            Packet::Message(AppPacket::Event { name, payload }) => {
                if name != MESSAGE_EVENT {
                    debug!(event = %name, "Ignoring unhandled signaling event");
                    return true;
                }
                match InboundSignal::decode(payload) {
                    Ok(signal) => {
                        debug!(peer_id = %signal.peer_id, kind = signal.signal.kind().as_str(), "Peer signal received");
                        self.emit(ChannelEvent::MessageReceived(signal)).await;
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed peer message"),
                }
            }
            Packet::Message(AppPacket::Error(data)) => {
                warn!(%data, "Server refused namespace connect");
                if self.lock_conn().resumed
                    && self.state() == ConnectionState::Connecting
                    && let Err(e) = self.store.clear()
                {
                    warn!("Failed to clear session token: {e}");
                }
                self.on_transport_lost(cancel, "connect-error").await;
                return false;
            }
            Packet::Message(AppPacket::Disconnect) | Packet::Close => {
                self.on_transport_lost(cancel, "server-disconnect").await;
                return false;
            }
            Packet::Message(AppPacket::Ack { id, .. }) => debug!(?id, "Ignoring ack"),
            Packet::Open(_) | Packet::Upgrade | Packet::Noop => {}
        }
        true
    }

    fn note_heartbeat(&self) {
        if self.lock_conn().heartbeat.pong(Instant::now()) {
            info!("Signaling heartbeat recovered");
        }
    }

    async fn on_namespace_connected(
        self: &Arc<Self>,
        data: Option<Value>,
        cancel: &CancellationToken,
    ) -> bool {
        let socket_id = data
            .as_ref()
            .and_then(|d| d.get("sid"))
            .and_then(Value::as_str)
            .map(String::from);
        let info = {
            let mut conn = self.lock_conn();
            conn.socket_id = socket_id.clone();
            conn.attempts = 0;
            SessionInfo {
                sid: conn.sid.clone().unwrap_or_default(),
                socket_id,
                resumed: conn.resumed,
            }
        };
        self.state.send_replace(ConnectionState::Open);
        info!(socket_id = ?info.socket_id, resumed = info.resumed, "Signaling channel open");

        let registration = serde_json::to_value(&self.settings.registration).unwrap_or(Value::Null);
        if let Err(e) = self
            .write_frame(Packet::event(REGISTER_EVENT, registration).encode())
            .await
        {
            self.on_transport_lost(cancel, &format!("register failed: {e}")).await;
            return false;
        }

        self.emit(ChannelEvent::ConnectionStatusChanged {
            connected: true,
            reason: "connected".into(),
        })
        .await;
        self.emit(ChannelEvent::SessionEstablished(info)).await;
        true
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let (interval, ping_timeout) = {
            let conn = self.lock_conn();
            (conn.ping_interval, conn.ping_timeout)
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.write_frame(Packet::Ping(String::new()).encode()).await {
                self.on_transport_lost(&cancel, &format!("ping failed: {e}")).await;
                return;
            }
            let stale = self
                .lock_conn()
                .heartbeat
                .check(Instant::now(), ping_timeout);
            if stale {
                warn!(
                    ping_timeout_ms = ping_timeout.as_millis() as u64,
                    "No pong from signaling server, connection is stale"
                );
                self.emit(ChannelEvent::ConnectionStatusChanged {
                    connected: true,
                    reason: "heartbeat-stale".into(),
                })
                .await;
            }
        }
    }

    /// First task of a generation to see the socket die tears the generation
    /// down; the auto-reconnect path only starts for an established connection.
    async fn on_transport_lost(self: &Arc<Self>, cancel: &CancellationToken, reason: &str) {
        if cancel.is_cancelled() {
            return;
        }
        cancel.cancel();
        *self.writer.lock().await = None;
        let was = self.state.send_replace(ConnectionState::Disconnected);
        if self.disconnecting.load(Ordering::SeqCst) || was != ConnectionState::Open {
            debug!(reason, "Signaling socket closed");
            return;
        }
        warn!(reason, "Signaling connection lost");
        self.emit(ChannelEvent::ConnectionStatusChanged {
            connected: false,
            reason: reason.to_string(),
        })
        .await;
        self.schedule_reconnect(false);
    }

    fn schedule_reconnect(self: &Arc<Self>, immediate: bool) {
        if self.disconnecting.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.lock_reconnect();
        if slot.running.is_some() {
            slot.requested = true;
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).reconnect_loop(cancel.clone(), immediate));
        slot.running = Some((cancel, handle));
        slot.requested = false;
    }

    async fn reconnect_loop(self: Arc<Self>, cancel: CancellationToken, mut immediate: bool) {
        let max = self.settings.max_reconnect_attempts;
        loop {
            if cancel.is_cancelled() || self.disconnecting.load(Ordering::SeqCst) {
                break;
            }
            self.lock_reconnect().requested = false;

            let attempt = next_attempt(&mut self.lock_conn().attempts, max);
            let Some(attempt) = attempt else {
                error!(max_attempts = max, "Signaling reconnect attempts exhausted");
                self.emit(ChannelEvent::ConnectionStatusChanged {
                    connected: false,
                    reason: "reconnect-exhausted".into(),
                })
                .await;
                break;
            };

            let delay = if std::mem::take(&mut immediate) {
                Duration::ZERO
            } else {
                backoff_delay(attempt)
            };
            info!(attempt, max_attempts = max, delay_secs = delay.as_secs(), "Reconnecting to signaling server");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.establish() => result,
            };
            match result {
                Ok(()) => {
                    let mut slot = self.lock_reconnect();
                    if !slot.requested {
                        info!(attempt, "Signaling reconnected");
                        // A cancelled loop was already taken out of the slot.
                        if !cancel.is_cancelled() {
                            slot.running = None;
                        }
                        return;
                    }
                }
                Err(e) if !e.is_retryable() => {
                    error!("Signaling reconnect aborted: {e}");
                    break;
                }
                Err(e) => warn!(attempt, "Signaling reconnect failed: {e}"),
            }
        }
        let mut slot = self.lock_reconnect();
        if !cancel.is_cancelled() {
            slot.running = None;
            slot.requested = false;
        }
    }
}

/// Build a TLS connector trusting the system roots plus an optional pinned certificate.
fn build_tls_connector(tls_cert_path: Option<&str>) -> anyhow::Result<tokio_tungstenite::Connector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Failed to load a platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        let pem_data = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read TLS cert from {cert_path}"))?;
        for cert in rustls_pemfile::certs(&mut pem_data.as_slice()).filter_map(|r| r.ok()) {
            if let Err(e) = root_store.add(cert) {
                warn!("Failed to add pinned cert to root store: {e}");
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("Failed to select TLS protocol versions")?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}
