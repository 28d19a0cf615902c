//! Shard implementation.
//!
//! A shard is one persistent WebSocket connection to the gateway. The shard
//! owns the socket exclusively: a reader task delivers decoded packets to
//! the packet handler strictly in receive order, and all transmissions go
//! through the shard's send path. Heartbeats bypass admission control; every
//! other payload takes a bucket token.

use crate::bucket::{self, CommandBucket};
use crate::command::PendingMemberRequest;
use crate::compression::{self, Inflater};
use crate::error::{CloseAction, GatewayError, ShardCloseCode};
use crate::event::{GatewayMessage, ShardEvent};
use crate::heartbeat::Heart;
use crate::opcode::OpCode;
use crate::payload::{
    self, ConnectionProperties, GatewayPayload, GuildMembersChunk, Hello, Identify,
    RawGatewayPayload, ReadyData, Resume, UpdatePresence,
};
use crate::queue::OfflineQueue;
use crate::ratelimit::{self, IdentifyQueue, LocalIdentifyQueue};
use crate::waiters::{WaiterKind, WaiterOutcome, Waiters};
use crate::{DEFAULT_GATEWAY_URL, GATEWAY_VERSION};

use dashmap::DashMap;
use futures_util::future::{self, Either};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Type alias for the WebSocket stream.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Builds the presence sent with each Identify.
pub type PresenceFactory = Arc<dyn Fn() -> Option<UpdatePresence> + Send + Sync>;

/// Shard connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Not connected, nothing pending.
    Offline,
    /// Opening the WebSocket.
    Connecting,
    /// Socket open, waiting to authenticate.
    Unidentified,
    /// An identify attempt is in flight.
    Identifying,
    /// Authenticated and receiving events.
    Connected,
    /// A resume attempt is in flight.
    Resuming,
    /// Connection closed; the initiator of the close drives the next step.
    Disconnected,
}

/// Configuration for a shard.
#[derive(Clone)]
pub struct ShardConfig {
    /// Bot token.
    pub token: String,

    /// Gateway intents.
    pub intents: vanadium_model::Intents,

    /// Gateway endpoint. Query parameters are only appended for the primary
    /// gateway; proxy endpoints are dialed unmodified.
    pub gateway_url: String,

    /// Gateway API version.
    pub version: u8,

    /// Total number of shards the bot runs.
    pub total_shards: u32,

    /// Enable zlib-stream transport compression.
    pub compress: bool,

    /// Member-list threshold for large guilds (50-250).
    pub large_threshold: u8,

    /// Connection properties sent with Identify.
    pub properties: ConnectionProperties<'static>,

    /// Correlate member requests with their chunk responses. When disabled,
    /// `request_members` completes with an empty list and chunks only
    /// arrive as events.
    pub track_member_requests: bool,

    /// Presence to send with each Identify.
    pub make_presence: Option<PresenceFactory>,

    /// Gate on identify permits; shared across shards of a cluster.
    pub identify_queue: Arc<dyn IdentifyQueue>,
}

impl ShardConfig {
    /// Create a configuration with the required fields.
    pub fn new(token: impl Into<String>, intents: vanadium_model::Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            version: GATEWAY_VERSION,
            total_shards: 1,
            compress: false,
            large_threshold: 250,
            properties: ConnectionProperties::default(),
            track_member_requests: true,
            make_presence: None,
            identify_queue: Arc::new(LocalIdentifyQueue::default()),
        }
    }

    /// Set a custom gateway endpoint.
    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    /// Set the total shard count.
    pub fn with_total_shards(mut self, total_shards: u32) -> Self {
        self.total_shards = total_shards;
        self
    }

    /// Enable zlib-stream transport compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Share an identify queue across shards.
    pub fn with_identify_queue(mut self, queue: Arc<dyn IdentifyQueue>) -> Self {
        self.identify_queue = queue;
        self
    }

    /// Send a presence with each Identify.
    pub fn with_presence(mut self, make_presence: PresenceFactory) -> Self {
        self.make_presence = Some(make_presence);
        self
    }

    /// Toggle member-request correlation.
    pub fn with_member_request_tracking(mut self, track: bool) -> Self {
        self.track_member_requests = track;
        self
    }
}

impl fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConfig")
            .field("intents", &self.intents)
            .field("gateway_url", &self.gateway_url)
            .field("version", &self.version)
            .field("total_shards", &self.total_shards)
            .field("compress", &self.compress)
            .field("large_threshold", &self.large_threshold)
            .field("track_member_requests", &self.track_member_requests)
            .finish_non_exhaustive()
    }
}

/// Session data held for resuming.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub session_id: String,
    pub resume_gateway_url: String,
}

#[derive(Debug, Default)]
struct Timers {
    jitter: Option<JoinHandle<()>>,
    steady: Option<JoinHandle<()>>,
}

pub(crate) struct ShardInner {
    pub(crate) id: u32,
    pub(crate) config: ShardConfig,
    pub(crate) state: RwLock<ShardState>,
    pub(crate) session: RwLock<Option<Session>>,
    pub(crate) sequence: RwLock<Option<u64>>,
    pub(crate) heart: Heart,
    timers: Mutex<Timers>,
    pub(crate) bucket: CommandBucket,
    pub(crate) offline: OfflineQueue,
    pub(crate) waiters: Waiters,
    pub(crate) pending_members: DashMap<String, PendingMemberRequest>,
    socket: tokio::sync::Mutex<Option<WsSink>>,
    socket_open: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    identify_attempt: AtomicU64,
    pub(crate) shutdown: AtomicBool,
    inflater: Mutex<Inflater>,
    events: flume::Sender<ShardEvent>,
}

/// A gateway shard. Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Shard(pub(crate) Arc<ShardInner>);

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.0.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shard {
    /// Create a shard and the channel its events arrive on.
    pub fn new(id: u32, config: ShardConfig) -> (Self, flume::Receiver<ShardEvent>) {
        let (events, event_rx) = flume::unbounded();

        let shard = Self(Arc::new(ShardInner {
            id,
            config,
            state: RwLock::new(ShardState::Offline),
            session: RwLock::new(None),
            sequence: RwLock::new(None),
            heart: Heart::new(),
            timers: Mutex::new(Timers::default()),
            bucket: CommandBucket::new(
                bucket::COMMANDS_PER_INTERVAL,
                bucket::COMMANDS_PER_INTERVAL,
                bucket::REFILL_INTERVAL,
            ),
            offline: OfflineQueue::default(),
            waiters: Waiters::default(),
            pending_members: DashMap::new(),
            socket: tokio::sync::Mutex::new(None),
            socket_open: AtomicBool::new(false),
            reader: Mutex::new(None),
            identify_attempt: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            inflater: Mutex::new(Inflater::new()),
            events,
        }));

        (shard, event_rx)
    }

    /// This shard's ID.
    pub fn id(&self) -> u32 {
        self.0.id
    }

    /// Current connection state.
    pub fn state(&self) -> ShardState {
        *self.0.state.read()
    }

    /// Last sequence number seen, if any.
    pub fn sequence(&self) -> Option<u64> {
        *self.0.sequence.read()
    }

    /// Session ID of the current session, if one was established.
    pub fn session_id(&self) -> Option<String> {
        self.0.session.read().as_ref().map(|s| s.session_id.clone())
    }

    /// Last measured heartbeat round trip.
    pub fn latency(&self) -> Option<Duration> {
        self.0.heart.rtt()
    }

    /// Whether the socket is currently open.
    pub fn is_open(&self) -> bool {
        self.0.socket_open.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ShardState) {
        *self.0.state.write() = state;
    }

    fn emit(&self, event: ShardEvent) {
        if self.0.events.send(event).is_err() {
            trace!(shard_id = self.0.id, "event receiver dropped");
        }
    }

    fn attempt_is_current(&self, attempt: u64) -> bool {
        self.0.identify_attempt.load(Ordering::SeqCst) == attempt
    }

    /// `Ok` for an attempt superseded by a newer one, `Err` past shutdown.
    fn cancelled_outcome(&self) -> Result<(), GatewayError> {
        if self.0.shutdown.load(Ordering::SeqCst) {
            Err(GatewayError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Authenticate with a fresh session.
    ///
    /// Completes when Ready arrives. An InvalidSession response completes
    /// without error; its handler schedules the next step. Concurrent
    /// identify attempts collapse: a superseded attempt stops quietly.
    pub async fn identify(&self) -> Result<(), GatewayError> {
        if self.0.shutdown.load(Ordering::SeqCst) {
            return Err(GatewayError::Shutdown);
        }
        let attempt = self.0.identify_attempt.fetch_add(1, Ordering::SeqCst) + 1;

        if self.is_open() {
            self.close(ShardCloseCode::ReIdentifying, "re-identifying").await;
        }

        self.set_state(ShardState::Identifying);
        self.emit(ShardEvent::Identifying);

        if !self.is_open() {
            self.connect().await?;
        }
        if !self.attempt_is_current(attempt) {
            return Ok(());
        }

        self.0.config.identify_queue.request(self.0.id).await;
        if !self.attempt_is_current(attempt) || self.0.shutdown.load(Ordering::SeqCst) {
            return self.cancelled_outcome();
        }

        let ready_rx = self.0.waiters.register(WaiterKind::Ready);
        let invalid_rx = self.0.waiters.register(WaiterKind::InvalidSession);

        let identify = Identify {
            token: payload::bot_token(&self.0.config.token).into(),
            properties: self.0.config.properties.clone(),
            compress: Some(self.0.config.compress),
            large_threshold: Some(self.0.config.large_threshold),
            shard: [self.0.id, self.0.config.total_shards],
            intents: self.0.config.intents,
            presence: self.0.config.make_presence.as_deref().and_then(|make| make()),
        };
        info!(shard_id = self.0.id, "identifying");
        self.send(&GatewayPayload::new(OpCode::Identify, identify), true)
            .await?;

        match future::select(ready_rx, invalid_rx).await {
            Either::Left((outcome, _)) => match outcome {
                Ok(WaiterOutcome::Resolved) => {
                    self.emit(ShardEvent::Identified);
                    Ok(())
                }
                Ok(WaiterOutcome::Fatal { code, reason }) => {
                    Err(GatewayError::FatalClose { code, reason })
                }
                Err(_) => self.cancelled_outcome(),
            },
            Either::Right((outcome, _)) => match outcome {
                // The invalid-session handler schedules the next step.
                Ok(WaiterOutcome::Resolved) => Ok(()),
                Ok(WaiterOutcome::Fatal { code, reason }) => {
                    Err(GatewayError::FatalClose { code, reason })
                }
                Err(_) => self.cancelled_outcome(),
            },
        }
    }

    /// Rejoin the current session from the last seen sequence number.
    ///
    /// Falls back to [`identify`](Self::identify) when no session exists.
    pub async fn resume(&self) -> Result<(), GatewayError> {
        if self.0.shutdown.load(Ordering::SeqCst) {
            return Err(GatewayError::Shutdown);
        }

        if self.is_open() {
            self.close(ShardCloseCode::ResumeClosingOldConnection, "resuming")
                .await;
        }

        let session = self.0.session.read().clone();
        let Some(session) = session else {
            return self.identify().await;
        };

        self.set_state(ShardState::Resuming);
        self.connect().await?;

        let resumed_rx = self.0.waiters.register(WaiterKind::Resumed);
        let invalid_rx = self.0.waiters.register(WaiterKind::InvalidSession);

        let seq = self.sequence().unwrap_or(0);
        let resume = Resume {
            token: payload::bot_token(&self.0.config.token).into(),
            session_id: session.session_id.clone().into(),
            seq,
        };
        info!(shard_id = self.0.id, session_id = %session.session_id, seq, "resuming session");
        self.send(&GatewayPayload::new(OpCode::Resume, resume), true)
            .await?;

        match future::select(resumed_rx, invalid_rx).await {
            Either::Left((outcome, _)) | Either::Right((outcome, _)) => match outcome {
                Ok(WaiterOutcome::Resolved) => Ok(()),
                Ok(WaiterOutcome::Fatal { code, reason }) => {
                    Err(GatewayError::FatalClose { code, reason })
                }
                Err(_) => self.cancelled_outcome(),
            },
        }
    }

    /// Transmit a payload once the offline queue and the command bucket
    /// admit it. High-priority senders overtake at both.
    ///
    /// The transmission itself is fire-and-forget: a socket that closed
    /// after admission drops the payload silently.
    pub async fn send<T: Serialize>(
        &self,
        payload: &T,
        high_priority: bool,
    ) -> Result<(), GatewayError> {
        let json = serde_json::to_string(payload)?;

        self.check_offline(high_priority).await?;
        self.0.bucket.acquire(1, high_priority).await?;
        // The socket may have closed while waiting for a token.
        self.check_offline(high_priority).await?;

        self.send_direct(json).await;
        Ok(())
    }

    /// Park until a reconnect drains the offline queue, if the socket is
    /// not open.
    async fn check_offline(&self, high_priority: bool) -> Result<(), GatewayError> {
        if self.is_open() {
            return Ok(());
        }
        self.0
            .offline
            .park(high_priority)
            .await
            .map_err(|_| GatewayError::Shutdown)
    }

    /// Write a frame, bypassing admission control. Heartbeats and payloads
    /// that already hold a token come through here.
    async fn send_direct(&self, json: String) -> bool {
        let mut socket = self.0.socket.lock().await;
        match socket.as_mut() {
            Some(sink) => match sink.send(WsMessage::Text(json.into())).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(shard_id = self.0.id, error = %err, "failed to write frame");
                    false
                }
            },
            None => false,
        }
    }

    /// Close the connection. No-op unless the socket is open.
    pub async fn close(&self, code: ShardCloseCode, reason: &str) {
        if !self.0.socket_open.swap(false, Ordering::SeqCst) {
            return;
        }

        // This side owns the teardown; the reader must not also classify.
        if let Some(reader) = self.0.reader.lock().take() {
            reader.abort();
        }

        let sink = self.0.socket.lock().await.take();
        if let Some(mut sink) = sink {
            let frame = CloseFrame {
                code: WsCloseCode::from(code.code()),
                reason: reason.to_string().into(),
            };
            if let Err(err) = sink.send(WsMessage::Close(Some(frame))).await {
                debug!(shard_id = self.0.id, error = %err, "close frame not delivered");
            }
        }

        self.finish_close(code.code(), reason);
    }

    /// Shut the shard down. Every parked waiter and in-flight operation is
    /// woken with a cancellation outcome.
    pub async fn shutdown(&self) {
        info!(shard_id = self.0.id, "shard shutdown requested");
        self.0.shutdown.store(true, Ordering::SeqCst);

        self.close(ShardCloseCode::Shutdown, "shutting down").await;
        self.set_state(ShardState::Offline);

        self.stop_heartbeat();
        self.0.offline.close();
        self.0.bucket.close();
        self.0.waiters.clear();
        self.0.pending_members.clear();
    }

    /// Build the URL to dial, appending protocol query parameters only for
    /// the primary gateway.
    fn gateway_url(&self) -> Result<Url, GatewayError> {
        let config = &self.0.config;

        let base = if self.state() == ShardState::Resuming {
            self.0
                .session
                .read()
                .as_ref()
                .map(|s| s.resume_gateway_url.clone())
                .unwrap_or_else(|| config.gateway_url.clone())
        } else {
            config.gateway_url.clone()
        };

        let mut url = Url::parse(&base)?;
        if config.gateway_url.trim_end_matches('/') == DEFAULT_GATEWAY_URL {
            url.query_pairs_mut()
                .append_pair("v", &config.version.to_string())
                .append_pair("encoding", "json");
            if config.compress {
                url.query_pairs_mut().append_pair("compress", "zlib-stream");
            }
        }

        Ok(url)
    }

    /// Deliver frames to the packet handler until the connection ends, then
    /// classify the close. Exactly one of this task and [`close`](Self::close)
    /// tears a connection down, decided by who flips `socket_open` first.
    // Boxed rather than a plain `async fn` so its future has a concrete,
    // already-resolved type: `read_loop` is spawned from inside `connect`
    // and (via `handle_frame`) ends up scheduling `identify`/`resume`, which
    // themselves await `connect` — an `async fn` here would make that a
    // recursive opaque-type cycle the compiler can't resolve for `Send`.
    fn read_loop(
        self,
        mut stream: SplitStream<WsStream>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let (code, reason) = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(err) = self.handle_frame(text.as_str()).await {
                            warn!(shard_id = self.0.id, error = %err, "failed to handle frame");
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        let text = if self.0.config.compress {
                            match self.0.inflater.lock().extend(&data) {
                                Ok(text) => text,
                                Err(err) => {
                                    debug!(shard_id = self.0.id, error = %err, "dropping frame that failed to decompress");
                                    None
                                }
                            }
                        } else {
                            match compression::inflate_message(&data) {
                                Ok(text) => Some(text),
                                Err(err) => {
                                    debug!(shard_id = self.0.id, error = %err, "dropping undecodable binary frame");
                                    None
                                }
                            }
                        };

                        if let Some(text) = text {
                            if let Err(err) = self.handle_frame(&text).await {
                                warn!(shard_id = self.0.id, error = %err, "failed to handle frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                    }
                    // Ping/pong bookkeeping happens inside tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(shard_id = self.0.id, error = %err, "websocket transport error");
                        break (1006, err.to_string());
                    }
                    None => break (1006, "stream ended".to_string()),
                }
            };

            if !self.0.socket_open.swap(false, Ordering::SeqCst) {
                // A local close already owns the teardown.
                return;
            }
            drop(self.0.reader.lock().take());
            *self.0.socket.lock().await = None;
            self.finish_close(code, &reason);
        })
    }

    /// Stop heartbeat timers, classify the close, and start the follow-up.
    pub(crate) fn finish_close(&self, code: u16, reason: &str) {
        self.stop_heartbeat();

        let action = CloseAction::classify(code);
        info!(shard_id = self.0.id, code, reason, ?action, "gateway connection closed");

        if action != CloseAction::Offline {
            self.emit(ShardEvent::Disconnected { code });
        }

        match action {
            CloseAction::Offline => self.set_state(ShardState::Offline),
            CloseAction::Graceful => self.set_state(ShardState::Disconnected),
            CloseAction::Reidentify => {
                *self.0.session.write() = None;
                self.set_state(ShardState::Identifying);
                if !self.0.shutdown.load(Ordering::SeqCst) {
                    let shard = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = shard.identify().await {
                            warn!(shard_id = shard.0.id, error = %err, "re-identify failed");
                        }
                    });
                }
            }
            CloseAction::Fatal => {
                *self.0.session.write() = None;
                self.set_state(ShardState::Offline);
                self.0.waiters.fail_all(code, reason);
            }
            CloseAction::Resume => {
                self.set_state(ShardState::Resuming);
                if !self.0.shutdown.load(Ordering::SeqCst) {
                    let shard = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = shard.resume().await {
                            warn!(shard_id = shard.0.id, error = %err, "resume failed");
                        }
                    });
                }
            }
        }
    }

    /// Handle one decoded packet.
    async fn handle_frame(&self, text: &str) -> Result<(), GatewayError> {
        let raw: RawGatewayPayload = serde_json::from_str(text)?;

        // Any inbound packet acknowledges an outstanding beat; RTT is
        // measured on all traffic, not only explicit acks.
        self.0.heart.observe_packet();

        match raw.op {
            OpCode::Heartbeat => {
                debug!(shard_id = self.0.id, "gateway requested a heartbeat");
                let seq = self.sequence();
                self.send_direct(payload::heartbeat_json(seq)).await;
                self.0.heart.note_server_beat();
            }
            OpCode::Hello => {
                if let Some(d) = raw.d {
                    let hello: Hello = serde_json::from_str(d.get())?;
                    self.handle_hello(&hello);
                    self.emit(ShardEvent::Hello {
                        heartbeat_interval: hello.heartbeat_interval,
                    });
                }
            }
            OpCode::HeartbeatAck => {
                self.emit(ShardEvent::HeartbeatAck {
                    rtt: self.0.heart.rtt(),
                });
            }
            OpCode::Reconnect => {
                info!(shard_id = self.0.id, "gateway requested a reconnect");
                self.emit(ShardEvent::RequestedReconnect);
                let shard = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = shard.resume().await {
                        warn!(shard_id = shard.0.id, error = %err, "requested reconnect failed");
                    }
                });
            }
            OpCode::InvalidSession => {
                let resumable = raw.d.map(|d| d.get() == "true").unwrap_or(false);
                warn!(shard_id = self.0.id, resumable, "session invalidated");
                self.emit(ShardEvent::InvalidSession { resumable });

                tokio::time::sleep(ratelimit::invalid_session_backoff()).await;
                self.0.waiters.resolve(WaiterKind::InvalidSession);

                if !resumable {
                    *self.0.session.write() = None;
                    *self.0.sequence.write() = None;
                }
                let shard = self.clone();
                tokio::spawn(async move {
                    let result = if resumable {
                        shard.resume().await
                    } else {
                        shard.identify().await
                    };
                    if let Err(err) = result {
                        warn!(shard_id = shard.0.id, error = %err, "recovery after invalid session failed");
                    }
                });
            }
            OpCode::Dispatch => {
                if let (Some(name), Some(d)) = (raw.t.as_deref(), raw.d) {
                    match name {
                        "READY" => {
                            let ready: ReadyData = serde_json::from_str(d.get())?;
                            self.handle_ready(ready);
                        }
                        "RESUMED" => {
                            info!(shard_id = self.0.id, "session resumed");
                            self.set_state(ShardState::Connected);
                            self.0.offline.drain();
                            self.0.waiters.resolve(WaiterKind::Resumed);
                            self.emit(ShardEvent::Resumed);
                        }
                        "GUILD_MEMBERS_CHUNK" => {
                            match serde_json::from_str::<GuildMembersChunk>(d.get()) {
                                Ok(chunk) => self.handle_members_chunk(chunk),
                                Err(err) => {
                                    warn!(shard_id = self.0.id, error = %err, "malformed member chunk");
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {
                trace!(shard_id = self.0.id, op = ?raw.op, "ignoring opcode");
            }
        }

        if let Some(seq) = raw.s {
            *self.0.sequence.write() = Some(seq);
        }

        let data = raw.d.and_then(|d| serde_json::from_str(d.get()).ok());
        self.emit(ShardEvent::Message(GatewayMessage {
            op: raw.op,
            seq: raw.s,
            name: raw.t,
            data,
        }));

        Ok(())
    }

    fn handle_hello(&self, hello: &Hello) {
        self.0.heart.set_interval(hello.heartbeat_interval);

        if matches!(self.state(), ShardState::Disconnected | ShardState::Offline) {
            self.set_state(ShardState::Unidentified);
        }

        // A resumed connection keeps its bucket; otherwise renegotiate the
        // safe rate, keeping whoever is parked.
        if self.state() != ShardState::Resuming {
            let safe = bucket::safe_commands_per_interval(hello.heartbeat_interval);
            debug!(shard_id = self.0.id, safe, "rebuilding command bucket");
            self.0.bucket.rebuild(safe, safe, bucket::REFILL_INTERVAL);
        }

        self.start_heartbeating(hello.heartbeat_interval);
    }

    fn handle_ready(&self, ready: ReadyData) {
        info!(shard_id = self.0.id, session_id = %ready.session_id, "shard ready");
        *self.0.session.write() = Some(Session {
            session_id: ready.session_id,
            resume_gateway_url: ready.resume_gateway_url,
        });
        self.set_state(ShardState::Connected);
        self.0.offline.drain();
        self.0.waiters.resolve(WaiterKind::Ready);
    }

    /// Schedule the jittered first beat; the steady interval starts once it
    /// fires.
    fn start_heartbeating(&self, interval_ms: u64) {
        self.stop_heartbeat();

        let delay = ratelimit::first_beat_delay(interval_ms);
        trace!(
            shard_id = self.0.id,
            delay_ms = delay.as_millis() as u64,
            "scheduling first heartbeat"
        );

        let shard = self.clone();
        let jitter = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !shard.is_open() {
                return;
            }

            shard.beat().await;

            let interval = shard.0.heart.interval();
            let steady_shard = shard.clone();
            let steady = tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    ticker.tick().await;
                    if !steady_shard.is_open() {
                        continue;
                    }

                    if !steady_shard.0.heart.acknowledged() {
                        warn!(
                            shard_id = steady_shard.0.id,
                            "heartbeat went unacknowledged, assuming zombied connection"
                        );
                        let zombie = steady_shard.clone();
                        tokio::spawn(async move {
                            zombie
                                .close(ShardCloseCode::ZombiedConnection, "zombied connection")
                                .await;
                            if let Err(err) = zombie.identify().await {
                                warn!(shard_id = zombie.0.id, error = %err, "re-identify after zombied connection failed");
                            }
                        });
                        return;
                    }

                    steady_shard.beat().await;
                }
            });
            shard.0.timers.lock().steady = Some(steady);
        });
        self.0.timers.lock().jitter = Some(jitter);
    }

    /// Abort both heartbeat timers. Synchronous, so a close never races a
    /// beat onto a dying socket.
    fn stop_heartbeat(&self) {
        let mut timers = self.0.timers.lock();
        if let Some(handle) = timers.jitter.take() {
            handle.abort();
        }
        if let Some(handle) = timers.steady.take() {
            handle.abort();
        }
    }

    async fn beat(&self) {
        let seq = self.sequence();
        trace!(shard_id = self.0.id, seq = ?seq, "sending heartbeat");
        if self.send_direct(payload::heartbeat_json(seq)).await {
            self.0.heart.mark_sent();
            self.emit(ShardEvent::Heartbeat);
        }
    }
}

// `connect` lives in its own module so the compiler can resolve the hidden
// type of its opaque `async fn` future independently of the other shard
// methods that call it (and that it transitively spawns back into via the
// reader task), avoiding a recursive-opaque-type cycle in Send inference.
mod connect_impl {
    use super::*;

    impl Shard {
        /// Open the WebSocket and start the reader task.
        pub async fn connect(&self) -> Result<(), GatewayError> {
            if self.0.shutdown.load(Ordering::SeqCst) {
                return Err(GatewayError::Shutdown);
            }

            if !matches!(self.state(), ShardState::Identifying | ShardState::Resuming) {
                self.set_state(ShardState::Connecting);
                self.emit(ShardEvent::Connecting);
            }

            let url = self.gateway_url()?;
            debug!(shard_id = self.0.id, url = %url, "connecting to gateway");

            let (stream, _response) = connect_async(url.as_str()).await?;
            let (sink, read) = stream.split();

            self.0.inflater.lock().reset();
            self.0.heart.reset();
            *self.0.socket.lock().await = Some(sink);
            self.0.socket_open.store(true, Ordering::SeqCst);

            let reader = {
                let shard = self.clone();
                tokio::spawn(async move { shard.read_loop(read).await })
            };
            if let Some(old) = self.0.reader.lock().replace(reader) {
                old.abort();
            }

            // A shutdown that raced the dial wins; release the fresh socket.
            if self.0.shutdown.load(Ordering::SeqCst) {
                self.close(ShardCloseCode::Shutdown, "shutting down").await;
                self.set_state(ShardState::Offline);
                return Err(GatewayError::Shutdown);
            }

            if !matches!(self.state(), ShardState::Identifying | ShardState::Resuming) {
                self.set_state(ShardState::Unidentified);
            }
            self.emit(ShardEvent::Connected);

            Ok(())
        }
    }
}
