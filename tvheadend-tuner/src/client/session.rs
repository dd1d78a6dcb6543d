//! HTSP connection session.
//!
//! One [`HtspSession`] owns at most one live connection to the backend. The
//! connection is opened lazily by [`HtspSession::ensure_connection`], which
//! runs the handshake and waits for the initial catalog push. A background
//! task reads frames and routes them: replies to the correlator, pushes to
//! the channel directory. When the socket fails the session falls back to
//! `Disconnected`, every pending request fails with `ConnectionLost`, and the
//! next `ensure_connection` reconnects.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use htsp_protocol::{encode_message, Message, ProtocolError, Value, HTSP_VERSION};

use crate::client::codec::HtspCodec;
use crate::client::correlator::Correlator;
use crate::client::keepalive;
use crate::config::SessionConfig;
use crate::directory::ChannelDirectory;
use crate::error::HtspError;
use crate::host::types::ChannelDescriptor;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
}

/// What the backend announced in its `hello` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub server_name: String,
    pub server_version: String,
    pub htsp_version: i64,
    /// `min(client, server)` protocol version.
    pub negotiated_version: i64,
    pub capabilities: Vec<String>,
}

impl ServerInfo {
    fn from_hello(reply: &Message) -> Self {
        let htsp_version = reply.opt_i64("htspversion").unwrap_or(0);
        Self {
            server_name: reply.opt_str("servername").unwrap_or("unknown").to_string(),
            server_version: reply.opt_str("serverversion").unwrap_or("unknown").to_string(),
            htsp_version,
            negotiated_version: htsp_version.min(HTSP_VERSION),
            capabilities: reply
                .list_or_empty("servercapability")
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Partial result handed back by a chunk handler.
pub enum Chunk<T> {
    /// The backend will send more chunks for this request.
    More(Vec<T>),
    /// Final chunk.
    Done(Vec<T>),
}

/// Handles for one physical connection.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) generation: u64,
    /// Encoded frames for the writer.
    tx: mpsc::UnboundedSender<Bytes>,
    correlator: Arc<Correlator>,
    pub(crate) closed: CancellationToken,
}

impl Link {
    /// Send one request on this connection and wait for its reply.
    pub(crate) async fn request(&self, mut msg: Message, deadline: Instant) -> Result<Message, HtspError> {
        let (seq, rx) = self.correlator.register()?;
        let _pending = self.correlator.guard(seq);
        msg.set_seq(seq);
        let frame = encode_message(&msg)?;
        trace!("-> {} seq={}", msg.method().unwrap_or("?"), seq);
        self.tx.send(frame).map_err(|_| HtspError::ConnectionLost)?;

        match timeout_at(deadline, rx).await {
            Err(_) => Err(HtspError::Timeout),
            Ok(Err(_)) => Err(HtspError::ConnectionLost),
            Ok(Ok(reply)) => check_reply(reply?),
        }
    }

    async fn request_chunked<T, F>(
        &self,
        mut msg: Message,
        mut handler: F,
        max_chunks: usize,
        deadline: Instant,
    ) -> Result<Vec<T>, HtspError>
    where
        F: FnMut(Message) -> Result<Chunk<T>, HtspError> + Send,
        T: Send,
    {
        let (seq, mut rx) = self.correlator.register_stream()?;
        let _pending = self.correlator.guard(seq);
        msg.set_seq(seq);
        let frame = encode_message(&msg)?;
        trace!("-> {} seq={} (chunked)", msg.method().unwrap_or("?"), seq);
        self.tx.send(frame).map_err(|_| HtspError::ConnectionLost)?;

        let mut items = Vec::new();
        let mut chunks = 0usize;
        loop {
            let reply = match timeout_at(deadline, rx.recv()).await {
                Err(_) => return Err(HtspError::Timeout),
                Ok(None) => return Err(HtspError::ConnectionLost),
                Ok(Some(reply)) => check_reply(reply?)?,
            };
            chunks += 1;
            match handler(reply)? {
                Chunk::Done(batch) => {
                    items.extend(batch);
                    return Ok(items);
                }
                Chunk::More(batch) => {
                    items.extend(batch);
                    if chunks >= max_chunks {
                        return Err(ProtocolError::TooManyChunks(max_chunks).into());
                    }
                }
            }
        }
    }
}

const ACCESS_DENIED: &str = "access denied";

/// Turn backend error replies into errors.
fn check_reply(reply: Message) -> Result<Message, HtspError> {
    if let Some(error) = reply.error() {
        return Err(HtspError::Backend(error.to_string()));
    }
    if reply.flag("noaccess") {
        return Err(HtspError::Backend(ACCESS_DENIED.to_string()));
    }
    Ok(reply)
}

/// During the handshake a `noaccess` reply means the credentials are missing
/// or insufficient.
fn denied_as_auth(e: HtspError) -> HtspError {
    match e {
        HtspError::Backend(reason) if reason == ACCESS_DENIED => HtspError::Authentication(reason),
        e => e,
    }
}

/// `SHA1(password || challenge)`.
fn auth_digest(password: &str, challenge: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    hasher.finalize().to_vec()
}

/// Resets a failed or abandoned connection attempt.
struct AttemptGuard<'a> {
    session: &'a HtspSession,
    closed: CancellationToken,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.closed.cancel();
            self.session.set_state(SessionState::Disconnected);
        }
    }
}

/// A persistent, authenticated, multiplexed HTSP session for one tuner.
pub struct HtspSession {
    config: SessionConfig,
    state: Mutex<SessionState>,
    link: Mutex<Option<Link>>,
    /// Serializes connection attempts.
    connect_lock: tokio::sync::Mutex<()>,
    completed_attempts: AtomicU64,
    last_outcome: Mutex<Option<Result<(), HtspError>>>,
    next_seq: Arc<AtomicU32>,
    next_generation: AtomicU64,
    directory: Arc<ChannelDirectory>,
    server_info: Mutex<Option<ServerInfo>>,
}

impl HtspSession {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(SessionState::Disconnected),
            link: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            completed_attempts: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
            next_seq: Arc::new(AtomicU32::new(1)),
            next_generation: AtomicU64::new(0),
            directory: Arc::new(ChannelDirectory::new()),
            server_info: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            trace!("[HTSP {}] {:?} -> {:?}", self.config.label, *current, state);
            *current = state;
        }
    }

    /// HTTP base URL used to build stream and icon URLs.
    pub fn http_base_url(&self) -> &str {
        &self.config.http_base_url
    }

    pub fn directory(&self) -> &Arc<ChannelDirectory> {
        &self.directory
    }

    /// Server details from the most recent handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().clone()
    }

    fn ready_link(&self) -> Option<Link> {
        self.link
            .lock()
            .as_ref()
            .filter(|link| !link.closed.is_cancelled())
            .cloned()
    }

    /// Make sure the session is `Ready`, connecting if needed.
    ///
    /// Concurrent callers share one attempt: whoever waits while another
    /// caller's attempt completes takes that attempt's outcome instead of
    /// opening a second socket.
    pub async fn ensure_connection(self: &Arc<Self>, deadline: Instant) -> Result<(), HtspError> {
        if self.ready_link().is_some() {
            return Ok(());
        }

        let observed = self.completed_attempts.load(Ordering::Acquire);
        let _attempt = timeout_at(deadline, self.connect_lock.lock())
            .await
            .map_err(|_| HtspError::Timeout)?;

        if self.ready_link().is_some() {
            return Ok(());
        }
        if self.completed_attempts.load(Ordering::Acquire) != observed {
            let last = self.last_outcome.lock().clone();
            if let Some(Err(e)) = last {
                debug!("[HTSP {}] Joined failed connection attempt: {}", self.config.label, e);
                return Err(e);
            }
        }

        let outcome = self.connect(deadline).await;
        *self.last_outcome.lock() = Some(outcome.clone());
        self.completed_attempts.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn connect(self: &Arc<Self>, deadline: Instant) -> Result<(), HtspError> {
        let label = &self.config.label;
        let addr = &self.config.htsp_addr;
        let closed = CancellationToken::new();
        let mut guard = AttemptGuard {
            session: self.as_ref(),
            closed: closed.clone(),
            armed: true,
        };

        self.set_state(SessionState::Connecting);
        info!("[HTSP {}] Connecting to {}...", label, addr);

        let connect_deadline = deadline.min(Instant::now() + self.config.connect_timeout);
        let stream = match timeout_at(connect_deadline, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("[HTSP {}] Connect to {} failed: {}", label, addr, e);
                return Err(HtspError::Connection(format!("{}: {}", addr, e)));
            }
            Err(_) if connect_deadline == deadline => return Err(HtspError::Timeout),
            Err(_) => {
                warn!("[HTSP {}] Connect to {} timed out", label, addr);
                return Err(HtspError::Connection(format!("{}: connect timed out", addr)));
            }
        };
        stream.set_nodelay(true)?;
        debug!("[HTSP {}] TCP connection established", label);

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let correlator = Arc::new(Correlator::new(Arc::clone(&self.next_seq)));
        let (tx, out_rx) = mpsc::unbounded_channel();
        let link = Link {
            generation,
            tx,
            correlator: Arc::clone(&correlator),
            closed: closed.clone(),
        };

        self.directory.reset();
        tokio::spawn(connection_loop(
            Arc::downgrade(self),
            label.clone(),
            generation,
            Framed::new(stream, HtspCodec),
            out_rx,
            correlator,
            Arc::clone(&self.directory),
            closed.clone(),
        ));

        self.set_state(SessionState::Authenticating);
        self.handshake(&link, deadline).await?;

        {
            let mut slot = self.link.lock();
            if closed.is_cancelled() {
                return Err(HtspError::ConnectionLost);
            }
            *slot = Some(link.clone());
            self.set_state(SessionState::Ready);
        }
        guard.armed = false;

        info!(
            "[HTSP {}] Ready ({} channels)",
            label,
            self.directory.channel_count()
        );
        tokio::spawn(keepalive::keepalive_loop(
            Arc::downgrade(self),
            link,
            self.config.keepalive_interval,
        ));
        Ok(())
    }

    async fn handshake(&self, link: &Link, deadline: Instant) -> Result<(), HtspError> {
        let label = &self.config.label;

        let hello = Message::request("hello")
            .with("htspversion", HTSP_VERSION)
            .with("clientname", self.config.client_name.as_str())
            .with("clientversion", env!("CARGO_PKG_VERSION"));
        let reply = link.request(hello, deadline).await?;
        let info = ServerInfo::from_hello(&reply);
        info!(
            "[HTSP {}] Connected to {} {} (HTSP v{})",
            label, info.server_name, info.server_version, info.htsp_version
        );
        *self.server_info.lock() = Some(info);

        if let Some(username) = &self.config.username {
            let mut auth = Message::request("authenticate").with("username", username.as_str());
            if let Some(challenge) = reply.opt_bin("challenge") {
                let password = self.config.password.as_deref().unwrap_or_default();
                auth.put("digest", auth_digest(password, challenge));
            }
            match link.request(auth, deadline).await {
                Ok(_) => debug!("[HTSP {}] Authenticated as '{}'", label, username),
                Err(HtspError::Backend(reason)) => {
                    warn!("[HTSP {}] Authentication failed for '{}': {}", label, username, reason);
                    return Err(HtspError::Authentication(reason));
                }
                Err(e) => return Err(e),
            }
        }

        let enable = Message::request("enableAsyncMetadata").with("epg", 0);
        if let Err(e) = link.request(enable, deadline).await {
            let e = denied_as_auth(e);
            if let HtspError::Authentication(reason) = &e {
                warn!("[HTSP {}] Backend refused metadata: {}", label, reason);
            }
            return Err(e);
        }

        tokio::select! {
            _ = self.directory.wait_for_initial_sync() => Ok(()),
            _ = link.closed.cancelled() => Err(HtspError::ConnectionLost),
            _ = tokio::time::sleep_until(deadline) => Err(HtspError::Timeout),
        }
    }

    /// Send a request and wait for its reply.
    ///
    /// The session must be `Ready`. Backend error replies surface as
    /// [`HtspError::Backend`]; a timeout abandons only this request.
    pub async fn send(&self, msg: Message, deadline: Instant) -> Result<Message, HtspError> {
        let link = self.ready_link().ok_or(HtspError::ConnectionLost)?;
        link.request(msg, deadline).await
    }

    /// Send a request whose reply may arrive in several chunks sharing one
    /// sequence number. `handler` folds each chunk and says whether more are
    /// expected; at most `max_chunks` chunks are accepted.
    pub async fn send_streaming<T, F>(
        &self,
        msg: Message,
        handler: F,
        max_chunks: usize,
        deadline: Instant,
    ) -> Result<Vec<T>, HtspError>
    where
        F: FnMut(Message) -> Result<Chunk<T>, HtspError> + Send,
        T: Send,
    {
        let link = self.ready_link().ok_or(HtspError::ConnectionLost)?;
        link.request_chunked(msg, handler, max_chunks, deadline).await
    }

    /// Snapshot of the channel catalog with ids scoped to this session's
    /// tuner. No network round trip.
    pub fn build_channel_infos(&self) -> Vec<ChannelDescriptor> {
        self.directory
            .build_channel_infos(&self.config.label, &self.config.http_base_url)
    }

    /// Tear down the connection of `generation` if it is still current.
    pub(crate) fn teardown(&self, generation: u64, reason: &str) {
        let link = {
            let mut slot = self.link.lock();
            match slot.as_ref() {
                Some(link) if link.generation == generation => {
                    let link = slot.take();
                    self.set_state(SessionState::Disconnected);
                    link
                }
                _ => None,
            }
        };

        if let Some(link) = link {
            warn!("[HTSP {}] Connection lost: {}", self.config.label, reason);
            let failed = link.correlator.fail_all(HtspError::ConnectionLost);
            if failed > 0 {
                debug!("[HTSP {}] Failed {} pending request(s)", self.config.label, failed);
            }
            link.closed.cancel();
        }
    }

    /// Close the connection and fail pending requests. The session can
    /// still reconnect afterwards.
    pub fn dispose(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            info!("[HTSP {}] Closing connection", self.config.label);
            link.correlator.fail_all(HtspError::ConnectionLost);
            link.closed.cancel();
        }
        self.set_state(SessionState::Disconnected);
    }
}

impl Drop for HtspSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.closed.cancel();
        }
    }
}

/// Background task owning the socket of one connection.
#[allow(clippy::too_many_arguments)]
async fn connection_loop(
    session: Weak<HtspSession>,
    label: String,
    generation: u64,
    mut framed: Framed<TcpStream, HtspCodec>,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    correlator: Arc<Correlator>,
    directory: Arc<ChannelDirectory>,
    closed: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            _ = closed.cancelled() => break "closed".to_string(),

            Some(frame) = out_rx.recv() => {
                if let Err(e) = framed.send(frame).await {
                    break format!("write failed: {}", e);
                }
            }

            frame = framed.next() => match frame {
                Some(Ok(msg)) => dispatch(&label, &correlator, &directory, msg),
                Some(Err(e)) => {
                    warn!("[HTSP {}] Dropping connection on read error: {}", label, e);
                    break e.to_string();
                }
                None => break "connection closed by server".to_string(),
            },
        }
    };

    debug!("[HTSP {}] Connection loop exiting: {}", label, reason);
    correlator.fail_all(HtspError::ConnectionLost);
    closed.cancel();
    if let Some(session) = session.upgrade() {
        session.teardown(generation, &reason);
    }
}

/// Route one inbound message.
fn dispatch(label: &str, correlator: &Correlator, directory: &ChannelDirectory, msg: Message) {
    if let Some(seq) = msg.seq() {
        trace!("[HTSP {}] <- reply seq={}", label, seq);
        if !correlator.resolve(seq, msg) {
            debug!("[HTSP {}] Discarding reply for unknown seq {}", label, seq);
        }
        return;
    }

    match msg.method() {
        Some(method) => match directory.apply_push(method, &msg) {
            Ok(true) => {}
            Ok(false) => debug!("[HTSP {}] Ignoring push '{}'", label, method),
            Err(e) => warn!("[HTSP {}] Bad '{}' push: {}", label, method, e),
        },
        None => debug!("[HTSP {}] Discarding message without seq or method", label),
    }
}
