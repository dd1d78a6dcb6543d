//! Scriptable HTSP backend for tests.
//!
//! Speaks the real wire codec over loopback TCP. The built-in behaviour covers
//! the handshake (`hello` with a challenge, digest checked `authenticate`,
//! `enableAsyncMetadata` followed by the catalog push) and `getSysTime`;
//! everything else goes to the test's responder. When credentials are set,
//! `enableAsyncMetadata` on a connection that has not authenticated is
//! answered with `noaccess`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use htsp_protocol::{Message, Value};

use crate::client::HtspCodec;
use crate::config::{SessionConfig, TunerHostInfo, TvheadendOptions};

pub(crate) const CHALLENGE: &[u8] = b"0123456789abcdef0123456789abcdef";

/// What the backend does with one request.
pub(crate) enum Scripted {
    /// Reply immediately; every message gets the request's `seq`.
    Reply(Vec<Message>),
    /// Reply after a pause, without holding up other requests.
    Delayed(Duration, Vec<Message>),
    /// Never answer.
    Silent,
    /// Write these bytes to the socket verbatim.
    Raw(Vec<u8>),
    /// Drop the connection.
    Close,
}

type Responder = Arc<dyn Fn(&Message) -> Option<Scripted> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct MockOptions {
    pub credentials: Option<(String, String)>,
    pub channels: Vec<Message>,
    pub tags: Vec<Message>,
    pub responder: Responder,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            channels: Vec::new(),
            tags: Vec::new(),
            responder: Arc::new(|_| None),
        }
    }
}

impl MockOptions {
    pub fn with_channels(mut self, channels: Vec<Message>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_tags(mut self, tags: Vec<Message>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn with_responder(
        mut self,
        responder: impl Fn(&Message) -> Option<Scripted> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Arc::new(responder);
        self
    }
}

struct Shared {
    options: MockOptions,
    accepted: AtomicUsize,
    requests: Mutex<Vec<Message>>,
    kill: Mutex<CancellationToken>,
}

pub(crate) struct MockBackend {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl MockBackend {
    pub async fn start(options: MockOptions) -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            options,
            accepted: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            kill: Mutex::new(CancellationToken::new()),
        });
        let shutdown = CancellationToken::new();

        let accept_shared = Arc::clone(&shared);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                        let kill = accept_shared.kill.lock().clone();
                        tokio::spawn(serve(Arc::clone(&accept_shared), stream, kill));
                    }
                }
            }
        });

        Self {
            addr,
            shared,
            shutdown,
        }
    }

    /// Tuner configuration pointing at this backend.
    pub fn tuner(&self, id: &str) -> TunerHostInfo {
        let mut options = TvheadendOptions {
            htsp_port: self.addr.port(),
            connect_timeout_secs: 2,
            ..Default::default()
        };
        if let Some((user, pass)) = &self.shared.options.credentials {
            options.username = Some(user.clone());
            options.password = Some(pass.clone());
        }
        TunerHostInfo::new(id, "http://127.0.0.1:9981").with_options(options)
    }

    pub fn session_config(&self, id: &str) -> SessionConfig {
        SessionConfig::from_tuner(&self.tuner(id)).unwrap()
    }

    /// Number of TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Every request received, across connections, in arrival order.
    pub fn requests(&self, method: &str) -> Vec<Message> {
        self.shared
            .requests
            .lock()
            .iter()
            .filter(|m| m.method() == Some(method))
            .cloned()
            .collect()
    }

    /// Close every open connection from the server side.
    pub fn drop_connections(&self) {
        let mut kill = self.shared.kill.lock();
        kill.cancel();
        *kill = CancellationToken::new();
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.shared.kill.lock().cancel();
    }
}

async fn serve(shared: Arc<Shared>, stream: TcpStream, kill: CancellationToken) {
    let mut framed = Framed::new(stream, HtspCodec);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let mut authenticated = false;

    loop {
        tokio::select! {
            _ = kill.cancelled() => break,
            Some(msg) = out_rx.recv() => {
                if framed.send(msg).await.is_err() {
                    break;
                }
            }
            frame = framed.next() => {
                let Some(Ok(request)) = frame else { break };
                shared.requests.lock().push(request.clone());
                let allowed = authenticated || shared.options.credentials.is_none();
                match handle(&shared, &request, &mut authenticated) {
                    Scripted::Reply(msgs) => {
                        for msg in with_seq(&request, msgs) {
                            let _ = out_tx.send(msg);
                        }
                    }
                    Scripted::Delayed(pause, msgs) => {
                        let tx = out_tx.clone();
                        let msgs = with_seq(&request, msgs);
                        tokio::spawn(async move {
                            tokio::time::sleep(pause).await;
                            for msg in msgs {
                                let _ = tx.send(msg);
                            }
                        });
                    }
                    Scripted::Silent => {}
                    Scripted::Raw(bytes) => {
                        if framed.get_mut().write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Scripted::Close => break,
                }
                if request.method() == Some("enableAsyncMetadata") && allowed {
                    for push in catalog_push(&shared.options) {
                        let _ = out_tx.send(push);
                    }
                }
            }
        }
    }
}

fn with_seq(request: &Message, msgs: Vec<Message>) -> Vec<Message> {
    msgs.into_iter()
        .map(|mut msg| {
            if let Some(seq) = request.seq() {
                msg.set_seq(seq);
            }
            msg
        })
        .collect()
}

fn handle(shared: &Shared, request: &Message, authenticated: &mut bool) -> Scripted {
    if let Some(scripted) = (shared.options.responder)(request) {
        return scripted;
    }

    let reply = match request.method().unwrap_or_default() {
        "hello" => Message::new()
            .with("htspversion", 25)
            .with("servername", "Tvheadend")
            .with("serverversion", "4.3-mock")
            .with("challenge", CHALLENGE.to_vec())
            .with(
                "servercapability",
                vec![Value::from("timeshift"), Value::from("imagecache")],
            ),
        "authenticate" => match &shared.options.credentials {
            Some((user, pass)) => {
                let digest = Sha1::new()
                    .chain_update(pass.as_bytes())
                    .chain_update(CHALLENGE)
                    .finalize()
                    .to_vec();
                let ok = request.opt_str("username") == Some(user.as_str())
                    && request.opt_bin("digest") == Some(digest.as_slice());
                if ok {
                    *authenticated = true;
                    Message::new()
                } else {
                    Message::new().with("noaccess", 1)
                }
            }
            None => Message::new(),
        },
        "enableAsyncMetadata" if shared.options.credentials.is_some() && !*authenticated => {
            Message::new().with("noaccess", 1)
        }
        "enableAsyncMetadata" => Message::new(),
        "getSysTime" => Message::new()
            .with("time", 1_700_000_000i64)
            .with("timezone", 0),
        other => Message::new().with("error", format!("Unknown method '{}'", other)),
    };
    Scripted::Reply(vec![reply])
}

fn catalog_push(options: &MockOptions) -> Vec<Message> {
    let mut pushes = Vec::new();
    for tag in &options.tags {
        pushes.push(tag.clone().with("method", "tagAdd"));
    }
    for channel in &options.channels {
        pushes.push(channel.clone().with("method", "channelAdd"));
    }
    pushes.push(Message::request("initialSyncCompleted"));
    pushes
}

/// A channel tag as the backend pushes it.
pub(crate) fn tag(id: u32, name: &str, members: &[u32]) -> Message {
    Message::new()
        .with("tagId", id)
        .with("tagName", name)
        .with("members", members.iter().map(|m| Value::from(*m)).collect::<Vec<_>>())
}

/// A channel record as the backend pushes it.
pub(crate) fn channel(id: u32, name: &str, number: u32) -> Message {
    Message::new()
        .with("channelId", id)
        .with("channelName", name)
        .with("channelNumber", number)
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
