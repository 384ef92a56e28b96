// WebSocket front door. One accept loop per node, one read task and one
// writer task per connection, STOMP frames carried in WS text messages.
// The connection registry doubles as the local delivery sink for the
// router and the inbox consumer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::auth::{IdentityResolver, bearer_token};
use super::broker::InboxTransport;
use super::collab::{MessageStore, RoomDirectory, UserDirectory};
use super::delivery::LocalSink;
use super::error::{RelayError, Result};
use super::lifecycle::{FrameDisposition, LifecycleHandler};
use super::metrics::RelayMetrics;
use super::notifier::CrossInstanceNotifier;
use super::payload::{CHAT_SEND_DESTINATION, ChatSend};
use super::router::MessageRouter;
use super::session::{Session, SessionState};
use super::stomp::{Command, Frame, FrameCodec, StompEvent};
use super::store::{PRESENCE_TTL, SharedStore};

/// Writer coalescing cap per wakeup.
const MAX_WRITE_BATCH: u32 = 64;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Default server heartbeat interval; clients idle past twice this are
/// closed.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub instance_id: String,
    pub presence_ttl: Duration,
    pub heartbeat: Duration,
}

impl RelayConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            presence_ttl: PRESENCE_TTL,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection registry
// ---------------------------------------------------------------------------

struct ConnectionHandle {
    session: Arc<Session>,
    tx: mpsc::UnboundedSender<Message>,
}

/// Live local connections keyed by user id.
pub struct Registry {
    connections: DashMap<String, ConnectionHandle>,
}

impl Registry {
    fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    fn register(&self, user_id: &str, handle: ConnectionHandle) {
        if let Some(old) = self.connections.insert(user_id.to_string(), handle) {
            // Same user reconnected here before the old socket died.
            debug!(
                "[relay-ws] replacing connection for {user_id} (session {})",
                old.session.id()
            );
        }
    }

    /// Remove the user's entry only if it still belongs to this session;
    /// a newer connection's registration stays untouched.
    fn unregister(&self, user_id: &str, session_id: &str) {
        self.connections
            .remove_if(user_id, |_, handle| handle.session.id() == session_id);
    }

    pub fn connected_users(&self) -> usize {
        self.connections.len()
    }
}

impl LocalSink for Registry {
    fn deliver(&self, user_id: &str, destination: &str, body: &str) {
        let Some(handle) = self.connections.get(user_id) else {
            debug!("[relay-ws] no live connection for {user_id}, delivery skipped");
            return;
        };
        let Some(subscription) = handle.session.subscription_id(destination) else {
            debug!("[relay-ws] {user_id} not subscribed to {destination}, delivery skipped");
            return;
        };
        let message_id = Uuid::new_v4().to_string();
        let frame = Frame::message(destination, &subscription, &message_id, body);
        let _ = handle.tx.send(Message::Text(frame.encode_string()));
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One relay instance: server loop plus the routing machinery wired to
/// its collaborators.
pub struct RelayNode {
    config: RelayConfig,
    registry: Arc<Registry>,
    identity: Arc<dyn IdentityResolver>,
    lifecycle: LifecycleHandler,
    router: MessageRouter,
    notifier: CrossInstanceNotifier,
    broker: Arc<dyn InboxTransport>,
    metrics: Arc<RelayMetrics>,
    shutdown: CancellationToken,
}

impl RelayNode {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn SharedStore>,
        identity: Arc<dyn IdentityResolver>,
        users: Arc<dyn UserDirectory>,
        rooms: Arc<dyn RoomDirectory>,
        messages: Arc<dyn MessageStore>,
        broker: Arc<dyn InboxTransport>,
    ) -> Arc<Self> {
        let metrics = Arc::new(RelayMetrics::new());
        let registry = Arc::new(Registry::new());
        let lifecycle = LifecycleHandler::new(
            store.clone(),
            rooms,
            config.instance_id.as_str(),
            config.presence_ttl,
        );
        let router = MessageRouter::new(
            store.clone(),
            users,
            messages,
            broker.clone(),
            registry.clone(),
            config.instance_id.as_str(),
            metrics.clone(),
        );
        let notifier = CrossInstanceNotifier::new(
            store,
            broker.clone(),
            config.instance_id.as_str(),
            metrics.clone(),
        );
        Arc::new(Self {
            config,
            registry,
            identity,
            lifecycle,
            router,
            notifier,
            broker,
            metrics,
            shutdown: CancellationToken::new(),
        })
    }

    /// Declare the inbox, bind the listener, and spawn the accept loop.
    /// Returns the bound address so `:0` binds are test-friendly.
    pub async fn start(self: &Arc<Self>, bind: &str) -> Result<SocketAddr> {
        self.notifier
            .ensure_started(self.registry.clone(), self.shutdown.child_token())
            .await?;

        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        info!(
            "[relay-ws] instance {} listening on {addr}",
            self.config.instance_id
        );

        let node = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tune_socket(&stream);
                            let node = node.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, peer, node).await;
                            });
                        }
                        Err(e) => warn!("[relay-ws] accept error: {e}"),
                    },
                }
            }
            debug!("[relay-ws] accept loop stopped");
        });

        let node = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(STATS_INTERVAL) => {
                        info!(
                            "[relay-ws] {} stats: {:?}",
                            node.config.instance_id,
                            node.metrics.snapshot()
                        );
                    }
                }
            }
        });

        Ok(addr)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.broker.shutdown();
    }

    pub fn notifier(&self) -> &CrossInstanceNotifier {
        &self.notifier
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn connected_users(&self) -> usize {
        self.registry.connected_users()
    }
}

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    let sock_ref = SockRef::from(stream);
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(stream: TcpStream, peer: SocketAddr, node: Arc<RelayNode>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("[relay-ws] handshake with {peer} failed: {e}");
            return;
        }
    };
    node.metrics.connections_opened.fetch_add(1, Ordering::Relaxed);
    debug!("[relay-ws] connection from {peer}");

    let session = Arc::new(Session::new());
    let (mut write_half, mut read_half) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: coalesce bursts into a single flush.
    let write_task = tokio::spawn(async move {
        'writer: while let Some(msg) = rx.recv().await {
            if write_half.feed(msg).await.is_err() {
                break;
            }
            let mut batched = 1u32;
            while batched < MAX_WRITE_BATCH {
                match rx.try_recv() {
                    Ok(msg) => {
                        if write_half.feed(msg).await.is_err() {
                            break 'writer;
                        }
                        batched += 1;
                    }
                    Err(_) => break,
                }
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
        let _ = write_half.close().await;
    });

    // Heartbeat task: bare newline every interval, close when the client
    // stays silent past twice the interval.
    let hb_cancel = node.shutdown.child_token();
    let hb_task = {
        let session = session.clone();
        let tx = tx.clone();
        let cancel = hb_cancel.clone();
        let metrics = node.metrics.clone();
        let interval = node.config.heartbeat;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Message::Close(None));
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if session.idle_for() > interval * 2 {
                            metrics.idle_disconnects.fetch_add(1, Ordering::Relaxed);
                            debug!("[relay-ws] idle session {} reaped", session.id());
                            let _ = tx.send(Message::Close(None));
                            break;
                        }
                        if tx.send(Message::Text("\n".into())).is_err() {
                            break;
                        }
                        metrics.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
    };

    let mut codec = FrameCodec::new();
    'read: while let Some(next) = read_half.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                debug!("[relay-ws] read error from {peer}: {e}");
                break;
            }
        };
        session.touch();
        match msg {
            Message::Text(text) => codec.feed(text.as_bytes()),
            Message::Binary(data) => codec.feed(&data),
            Message::Close(_) => break,
            // Pings are answered by the transport; they only count as activity.
            _ => continue,
        }
        loop {
            match codec.decode_next() {
                Ok(Some(StompEvent::Frame(frame))) => {
                    if !dispatch_frame(&node, &session, &tx, frame).await {
                        break 'read;
                    }
                }
                Ok(Some(StompEvent::Heartbeat)) => {}
                Ok(None) => break,
                Err(e) => {
                    // Framing is gone; no recovery point in the byte stream.
                    node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("[relay-ws] protocol error from {peer}: {e}");
                    let _ = tx.send(Message::Text(Frame::error("malformed frame").encode_string()));
                    let _ = tx.send(Message::Close(None));
                    break 'read;
                }
            }
        }
    }

    // Teardown. A live session that never said DISCONNECT still owes cleanup.
    if session.mark_disconnected()
        && let Some(user_id) = session.user_id()
    {
        node.registry.unregister(user_id, session.id());
        if let Err(e) = node.lifecycle.on_disconnect(user_id).await {
            warn!("[relay-ws] disconnect cleanup for {user_id} failed: {e}");
        }
    }
    hb_cancel.cancel();
    drop(tx);
    let _ = hb_task.await;
    let _ = write_task.await;
    node.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
    debug!("[relay-ws] {peer} closed");
}

/// Returns `false` when the connection should stop reading.
async fn dispatch_frame(
    node: &Arc<RelayNode>,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<Message>,
    frame: Frame,
) -> bool {
    node.metrics.frames_in.fetch_add(1, Ordering::Relaxed);
    match frame.command {
        Command::Connect => handle_connect(node, session, tx, &frame).await,
        Command::Subscribe => {
            handle_subscribe(node, session, &frame);
            true
        }
        Command::Send => {
            handle_send(node, session, tx, &frame).await;
            true
        }
        Command::Disconnect => handle_disconnect(node, session, &frame).await,
        _ => {
            node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "[relay-ws] dropping unexpected {} frame",
                frame.command.name()
            );
            true
        }
    }
}

async fn handle_connect(
    node: &Arc<RelayNode>,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<Message>,
    frame: &Frame,
) -> bool {
    // A repeated CONNECT must leave no trace in the store, whatever token
    // it carries.
    if session.state() != SessionState::Handshaking {
        node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        debug!("[relay-ws] repeated connect on session {}", session.id());
        let reply = Frame::error("already connected");
        let _ = tx.send(Message::Text(reply.encode_string()));
        return true;
    }

    let user_id = match bearer_token(frame) {
        // No credential: the connection is served without identity.
        None => None,
        Some(token) => match node.identity.resolve(token).await {
            Ok(user_id) => Some(user_id),
            Err(e) => {
                debug!("[relay-ws] rejecting connect: {e}");
                let reply = Frame::error("authentication failed");
                let _ = tx.send(Message::Text(reply.encode_string()));
                let _ = tx.send(Message::Close(None));
                return false;
            }
        },
    };

    if node.lifecycle.intercept(frame, user_id.as_deref()).await == FrameDisposition::Dropped {
        // Presence never landed; the session stays in handshake so the
        // client may retry its CONNECT.
        node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        return true;
    }

    if let Err(e) = session.mark_connected(user_id.as_deref()) {
        node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        debug!("[relay-ws] connect on session {}: {e}", session.id());
        let _ = tx.send(Message::Text(Frame::error("already connected").encode_string()));
        return true;
    }

    if let Some(user_id) = session.user_id() {
        node.registry.register(
            user_id,
            ConnectionHandle {
                session: session.clone(),
                tx: tx.clone(),
            },
        );
        info!(
            "[relay-ws] {user_id} connected on {} (session {})",
            node.config.instance_id,
            session.id()
        );
    }

    let reply = Frame::connected(session.id(), node.config.heartbeat.as_millis() as u64);
    let _ = tx.send(Message::Text(reply.encode_string()));
    true
}

fn handle_subscribe(node: &Arc<RelayNode>, session: &Arc<Session>, frame: &Frame) {
    let (Some(destination), Some(id)) = (frame.header("destination"), frame.header("id")) else {
        node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        debug!("[relay-ws] subscribe missing destination or id");
        return;
    };
    if session.state() != SessionState::Connected {
        node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        debug!("[relay-ws] subscribe before connect dropped");
        return;
    }
    session.subscribe(destination, id);
    debug!(
        "[relay-ws] session {} subscribed {destination} as {id}",
        session.id()
    );
}

async fn handle_send(
    node: &Arc<RelayNode>,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<Message>,
    frame: &Frame,
) {
    if frame.header("destination") != Some(CHAT_SEND_DESTINATION) {
        node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        debug!("[relay-ws] send to unhandled destination dropped");
        return;
    }
    let Some(user_id) = session.user_id().map(str::to_string) else {
        node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        debug!("[relay-ws] anonymous send dropped");
        return;
    };
    let parsed = frame
        .body_str()
        .and_then(|body| serde_json::from_str::<ChatSend>(body).map_err(RelayError::from));
    let send = match parsed {
        Ok(send) => send,
        Err(e) => {
            node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("[relay-ws] malformed chat send from {user_id}: {e}");
            let reply = Frame::error("malformed chat payload");
            let _ = tx.send(Message::Text(reply.encode_string()));
            return;
        }
    };
    if let Err(e) = node.router.handle_chat_send(&user_id, send).await {
        warn!("[relay-ws] chat send from {user_id} failed: {e}");
        let reply = Frame::error("message not delivered");
        let _ = tx.send(Message::Text(reply.encode_string()));
    }
}

async fn handle_disconnect(node: &Arc<RelayNode>, session: &Arc<Session>, frame: &Frame) -> bool {
    let user_id = session.user_id().map(str::to_string);
    if node.lifecycle.intercept(frame, user_id.as_deref()).await == FrameDisposition::Dropped {
        // Cleanup failed; the frame is gone but the connection keeps serving.
        node.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        return true;
    }
    if session.mark_disconnected()
        && let Some(user_id) = user_id
    {
        node.registry.unregister(&user_id, session.id());
        info!(
            "[relay-ws] {user_id} disconnected from {}",
            node.config.instance_id
        );
    }
    false
}
