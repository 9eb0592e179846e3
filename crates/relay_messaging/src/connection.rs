//! Connection: one logical link to a peer hub.
//!
//! A [`Connection`] is a cheap, cloneable handle. The link itself is an
//! actor task that owns the state machine, the current transport and the
//! pending probes; transport events, timer expiries and handle requests all
//! reach it through channels and are processed one at a time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use relay_fsm::{ActionArg, ActionTable, Engine};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::MessagingError;
use crate::events::{EventBus, LifecycleEvent};
use crate::message::{Envelope, Frame, InboundMessage, identity_frame};
use crate::tables;
use crate::transport::{
    self, SignalSender, Transport, TransportEvent, TransportOptions, TransportSignal, WriteAck,
};

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepted by our listener.
    Inbound,
    /// Dialled by us via `add_client`.
    Outbound,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// State of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct LinkStatus {
    ready: ReadyState,
    peer_identity: Option<String>,
    state: String,
}

enum Input {
    Send {
        text: String,
        ack: WriteAck,
    },
    Probe {
        sent: WriteAck,
        pong: oneshot::Sender<()>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
    TimerExpired(u64),
    Shutdown,
}

struct Shared {
    id: Uuid,
    role: Role,
    server_url: Option<String>,
    created_at: DateTime<Utc>,
    status: RwLock<LinkStatus>,
    mailbox: mpsc::UnboundedSender<Input>,
}

/// Handle to a peer link.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.shared.status.read();
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("server_url", &self.shared.server_url)
            .field("peer_identity", &status.peer_identity)
            .field("state", &status.state)
            .finish()
    }
}

impl Connection {
    /// Dial `server_url` and keep reconnecting until [`close`](Self::close).
    pub(crate) fn dial(
        server_url: String,
        local_identity: String,
        bus: Arc<EventBus>,
        options: TransportOptions,
    ) -> Result<Self, MessagingError> {
        Self::spawn(Role::Outbound, Some(server_url), local_identity, bus, options, None)
    }

    /// Take over a socket accepted by the listener.
    pub(crate) fn accept(
        ws: WebSocketStream<TcpStream>,
        local_identity: String,
        bus: Arc<EventBus>,
        options: TransportOptions,
    ) -> Result<Self, MessagingError> {
        Self::spawn(Role::Inbound, None, local_identity, bus, options, Some(ws))
    }

    fn spawn(
        role: Role,
        server_url: Option<String>,
        local_identity: String,
        bus: Arc<EventBus>,
        options: TransportOptions,
        accepted: Option<WebSocketStream<TcpStream>>,
    ) -> Result<Self, MessagingError> {
        let spec = match role {
            Role::Inbound => tables::inbound()?,
            Role::Outbound => tables::outbound()?,
        };
        let engine = Engine::new(spec, action_table())?;

        let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
        let (signals, signals_rx) = mpsc::unbounded_channel();

        let handle = Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                role,
                server_url,
                created_at: Utc::now(),
                status: RwLock::new(LinkStatus {
                    ready: ReadyState::Closed,
                    peer_identity: None,
                    state: engine.current_state().to_string(),
                }),
                mailbox,
            }),
        };

        let mut link = Link {
            handle: handle.clone(),
            bus,
            local_identity,
            transport: None,
            generation: 0,
            signals,
            options,
            probes: HashMap::new(),
            last_probe_token: 0,
            last_peer: None,
        };
        if let Some(ws) = accepted {
            link.generation = 1;
            link.transport = Some(transport::attach(ws, 1, link.signals.clone(), options));
            link.set_ready(ReadyState::Open);
        }

        debug!("Spawning {role} connection {}", handle.shared.id);
        let actor = Actor {
            engine,
            link,
            mailbox: mailbox_rx,
            signals: signals_rx,
            close_waiters: Vec::new(),
            close_requested: false,
        };
        tokio::spawn(actor.run());
        Ok(handle)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Address this link dials. `None` for inbound links.
    pub fn server_url(&self) -> Option<&str> {
        self.shared.server_url.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    /// Identity the peer announced, cleared whenever the socket closes.
    pub fn peer_identity(&self) -> Option<String> {
        self.shared.status.read().peer_identity.clone()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.status.read().ready
    }

    /// True while the socket is open and the peer has identified itself.
    pub fn is_connected(&self) -> bool {
        let status = self.shared.status.read();
        status.ready == ReadyState::Open && status.peer_identity.is_some()
    }

    /// Name of the state the link's machine is in.
    pub fn current_state(&self) -> String {
        self.shared.status.read().state.clone()
    }

    /// True once the link has stopped for good.
    pub fn is_terminal(&self) -> bool {
        self.shared.mailbox.is_closed()
    }

    /// Serialize `envelope` and write it to the socket.
    ///
    /// Fails with [`MessagingError::NotConnected`] when no socket is open;
    /// the caller decides whether to retry.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), MessagingError> {
        let text = envelope.to_json()?;
        self.send_text(text).await
    }

    pub(crate) async fn send_text(&self, text: String) -> Result<(), MessagingError> {
        let (ack, done) = oneshot::channel();
        self.shared
            .mailbox
            .send(Input::Send { text, ack })
            .map_err(|_| MessagingError::ConnectionClosed)?;
        done.await
            .unwrap_or_else(|_| Err(MessagingError::Transport("socket closed before write".into())))
    }

    /// Send a liveness ping without waiting for the reply.
    pub async fn send_ping(&self) -> Result<(), MessagingError> {
        let (sent, sent_rx) = oneshot::channel();
        let (pong, _) = oneshot::channel();
        self.shared
            .mailbox
            .send(Input::Probe { sent, pong })
            .map_err(|_| MessagingError::ConnectionClosed)?;
        sent_rx
            .await
            .unwrap_or_else(|_| Err(MessagingError::Transport("socket closed before ping".into())))
    }

    /// Ping the peer with a unique token and wait up to `timeout` for the
    /// matching pong.
    pub async fn check_connectivity(&self, timeout: Duration) -> bool {
        let (sent, sent_rx) = oneshot::channel();
        let (pong, pong_rx) = oneshot::channel();
        if self.shared.mailbox.send(Input::Probe { sent, pong }).is_err() {
            return false;
        }

        let probe = async {
            matches!(sent_rx.await, Ok(Ok(()))) && pong_rx.await.is_ok()
        };
        tokio::time::timeout(timeout, probe).await.unwrap_or(false)
    }

    /// Ask the link to close gracefully.
    ///
    /// Outbound links drain to their terminal state and this waits for it.
    /// Inbound links have no caller-driven close and return immediately.
    pub async fn close(&self) {
        let (done, done_rx) = oneshot::channel();
        if self.shared.mailbox.send(Input::Close { done }).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Send the graceful close command without waiting for it to finish.
    pub(crate) fn request_close(&self) {
        let (done, _) = oneshot::channel();
        let _ = self.shared.mailbox.send(Input::Close { done });
    }

    /// Drop the socket and stop the link without running its machine.
    pub(crate) fn shutdown(&self) {
        let _ = self.shared.mailbox.send(Input::Shutdown);
    }

    fn status_mut(&self) -> parking_lot::RwLockWriteGuard<'_, LinkStatus> {
        self.shared.status.write()
    }

    /// A handle with no actor behind it, for routing tests.
    #[cfg(test)]
    pub(crate) fn stub(role: Role, peer_identity: Option<&str>, server_url: Option<&str>) -> Self {
        let (mailbox, _) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                role,
                server_url: server_url.map(str::to_string),
                created_at: Utc::now(),
                status: RwLock::new(LinkStatus {
                    ready: if peer_identity.is_some() {
                        ReadyState::Open
                    } else {
                        ReadyState::Connecting
                    },
                    peer_identity: peer_identity.map(str::to_string),
                    state: "waiting to ping".to_string(),
                }),
                mailbox,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// The action context: everything the state machine's actions touch.
struct Link {
    handle: Connection,
    bus: Arc<EventBus>,
    local_identity: String,
    transport: Option<Transport>,
    generation: u64,
    signals: SignalSender,
    options: TransportOptions,
    probes: HashMap<u64, oneshot::Sender<()>>,
    last_probe_token: u64,
    /// Survives socket closes so lifecycle events can name the peer.
    last_peer: Option<String>,
}

fn action_table() -> ActionTable<Link> {
    ActionTable::new()
        .bind(tables::SEND_IDENTITY, |link: &mut Link, _: &[ActionArg]| {
            link.send_identity()
        })
        .bind(tables::SEND_PING, |link: &mut Link, _: &[ActionArg]| {
            link.send_heartbeat()
        })
        .bind(tables::CLOSE_WEB_SOCKET, |link: &mut Link, _: &[ActionArg]| {
            link.close_web_socket()
        })
        .bind(tables::CREATE_WEB_SOCKET, |link: &mut Link, _: &[ActionArg]| {
            link.create_web_socket()
        })
        .bind(tables::EMIT, |link: &mut Link, args: &[ActionArg]| {
            let tag = args.first().and_then(ActionArg::as_str).unwrap_or_default();
            link.emit(tag)
        })
}

impl Link {
    fn id(&self) -> Uuid {
        self.handle.shared.id
    }

    fn set_ready(&self, ready: ReadyState) {
        self.handle.status_mut().ready = ready;
    }

    fn send_identity(&mut self) {
        let frame = match identity_frame(&self.local_identity) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] cannot encode identity frame: {e}", self.id());
                return;
            }
        };
        match &self.transport {
            Some(transport) => transport.send_text(frame, None),
            None => debug!("[{}] no socket to announce identity on", self.id()),
        }
    }

    fn send_heartbeat(&mut self) {
        if let Some(transport) = &self.transport {
            transport.ping(Vec::new(), None);
        }
    }

    fn close_web_socket(&mut self) {
        match &self.transport {
            Some(transport) => {
                // A finished driver has already queued its Close.
                if transport.is_alive() {
                    debug!("[{}] closing socket {}", self.id(), transport.generation());
                    transport.close();
                    self.set_ready(ReadyState::Closing);
                }
            }
            None => {
                let _ = self.signals.send(TransportSignal {
                    generation: self.generation,
                    event: TransportEvent::Close,
                });
            }
        }
    }

    fn create_web_socket(&mut self) {
        let Some(url) = self.handle.shared.server_url.clone() else {
            warn!("[{}] createWebSocket on a link without a server URL", self.id());
            return;
        };
        self.generation += 1;
        debug!("[{}] dialling {url} (attempt {})", self.id(), self.generation);
        self.transport = Some(transport::dial(
            url,
            self.generation,
            self.signals.clone(),
            self.options,
        ));
        self.set_ready(ReadyState::Connecting);
    }

    fn emit(&mut self, tag: &str) {
        let peer_identity = self.last_peer.clone();
        if tag == "close" || tag == "closed" {
            self.detach();
        }
        self.bus.publish_lifecycle(&LifecycleEvent {
            connection_id: self.id(),
            role: self.handle.role(),
            tag: tag.to_string(),
            peer_identity,
            server_url: self.handle.server_url().map(str::to_string),
        });
    }

    /// Forget the current socket: later events from it are ignored.
    fn detach(&mut self) {
        self.generation += 1;
        self.transport = None;
        self.probes.clear();
        let mut status = self.handle.status_mut();
        status.ready = ReadyState::Closed;
        status.peer_identity = None;
    }

    // -- requests from handles ----------------------------------------------

    fn write(&self, text: String, ack: WriteAck) {
        match &self.transport {
            Some(transport) if self.handle.ready_state() == ReadyState::Open => {
                transport.send_text(text, Some(ack))
            }
            _ => {
                let _ = ack.send(Err(MessagingError::NotConnected));
            }
        }
    }

    fn probe(&mut self, sent: WriteAck, pong: oneshot::Sender<()>) {
        let Some(transport) = &self.transport else {
            let _ = sent.send(Err(MessagingError::NotConnected));
            return;
        };
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let token = now.max(self.last_probe_token + 1);
        self.last_probe_token = token;

        self.probes.retain(|_, waiter| !waiter.is_closed());
        self.probes.insert(token, pong);
        transport.ping(token.to_string().into_bytes(), Some(sent));
    }

    fn resolve_probe(&mut self, payload: &[u8]) {
        let token = std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(waiter) = token.and_then(|t| self.probes.remove(&t)) {
            let _ = waiter.send(());
        }
    }

    fn receive(&mut self, text: &str) {
        match Frame::parse(text) {
            Frame::Identity(identity) => {
                info!("[{}] peer identified as '{identity}'", self.id());
                self.handle.status_mut().peer_identity = Some(identity.clone());
                self.last_peer = Some(identity);
                self.bus.publish_connection(&self.handle);
            }
            Frame::Message(message) => {
                if let InboundMessage::Unknown { .. } = message {
                    warn!("[{}] received malformed frame", self.id());
                }
                self.bus.publish_message(&message);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    engine: Engine<Link>,
    link: Link,
    mailbox: mpsc::UnboundedReceiver<Input>,
    signals: mpsc::UnboundedReceiver<TransportSignal>,
    close_waiters: Vec<oneshot::Sender<()>>,
    close_requested: bool,
}

impl Actor {
    async fn run(mut self) {
        self.dispatch(tables::INIT);

        while !self.engine.is_terminal() {
            tokio::select! {
                input = self.mailbox.recv() => match input {
                    Some(Input::Send { text, ack }) => self.link.write(text, ack),
                    Some(Input::Probe { sent, pong }) => self.link.probe(sent, pong),
                    Some(Input::TimerExpired(id)) => {
                        self.engine.expire_timer(&mut self.link, id);
                        self.after_transition();
                    }
                    Some(Input::Close { done }) => self.request_close(done),
                    Some(Input::Shutdown) | None => break,
                },
                Some(signal) = self.signals.recv() => self.on_signal(signal),
            }
        }

        debug!(
            "[{}] link stopped in state '{}'",
            self.link.id(),
            self.engine.current_state()
        );
        self.link.detach();
        self.mailbox.close();
        // Dropping the waiters releases every pending `close()`.
        self.close_waiters.clear();
    }

    fn request_close(&mut self, done: oneshot::Sender<()>) {
        let handled = self.dispatch(tables::CLOSE_CONNECTION);
        if handled || self.close_requested {
            self.close_requested = true;
            self.close_waiters.push(done);
        } else {
            let _ = done.send(());
        }
    }

    fn on_signal(&mut self, signal: TransportSignal) {
        if signal.generation != self.link.generation {
            trace!(
                "[{}] dropping {:?} from stale socket {}",
                self.link.id(),
                signal.event,
                signal.generation
            );
            return;
        }

        match signal.event {
            TransportEvent::Open => {
                self.link.set_ready(ReadyState::Open);
                self.dispatch(tables::OPEN);
            }
            TransportEvent::Message(text) => self.link.receive(&text),
            TransportEvent::Ping => trace!("[{}] ping", self.link.id()),
            TransportEvent::Pong(payload) => {
                self.link.resolve_probe(&payload);
                self.dispatch(tables::PONG);
            }
            TransportEvent::Error(e) => {
                debug!("[{}] socket error: {e}", self.link.id());
                self.dispatch(tables::ERROR);
            }
            TransportEvent::UnexpectedResponse(status) => {
                debug!("[{}] unexpected HTTP {status}", self.link.id());
                self.dispatch(tables::UNEXPECTED_RESPONSE);
            }
            TransportEvent::Close => {
                self.link.transport = None;
                self.link.probes.clear();
                {
                    let mut status = self.link.handle.status_mut();
                    status.ready = ReadyState::Closed;
                    status.peer_identity = None;
                }
                self.dispatch(tables::CLOSE);
            }
        }
    }

    /// Feed `event` to the machine. Returns whether a transition fired.
    fn dispatch(&mut self, event: &str) -> bool {
        let fired = self.engine.handle_event(&mut self.link, event).is_some();
        self.after_transition();
        fired
    }

    fn after_transition(&mut self) {
        if let Some(timer) = self.engine.take_armed_timer() {
            let mailbox = self.link.handle.shared.mailbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timer.delay).await;
                let _ = mailbox.send(Input::TimerExpired(timer.id));
            });
        }
        self.link.handle.status_mut().state = self.engine.current_state().to_string();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn options() -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_millis(500),
        }
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// A listener that turns every accepted socket into an inbound link.
    async fn listen(identity: &str, bus: Arc<EventBus>) -> (String, mpsc::UnboundedReceiver<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = identity.to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let conn = Connection::accept(ws, identity.clone(), Arc::clone(&bus), options()).unwrap();
                let _ = tx.send(conn);
            }
        });
        (url, rx)
    }

    #[test]
    fn test_stub_connectivity_flags() {
        let linked = Connection::stub(Role::Inbound, Some("peer"), None);
        assert!(linked.is_connected());
        assert_eq!(linked.role().to_string(), "inbound");

        let pending = Connection::stub(Role::Outbound, None, Some("ws://x:1/"));
        assert!(!pending.is_connected());
        assert_eq!(pending.server_url(), Some("ws://x:1/"));
        assert!(pending.is_terminal());
    }

    #[tokio::test]
    async fn test_handshake_and_message_delivery() {
        let server_bus = Arc::new(EventBus::new());
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        server_bus.on_message(Arc::new(move |m: &InboundMessage| sink.lock().push(m.clone())));
        let (url, mut accepted) = listen("server.1", Arc::clone(&server_bus)).await;

        let client_bus = Arc::new(EventBus::new());
        let announced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&announced);
        client_bus.on_connection(Arc::new(move |_: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let client = Connection::dial(url, "client".into(), client_bus, options()).unwrap();
        let inbound = accepted.recv().await.unwrap();

        eventually("client handshake", || client.is_connected()).await;
        eventually("server handshake", || inbound.is_connected()).await;
        assert_eq!(client.peer_identity().as_deref(), Some("server.1"));
        assert_eq!(inbound.peer_identity().as_deref(), Some("client"));
        assert_eq!(announced.load(Ordering::SeqCst), 1);

        let envelope = Envelope::new("client", "server", json!({"n": 1}));
        client.send(&envelope).await.unwrap();
        eventually("delivery", || !received.lock().is_empty()).await;
        assert_eq!(received.lock().as_slice(), &[InboundMessage::Envelope(envelope)]);

        assert!(client.check_connectivity(Duration::from_secs(1)).await);
        assert!(inbound.check_connectivity(Duration::from_secs(1)).await);

        client.close().await;
        assert!(client.is_terminal());
        assert_eq!(client.current_state(), tables::CLOSED);
        assert!(!client.is_connected());
        eventually("inbound close", || inbound.is_terminal()).await;
        assert!(inbound.peer_identity().is_none());
    }

    #[tokio::test]
    async fn test_send_without_socket_fails_cleanly() {
        // Nothing listens on a released port.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let bus = Arc::new(EventBus::new());
        let client = Connection::dial(format!("ws://{addr}/"), "c".into(), bus, options()).unwrap();

        let err = client.send(&Envelope::new("c", "x", json!(null))).await.unwrap_err();
        assert!(matches!(err, MessagingError::NotConnected));
        assert!(!client.check_connectivity(Duration::from_millis(100)).await);

        // Reconnect attempts keep the link alive until it is closed.
        eventually("backoff", || client.current_state() == "waiting to re-open").await;
        assert!(!client.is_terminal());

        tokio::time::timeout(Duration::from_secs(5), client.close()).await.unwrap();
        assert!(client.is_terminal());
    }

    #[tokio::test]
    async fn test_lifecycle_close_clears_peer() {
        let server_bus = Arc::new(EventBus::new());
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        server_bus.on_lifecycle(Arc::new(move |e: &LifecycleEvent| sink.lock().push(e.clone())));
        let (url, mut accepted) = listen("server", Arc::clone(&server_bus)).await;

        let client = Connection::dial(url, "client".into(), Arc::new(EventBus::new()), options()).unwrap();
        let inbound = accepted.recv().await.unwrap();
        eventually("server handshake", || inbound.is_connected()).await;

        client.close().await;
        eventually("inbound close", || !events.lock().is_empty()).await;
        let event = events.lock()[0].clone();
        assert_eq!(event.tag, "close");
        assert_eq!(event.role, Role::Inbound);
        assert_eq!(event.peer_identity.as_deref(), Some("client"));
        assert!(inbound.peer_identity().is_none());

        // Inbound links have no graceful close command.
        tokio::time::timeout(Duration::from_secs(1), inbound.close()).await.unwrap();
    }
}
