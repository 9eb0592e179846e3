//! WebSocket transport: listener, dialer and per-socket driver task.
//!
//! Each socket is owned by one background task that both reads frames and
//! executes write commands, so every socket reports exactly one
//! [`TransportEvent::Close`] no matter how it ends. Events are tagged with
//! the generation number chosen by the owning connection; a connection
//! "detaches" from a socket simply by moving to a new generation.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, trace, warn};

use crate::error::MessagingError;

/// Smallest pause between two bind attempts.
const MIN_BIND_RETRY: Duration = Duration::from_millis(10);

/// How much of a request head is inspected before the upgrade.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

const UPGRADE_REQUIRED_BODY: &str = "Upgrade Required";

/// Timeouts applied by the transport layer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransportOptions {
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
}

/// Something that happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportEvent {
    Open,
    Message(String),
    Ping,
    Pong(Vec<u8>),
    Error(String),
    UnexpectedResponse(u16),
    Close,
}

/// A [`TransportEvent`] stamped with the generation of its socket.
#[derive(Debug)]
pub(crate) struct TransportSignal {
    pub generation: u64,
    pub event: TransportEvent,
}

pub(crate) type SignalSender = mpsc::UnboundedSender<TransportSignal>;

/// Completion of a write: `Ok` once the frame was handed to the socket.
pub(crate) type WriteAck = oneshot::Sender<Result<(), MessagingError>>;

enum Command {
    Text { text: String, ack: Option<WriteAck> },
    Ping { payload: Vec<u8>, ack: Option<WriteAck> },
    Close,
}

/// Handle to a socket's driver task. Dropping it closes the socket.
pub(crate) struct Transport {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl Transport {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once the driver task has finished.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Queue a text frame. A dead transport drops `ack`, which the waiting
    /// side observes as a failure.
    pub fn send_text(&self, text: String, ack: Option<WriteAck>) {
        let _ = self.commands.send(Command::Text { text, ack });
    }

    /// Queue a ping carrying `payload`.
    pub fn ping(&self, payload: Vec<u8>, ack: Option<WriteAck>) {
        let _ = self.commands.send(Command::Ping { payload, ack });
    }

    /// Start the close handshake.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Wrap an accepted server-side socket. The socket is already open.
pub(crate) fn attach<S>(
    ws: WebSocketStream<S>,
    generation: u64,
    signals: SignalSender,
    options: TransportOptions,
) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (commands, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(drive(ws, command_rx, generation, signals, options));
    Transport {
        generation,
        commands,
    }
}

/// Dial `url` in the background. Reports `Open` on success; a failed
/// attempt reports `Error` (or `UnexpectedResponse`) followed by `Close`.
pub(crate) fn dial(
    url: String,
    generation: u64,
    signals: SignalSender,
    options: TransportOptions,
) -> Transport {
    let (commands, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let emit = |event| {
            let _ = signals.send(TransportSignal { generation, event });
        };

        match tokio::time::timeout(options.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => {
                debug!("Connected to {url}");
                emit(TransportEvent::Open);
                drive(ws, command_rx, generation, signals, options).await;
            }
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                debug!("Unexpected HTTP {status} from {url}");
                emit(TransportEvent::UnexpectedResponse(status));
                emit(TransportEvent::Close);
            }
            Ok(Err(e)) => {
                debug!("Connect to {url} failed: {e}");
                emit(TransportEvent::Error(e.to_string()));
                emit(TransportEvent::Close);
            }
            Err(_) => {
                debug!("Connect to {url} timed out");
                emit(TransportEvent::Error(format!(
                    "connect timed out after {:?}",
                    options.connect_timeout
                )));
                emit(TransportEvent::Close);
            }
        }
    });
    Transport {
        generation,
        commands,
    }
}

/// Own one socket until it closes: forward incoming frames as events and
/// execute queued commands. Emits `Close` exactly once, on exit.
async fn drive<S>(
    mut ws: WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    generation: u64,
    signals: SignalSender,
    options: TransportOptions,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let emit = |event| {
        let _ = signals.send(TransportSignal { generation, event });
    };
    let mut close_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => emit(TransportEvent::Message(text.to_string())),
                Some(Ok(Message::Binary(data))) => {
                    emit(TransportEvent::Message(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(Message::Ping(_))) => emit(TransportEvent::Ping),
                Some(Ok(Message::Pong(payload))) => emit(TransportEvent::Pong(payload.to_vec())),
                Some(Ok(Message::Close(_))) => trace!("Peer sent close (generation {generation})"),
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    debug!("Read error (generation {generation}): {e}");
                    emit(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },

            command = commands.recv(), if close_deadline.is_none() => match command {
                Some(Command::Text { text, ack }) => {
                    let result = ws.send(Message::Text(text.into())).await;
                    complete(ack, result);
                }
                Some(Command::Ping { payload, ack }) => {
                    let result = ws.send(Message::Ping(payload.into())).await;
                    complete(ack, result);
                }
                Some(Command::Close) | None => {
                    if let Err(e) = ws.close(None).await {
                        trace!("Close frame not sent (generation {generation}): {e}");
                    }
                    close_deadline = Some(Instant::now() + options.close_timeout);
                }
            },

            _ = tokio::time::sleep_until(close_deadline.unwrap_or_else(Instant::now)),
                if close_deadline.is_some() =>
            {
                debug!("Close handshake timed out (generation {generation})");
                break;
            }
        }
    }

    emit(TransportEvent::Close);
}

fn complete(ack: Option<WriteAck>, result: Result<(), tungstenite::Error>) {
    if let Some(ack) = ack {
        let _ = ack.send(result.map_err(|e| MessagingError::Transport(e.to_string())));
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Bind `addr`, retrying while it is in use until `budget` elapses.
pub(crate) async fn bind_with_retry(
    addr: SocketAddr,
    budget: Duration,
    retry_interval: Duration,
) -> Result<TcpListener, MessagingError> {
    let deadline = Instant::now() + budget;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!("Address {addr} still in use after {budget:?}, giving up");
                    return Err(MessagingError::AddressInUse {
                        addr,
                        waited: budget,
                    });
                }
                trace!("Address {addr} in use, retrying");
                tokio::time::sleep(remaining.min(retry_interval).max(MIN_BIND_RETRY)).await;
            }
            Err(e) => return Err(MessagingError::Io(e)),
        }
    }
}

/// Accept loop: upgrade every TCP connection and hand the socket to
/// `on_socket`. Plain HTTP requests get `426 Upgrade Required`.
pub(crate) async fn serve<F>(
    listener: TcpListener,
    on_socket: F,
    options: TransportOptions,
    mut shutdown: broadcast::Receiver<()>,
) where
    F: Fn(WebSocketStream<TcpStream>, SocketAddr) + Clone + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket server listening on {addr}");
    }

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let on_socket = on_socket.clone();
                        tokio::spawn(async move {
                            let head = tokio::time::timeout(
                                options.connect_timeout,
                                requests_upgrade(&stream),
                            )
                            .await;
                            match head {
                                Ok(Ok(true)) => {}
                                Ok(Ok(false)) => {
                                    reject_plain_http(stream, peer_addr, options.close_timeout).await;
                                    return;
                                }
                                Ok(Err(e)) => {
                                    debug!("Reading request from {peer_addr} failed: {e}");
                                    return;
                                }
                                Err(_) => {
                                    debug!("No request from {peer_addr} within {:?}", options.connect_timeout);
                                    return;
                                }
                            }
                            match accept_async(stream).await {
                                Ok(ws) => on_socket(ws, peer_addr),
                                Err(e) => debug!("WebSocket handshake with {peer_addr} failed: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("WebSocket server shutting down");
                break;
            }
        }
    }
}

/// Peek at the request head (without consuming it) and report whether it
/// asks for a WebSocket upgrade.
async fn requests_upgrade(stream: &TcpStream) -> io::Result<bool> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    loop {
        let n = stream.peek(&mut buf).await?;
        let head = &buf[..n];
        let complete = head.windows(4).any(|w| w == b"\r\n\r\n");
        if n == 0 || complete || n == buf.len() {
            return Ok(String::from_utf8_lossy(head)
                .lines()
                .filter_map(|line| line.split_once(':'))
                .any(|(name, value)| {
                    name.trim().eq_ignore_ascii_case("upgrade")
                        && value.to_ascii_lowercase().contains("websocket")
                }));
        }
        // Peek returns at once while the head is still partial.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn reject_plain_http(mut stream: TcpStream, peer_addr: SocketAddr, linger: Duration) {
    debug!("Rejecting non-WebSocket request from {peer_addr}");
    // Consume the peeked head so closing does not reset the connection.
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    if let Err(e) = stream.read(&mut buf).await {
        debug!("Reading request from {peer_addr} failed: {e}");
        return;
    }
    let response = format!(
        "HTTP/1.1 426 Upgrade Required\r\n\
         Content-Length: {}\r\n\
         Content-Type: text/plain\r\n\
         Connection: close\r\n\r\n{UPGRADE_REQUIRED_BODY}",
        UPGRADE_REQUIRED_BODY.len()
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("Cannot answer {peer_addr}: {e}");
        return;
    }
    let _ = stream.shutdown().await;
    // Let the client read the reply and hang up first.
    let _ = tokio::time::timeout(linger, async {
        while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
    })
    .await;
}

/// Accept `ws://`, `wss://` or a bare `host:port`; reject other schemes.
pub(crate) fn normalize_url(raw: &str) -> Result<String, MessagingError> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("ws://{raw}")
    };
    let parsed = url::Url::parse(&candidate).map_err(|e| MessagingError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" if parsed.host().is_some() => Ok(parsed.to_string()),
        "ws" | "wss" => Err(MessagingError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        }),
        other => Err(MessagingError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
