//! MessagingHub: owns the connection set and routes messages by identity.
//!
//! [`MessagingHub`] is the primary public API of relay_messaging. It manages:
//! - the WebSocket listener (inbound connections)
//! - outbound connections to known servers (`add_client` / `remove_client`)
//! - identity routing for [`send_message`](MessagingHub::send_message)
//! - message, connection and lifecycle subscriptions

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::MessagingConfig;
use crate::connection::{Connection, Role};
use crate::error::MessagingError;
use crate::events::{EventBus, LifecycleEvent};
use crate::identity::{self, resolve_local_identity};
use crate::message::{Envelope, InboundMessage};
use crate::transport;

struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// A message bus endpoint.
///
/// Create one per identity. Call [`start()`](MessagingHub::start) to accept
/// connections (when configured to listen) and [`add_client()`](MessagingHub::add_client)
/// to dial other hubs.
pub struct MessagingHub {
    /// Identity advertised to peers.
    identity: String,
    created_at: DateTime<Utc>,
    config: MessagingConfig,
    bus: Arc<EventBus>,
    /// All links in arrival order.
    connections: Arc<RwLock<Vec<Connection>>>,
    /// Cleared by `stop` so late handshakes are not registered.
    accepting: Arc<AtomicBool>,
    server: Mutex<Option<ServerHandle>>,
}

impl MessagingHub {
    pub fn new(config: MessagingConfig) -> Self {
        let identity = resolve_local_identity(config.identity.as_deref());
        Self {
            identity,
            created_at: Utc::now(),
            config,
            bus: Arc::new(EventBus::new()),
            connections: Arc::new(RwLock::new(Vec::new())),
            accepting: Arc::new(AtomicBool::new(false)),
            server: Mutex::new(None),
        }
    }

    /// The local identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Start listening with the configured bind budget.
    pub async fn start(&self) -> Result<Option<u16>, MessagingError> {
        self.start_within(self.config.start_timeout).await
    }

    /// Start listening, retrying while the address is in use for up to
    /// `timeout`. Returns the bound port, or `None` for a client-only hub.
    pub async fn start_within(&self, timeout: Duration) -> Result<Option<u16>, MessagingError> {
        let Some(addr) = self.config.listen_addr else {
            debug!("Hub '{}' is client-only", self.identity);
            return Ok(None);
        };
        if let Some(port) = self.server_port() {
            return Ok(Some(port));
        }

        let listener =
            transport::bind_with_retry(addr, timeout, self.config.bind_retry_interval).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        self.accepting.store(true, Ordering::SeqCst);

        let connections = Arc::clone(&self.connections);
        let accepting = Arc::clone(&self.accepting);
        let bus = Arc::clone(&self.bus);
        let identity = self.identity.clone();
        let options = self.config.transport_options();
        let on_socket = move |ws: WebSocketStream<TcpStream>, peer_addr: SocketAddr| {
            let mut conns = connections.write();
            if !accepting.load(Ordering::SeqCst) {
                debug!("Dropping late connection from {peer_addr}");
                return;
            }
            match Connection::accept(ws, identity.clone(), Arc::clone(&bus), options) {
                Ok(conn) => {
                    debug!("Inbound connection {} from {peer_addr}", conn.id());
                    conns.push(conn);
                }
                Err(e) => warn!("Cannot set up connection from {peer_addr}: {e}"),
            }
        };
        let task = tokio::spawn(transport::serve(listener, on_socket, options, shutdown_rx));

        *self.server.lock() = Some(ServerHandle {
            local_addr,
            shutdown,
            task,
        });
        info!("Hub '{}' listening on {local_addr}", self.identity);
        Ok(Some(local_addr.port()))
    }

    /// Stop listening and drop every connection.
    ///
    /// Outbound links are asked to close but not awaited; call
    /// [`remove_client`](Self::remove_client) first for a clean shutdown.
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let server = self.server.lock().take();
        if let Some(server) = server {
            let _ = server.shutdown.send(());
            if let Err(e) = server.task.await {
                warn!("Listener task ended abnormally: {e}");
            }
        }

        let drained: Vec<Connection> = self.connections.write().drain(..).collect();
        for conn in &drained {
            match conn.role() {
                Role::Outbound => conn.request_close(),
                Role::Inbound => conn.shutdown(),
            }
        }
        info!(
            "Hub '{}' stopped ({} connections dropped)",
            self.identity,
            drained.len()
        );
    }

    /// Port of the running listener.
    pub fn server_port(&self) -> Option<u16> {
        self.server.lock().as_ref().map(|s| s.local_addr.port())
    }

    /// Address of the running listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|s| s.local_addr)
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Dial `server_url` and keep the link up. Adding a URL that already
    /// has a connection returns the existing one.
    pub fn add_client(&self, server_url: &str) -> Result<Connection, MessagingError> {
        let url = transport::normalize_url(server_url)?;

        let mut conns = self.connections.write();
        if let Some(existing) = conns.iter().find(|c| c.server_url() == Some(url.as_str())) {
            debug!("Already connected to {url}");
            return Ok(existing.clone());
        }

        let conn = Connection::dial(
            url.clone(),
            self.identity.clone(),
            Arc::clone(&self.bus),
            self.config.transport_options(),
        )?;
        info!("Hub '{}' added client for {url}", self.identity);
        conns.push(conn.clone());
        Ok(conn)
    }

    /// Remove the outbound link to `server_url` and wait until it has
    /// closed. Returns whether such a link existed.
    pub async fn remove_client(&self, server_url: &str) -> bool {
        let url = transport::normalize_url(server_url).unwrap_or_else(|_| server_url.to_string());

        let removed = {
            let mut conns = self.connections.write();
            conns
                .iter()
                .position(|c| c.server_url() == Some(url.as_str()))
                .map(|i| conns.remove(i))
        };

        match removed {
            Some(conn) => {
                conn.close().await;
                info!("Hub '{}' removed client for {url}", self.identity);
                true
            }
            None => false,
        }
    }

    pub fn number_of_connections(&self) -> usize {
        self.connections.read().len()
    }

    /// Snapshot of all connections in arrival order.
    pub fn connections(&self) -> Vec<Connection> {
        self.connections.read().clone()
    }

    /// First connected link, in arrival order, whose peer is `target` or
    /// lives under it (`"server"` finds `"server.7"`).
    pub fn find_connection(&self, target: &str) -> Option<Connection> {
        self.connections
            .read()
            .iter()
            .filter(|c| c.is_connected())
            .find(|c| {
                c.peer_identity()
                    .is_some_and(|peer| identity::matches(&peer, target))
            })
            .cloned()
    }

    /// Wait until a link to `target` exists and answers a probe.
    ///
    /// There is no overall timeout; wrap the call if one is needed.
    pub async fn wait_till_connected(&self, target: &str) -> Connection {
        loop {
            if let Some(conn) = self.find_connection(target) {
                if conn.check_connectivity(self.config.probe_timeout).await {
                    return conn;
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send `message` to the peer matching `to`.
    pub async fn send_message(&self, to: &str, message: Value) -> Result<(), MessagingError> {
        let Some(conn) = self.find_connection(to) else {
            warn!(
                "Hub '{}' has no connection to '{to}' ({} links)",
                self.identity,
                self.number_of_connections()
            );
            return Err(MessagingError::NoRoute(to.to_string()));
        };
        conn.send(&Envelope::new(self.identity.as_str(), to, message))
            .await
    }

    /// Subscribe to application (and malformed) messages from any link.
    pub fn on_message<F>(&self, listener: F)
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.bus.on_message(Arc::new(listener));
    }

    /// Subscribe to handshakes: called each time a peer announces itself.
    pub fn on_connection<F>(&self, listener: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.bus.on_connection(Arc::new(listener));
    }

    /// Subscribe to lifecycle events emitted by connection state machines.
    pub fn on_lifecycle<F>(&self, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.bus.on_lifecycle(Arc::new(listener));
    }

    pub fn remove_all_message_listeners(&self) {
        self.bus.remove_all_message_listeners();
    }

    pub fn message_listener_count(&self) -> usize {
        self.bus.message_listener_count()
    }
}

impl Drop for MessagingHub {
    fn drop(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);
        if let Some(server) = self.server.get_mut().take() {
            let _ = server.shutdown.send(());
        }
        // Outbound actors hold their own handle and would redial forever.
        for conn in self.connections.write().drain(..) {
            match conn.role() {
                Role::Outbound => conn.request_close(),
                Role::Inbound => conn.shutdown(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn hub_with(peers: &[(&str, bool)]) -> MessagingHub {
        let hub = MessagingHub::new(MessagingConfig::client("local"));
        {
            let mut conns = hub.connections.write();
            for (peer, connected) in peers {
                let peer = connected.then_some(*peer);
                conns.push(Connection::stub(Role::Inbound, peer, None));
            }
        }
        hub
    }

    fn peer_of(conn: Option<Connection>) -> Option<String> {
        conn.and_then(|c| c.peer_identity())
    }

    #[test]
    fn test_find_connection_hierarchy() {
        let hub = hub_with(&[("server.7", true)]);
        assert_eq!(peer_of(hub.find_connection("server")).as_deref(), Some("server.7"));
        assert_eq!(peer_of(hub.find_connection("server.7")).as_deref(), Some("server.7"));
        assert!(hub.find_connection("serve").is_none());
        assert!(hub.find_connection("server.70").is_none());
        assert!(hub.find_connection("").is_none());
    }

    #[test]
    fn test_find_connection_uses_arrival_order() {
        let hub = hub_with(&[("server.1", true), ("server", true)]);
        assert_eq!(peer_of(hub.find_connection("server")).as_deref(), Some("server.1"));
        assert_eq!(peer_of(hub.find_connection("server.1")).as_deref(), Some("server.1"));

        let hub = hub_with(&[("server", true), ("server.1", true)]);
        assert_eq!(peer_of(hub.find_connection("server")).as_deref(), Some("server"));
    }

    #[test]
    fn test_find_connection_skips_unconnected() {
        let hub = hub_with(&[("server", false)]);
        assert!(hub.find_connection("server").is_none());
    }

    #[test]
    fn test_identity_defaults_to_host_name() {
        let hub = MessagingHub::new(MessagingConfig::default());
        assert!(!hub.identity().is_empty());
        assert!(hub.created_at() <= Utc::now());
    }

    #[tokio::test]
    async fn test_send_message_without_route() {
        let hub = hub_with(&[("other", true)]);
        let err = hub.send_message("server", Value::Null).await.unwrap_err();
        assert!(matches!(err, MessagingError::NoRoute(ref to) if to == "server"));
    }

    #[tokio::test]
    async fn test_client_only_start_is_noop() {
        let hub = MessagingHub::new(MessagingConfig::client("edge"));
        assert_eq!(hub.start().await.unwrap(), None);
        assert!(hub.server_port().is_none());
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_add_client_is_idempotent() {
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let hub = MessagingHub::new(MessagingConfig::client("edge"));

        let first = hub.add_client(&format!("ws://{addr}/")).unwrap();
        let second = hub.add_client(&addr.to_string()).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(hub.number_of_connections(), 1);
        assert_eq!(first.role(), Role::Outbound);

        assert!(matches!(
            hub.add_client("http://example.com/"),
            Err(MessagingError::InvalidUrl { .. })
        ));
        assert_eq!(hub.number_of_connections(), 1);

        let removed = tokio::time::timeout(
            Duration::from_secs(5),
            hub.remove_client(&format!("ws://{addr}/")),
        )
        .await
        .unwrap();
        assert!(removed);
        assert_eq!(hub.number_of_connections(), 0);
        assert!(first.is_terminal());
        assert!(!hub.remove_client(&addr.to_string()).await);
    }

    #[tokio::test]
    async fn test_drop_closes_outbound_links() {
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let hub = MessagingHub::new(MessagingConfig::client("edge"));
        let conn = hub.add_client(&addr.to_string()).unwrap();
        drop(hub);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !conn.is_terminal() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "link still in '{}'",
                conn.current_state()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_listener() {
        let hub = MessagingHub::new(MessagingConfig::server(
            "server",
            "127.0.0.1:0".parse().unwrap(),
        ));
        let port = hub.start().await.unwrap().unwrap();
        assert_ne!(port, 0);
        assert_eq!(hub.server_port(), Some(port));
        assert_eq!(hub.start().await.unwrap(), Some(port));

        hub.stop().await;
        assert!(hub.server_port().is_none());
        assert_eq!(hub.number_of_connections(), 0);
    }
}
