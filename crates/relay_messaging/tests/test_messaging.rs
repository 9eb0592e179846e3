use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_messaging::{
    Envelope, InboundMessage, LifecycleEvent, MessagingConfig, MessagingError, MessagingHub,
};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(15), fut)
        .await
        .expect("timed out")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn server(identity: &str) -> (MessagingHub, u16) {
    let hub = MessagingHub::new(MessagingConfig::server(
        identity,
        "127.0.0.1:0".parse().unwrap(),
    ));
    let port = hub.start().await.unwrap().expect("listening hub has a port");
    (hub, port)
}

fn record_messages(hub: &MessagingHub) -> Arc<Mutex<Vec<InboundMessage>>> {
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    hub.on_message(move |m| sink.lock().push(m.clone()));
    inbox
}

fn url(port: u16) -> String {
    format!("ws://127.0.0.1:{port}/")
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_delivered_exactly_once_both_ways() {
    let (a, port) = server("server.7").await;
    let b = MessagingHub::new(MessagingConfig::client("client.1"));
    let a_inbox = record_messages(&a);
    let b_inbox = record_messages(&b);

    b.add_client(&url(port)).unwrap();
    within(b.wait_till_connected("server")).await;
    within(a.wait_till_connected(b.identity())).await;

    a.send_message(b.identity(), json!("hello")).await.unwrap();
    eventually("b receives", || !b_inbox.lock().is_empty()).await;

    // Short name routing: "server" reaches "server.7".
    b.send_message("server", json!({"n": 1})).await.unwrap();
    eventually("a receives", || !a_inbox.lock().is_empty()).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        b_inbox.lock().as_slice(),
        &[InboundMessage::Envelope(Envelope::new(
            "server.7",
            "client.1",
            json!("hello")
        ))]
    );
    assert_eq!(
        a_inbox.lock()[0].to_value(),
        json!({"fromIdentity": "client.1", "to": "server", "message": {"n": 1}})
    );
    assert_eq!(a_inbox.lock().len(), 1);

    within(b.remove_client(&url(port))).await;
    a.stop().await;
}

#[tokio::test]
async fn unknown_identity_is_a_routing_failure() {
    let (a, port) = server("server").await;
    let b = MessagingHub::new(MessagingConfig::client("client"));
    b.add_client(&url(port)).unwrap();
    within(b.wait_till_connected("server")).await;

    let err = b.send_message("nobody", Value::Null).await.unwrap_err();
    assert!(matches!(err, MessagingError::NoRoute(_)));
    assert!(b.send_message("serve", Value::Null).await.is_err());

    within(b.remove_client(&url(port))).await;
    a.stop().await;
}

#[tokio::test]
async fn add_client_twice_keeps_one_connection() {
    let (a, port) = server("server").await;
    let b = MessagingHub::new(MessagingConfig::client("client"));

    b.add_client(&url(port)).unwrap();
    b.add_client(&url(port)).unwrap();
    assert_eq!(b.number_of_connections(), 1);

    within(b.wait_till_connected("server")).await;
    eventually("one inbound link", || a.number_of_connections() == 1).await;

    within(b.remove_client(&url(port))).await;
    a.stop().await;
}

// ---------------------------------------------------------------------------
// Listener lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_hub_on_same_port_reports_address_in_use() {
    let (a, port) = server("first").await;
    let b = MessagingHub::new(MessagingConfig::server(
        "second",
        format!("127.0.0.1:{port}").parse().unwrap(),
    ));

    let started = Instant::now();
    let err = b.start_within(Duration::from_millis(1000)).await.unwrap_err();
    let waited = started.elapsed();

    assert!(err.is_address_in_use(), "unexpected error: {err}");
    assert!(waited >= Duration::from_millis(900), "gave up after {waited:?}");
    assert!(waited < Duration::from_millis(2000), "gave up after {waited:?}");
    assert!(b.server_port().is_none());

    a.stop().await;
}

#[tokio::test]
async fn stop_clears_port_and_connections() {
    let (a, port) = server("server").await;
    let b = MessagingHub::new(MessagingConfig::client("client"));
    b.add_client(&url(port)).unwrap();
    within(a.wait_till_connected("client")).await;
    assert_eq!(a.number_of_connections(), 1);

    a.stop().await;
    assert!(a.server_port().is_none());
    assert_eq!(a.number_of_connections(), 0);

    // The client notices and drops back to reconnecting.
    eventually("client sees close", || b.find_connection("server").is_none()).await;
    within(b.remove_client(&url(port))).await;
}

#[tokio::test]
async fn client_reconnects_after_server_restart() {
    let (a, port) = server("server.1").await;
    let b = MessagingHub::new(MessagingConfig::client("client"));
    let b_inbox = record_messages(&b);
    b.add_client(&url(port)).unwrap();
    within(b.wait_till_connected("server")).await;

    a.stop().await;
    drop(a);
    eventually("link drops", || b.find_connection("server").is_none()).await;

    let restarted = MessagingHub::new(MessagingConfig::server(
        "server.2",
        format!("127.0.0.1:{port}").parse().unwrap(),
    ));
    within(restarted.start_within(Duration::from_secs(5))).await.unwrap();

    let conn = within(b.wait_till_connected("server")).await;
    assert_eq!(conn.peer_identity().as_deref(), Some("server.2"));
    assert_eq!(b.number_of_connections(), 1);

    within(restarted.wait_till_connected("client")).await;
    restarted.send_message("client", json!("back")).await.unwrap();
    eventually("message after reconnect", || !b_inbox.lock().is_empty()).await;

    within(b.remove_client(&url(port))).await;
    restarted.stop().await;
}

#[tokio::test]
async fn remove_client_closes_both_ends() {
    let (a, port) = server("server").await;
    let events: Arc<Mutex<Vec<LifecycleEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    a.on_lifecycle(move |e| sink.lock().push(e.clone()));

    let b = MessagingHub::new(MessagingConfig::client("client"));
    let conn = b.add_client(&url(port)).unwrap();
    within(a.wait_till_connected("client")).await;

    assert!(within(b.remove_client(&url(port))).await);
    assert_eq!(b.number_of_connections(), 0);
    assert!(conn.is_terminal());
    assert_eq!(conn.current_state(), "closed");

    eventually("server sees close", || !events.lock().is_empty()).await;
    let event = events.lock()[0].clone();
    assert_eq!(event.tag, "close");
    assert_eq!(event.peer_identity.as_deref(), Some("client"));
    assert!(a.find_connection("client").is_none());

    a.stop().await;
}

// ---------------------------------------------------------------------------
// Raw peers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_frame_is_delivered_as_unknown() {
    let (a, port) = server("server").await;
    let inbox = record_messages(&a);

    let (mut ws, _) = within(tokio_tungstenite::connect_async(url(port)))
        .await
        .unwrap();

    // The server announces itself first.
    let first = within(ws.next()).await.unwrap().unwrap();
    let Message::Text(text) = first else {
        panic!("expected text frame, got {first:?}");
    };
    let hello: Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(hello, json!({"fromIdentity": "server", "type": "identity"}));

    ws.send(Message::Text("not json".into())).await.unwrap();
    eventually("unknown message", || !inbox.lock().is_empty()).await;
    assert_eq!(
        inbox.lock()[0],
        InboundMessage::Unknown {
            message: "not json".into()
        }
    );

    ws.send(Message::Text(r#"{"hello":"world"}"#.into())).await.unwrap();
    eventually("parsed message", || inbox.lock().len() == 2).await;
    assert_eq!(inbox.lock()[1], InboundMessage::Other(json!({"hello": "world"})));

    // Never mistaken for a handshake.
    assert!(a.find_connection("server").is_none());
    assert_eq!(a.number_of_connections(), 1);

    let _ = ws.close(None).await;
    a.stop().await;
}

#[tokio::test]
async fn plain_http_request_is_rejected() {
    let (a, port) = server("server").await;

    let mut tcp = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    within(tcp.read_to_string(&mut response)).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
    assert!(response.contains("Content-Type: text/plain\r\n"));
    assert!(response.ends_with("\r\n\r\nUpgrade Required"));
    assert_eq!(a.number_of_connections(), 0);

    // The listener keeps serving WebSocket clients.
    let b = MessagingHub::new(MessagingConfig::client("client"));
    b.add_client(&url(port)).unwrap();
    within(a.wait_till_connected("client")).await;
    assert_eq!(a.number_of_connections(), 1);

    within(b.remove_client(&url(port))).await;
    a.stop().await;
}
