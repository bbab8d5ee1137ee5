//! Integration tests for the reconnecting transport: scheduling, teardown and
//! send-on-open, against a real in-process WebSocket server (no mocks).

use futures_util::{SinkExt, StreamExt};
use mind_search_client::transport::{Delivery, Inbound, TransportEvent};
use mind_search_client::{ConnectionState, Transport, TransportError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const FAR_FUTURE: Duration = Duration::from_secs(60);

fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

fn unreachable_url() -> String {
    format!("ws://127.0.0.1:{}/ws", free_port())
}

/// Accept connections forever and forward every text frame to the returned channel.
async fn spawn_recording_server() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (tcp, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        let _ = tx.send(text);
                    }
                }
            });
        }
    });
    (format!("ws://127.0.0.1:{}/ws", port), rx)
}

/// Accept connections and close each one from the server side right after the handshake.
async fn spawn_closing_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                let _ = ws.send(Message::Close(None)).await;
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    format!("ws://127.0.0.1:{}/ws", port)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("transport event should arrive")
        .expect("event channel open")
}

#[tokio::test]
async fn repeated_failures_keep_a_single_pending_reconnect() {
    let (mut transport, mut events) = Transport::new(unreachable_url(), FAR_FUTURE);
    transport.connect().expect("endpoint is valid");

    for attempt in 0..3 {
        assert_eq!(transport.state(), ConnectionState::Connecting);
        assert!(transport.reconnect_deadline().is_none());

        let event = next_event(&mut events).await;
        assert!(matches!(event, TransportEvent::Failed { .. }));
        assert!(transport.handle_event(event).await.is_none());

        assert_eq!(transport.state(), ConnectionState::Closed, "attempt {}", attempt);
        let scheduled = transport.reconnect_deadline();
        assert!(scheduled.is_some(), "attempt {} should schedule a retry", attempt);

        // A duplicate close for the same attempt neither stacks nor moves the retry.
        let generation = transport.generation();
        assert!(transport
            .handle_event(TransportEvent::Closed { generation })
            .await
            .is_none());
        assert_eq!(transport.reconnect_deadline(), scheduled);

        transport.reconnect_now();
    }
}

#[tokio::test]
async fn shutdown_cancels_pending_reconnect() {
    let (mut transport, mut events) = Transport::new(unreachable_url(), FAR_FUTURE);
    transport.connect().unwrap();
    let event = next_event(&mut events).await;
    transport.handle_event(event).await;
    assert!(transport.reconnect_deadline().is_some());

    transport.shutdown().await;
    assert!(transport.is_shut_down());
    assert!(transport.reconnect_deadline().is_none());
    assert_eq!(transport.state(), ConnectionState::Closed);

    let generation = transport.generation();
    transport
        .handle_event(TransportEvent::Failed {
            generation,
            error: "late".into(),
        })
        .await;
    assert!(transport.reconnect_deadline().is_none());

    transport.reconnect_now();
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(matches!(transport.connect(), Err(TransportError::ShutDown)));
    assert!(matches!(
        transport.send("late".into()).await,
        Err(TransportError::ShutDown)
    ));
}

#[tokio::test]
async fn send_while_closed_dials_then_delivers_exactly_once() {
    let (url, mut received) = spawn_recording_server().await;
    let (mut transport, mut events) = Transport::new(url, FAR_FUTURE);
    assert_eq!(transport.state(), ConnectionState::Closed);

    let delivery = transport.send("first".into()).await.unwrap();
    assert_eq!(delivery, Delivery::Deferred);
    assert_eq!(transport.state(), ConnectionState::Connecting);

    let event = next_event(&mut events).await;
    assert!(matches!(event, TransportEvent::Opened { .. }));
    assert!(transport.handle_event(event).await.is_none());
    assert_eq!(transport.state(), ConnectionState::Open);

    let delivered = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap();
    assert_eq!(delivered.as_deref(), Some("first"));

    // The new connection is now the standing one.
    let delivery = transport.send("second".into()).await.unwrap();
    assert_eq!(delivery, Delivery::Sent);
    let delivered = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap();
    assert_eq!(delivered.as_deref(), Some("second"));
    assert!(received.try_recv().is_err(), "each payload is sent once");

    transport.shutdown().await;
}

#[tokio::test]
async fn invalid_endpoint_fails_without_dialing() {
    let (mut transport, _events) = Transport::new("not a url", FAR_FUTURE);

    let err = transport.send("payload".into()).await.unwrap_err();
    assert!(matches!(err, TransportError::InvalidEndpoint(_)));
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(
        transport.reconnect_deadline().is_some(),
        "background reconnection keeps going"
    );
}

#[tokio::test]
async fn failed_dial_reports_queued_payload_as_undelivered() {
    let (mut transport, mut events) = Transport::new(unreachable_url(), FAR_FUTURE);
    assert_eq!(
        transport.send("payload".into()).await.unwrap(),
        Delivery::Deferred
    );

    let event = next_event(&mut events).await;
    let inbound = transport.handle_event(event).await;
    assert!(matches!(
        inbound,
        Some(Inbound::Undelivered(TransportError::Connect(_)))
    ));
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(transport.reconnect_deadline().is_some());
}

#[tokio::test]
async fn events_from_superseded_attempts_are_ignored() {
    let (mut transport, _events) = Transport::new(unreachable_url(), FAR_FUTURE);
    transport.connect().unwrap();
    let stale = transport.generation();
    transport.connect().unwrap();
    assert_ne!(transport.generation(), stale);

    let inbound = transport
        .handle_event(TransportEvent::Closed { generation: stale })
        .await;
    assert!(inbound.is_none());
    let inbound = transport
        .handle_event(TransportEvent::Frame {
            generation: stale,
            text: "{}".into(),
        })
        .await;
    assert!(inbound.is_none());
    assert_eq!(transport.state(), ConnectionState::Connecting);
    assert!(transport.reconnect_deadline().is_none());
}

#[tokio::test]
async fn open_connection_closing_is_reported_as_lost() {
    let url = spawn_closing_server().await;
    let (mut transport, mut events) = Transport::new(url, FAR_FUTURE);
    transport.connect().unwrap();

    let opened = next_event(&mut events).await;
    assert!(transport.handle_event(opened).await.is_none());
    assert_eq!(transport.state(), ConnectionState::Open);

    let closed = next_event(&mut events).await;
    assert!(matches!(closed, TransportEvent::Closed { .. }));
    assert!(matches!(
        transport.handle_event(closed).await,
        Some(Inbound::Lost)
    ));
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(transport.reconnect_deadline().is_some());
}

#[tokio::test]
async fn write_failure_on_open_socket_drops_connection_and_schedules_retry() {
    let url = spawn_closing_server().await;
    let (mut transport, mut events) = Transport::new(url, FAR_FUTURE);
    transport.connect().unwrap();

    let opened = next_event(&mut events).await;
    transport.handle_event(opened).await;
    assert_eq!(transport.state(), ConnectionState::Open);

    // The peer has closed, but the close has not been applied yet, so the
    // transport still believes the socket is open and writes to it.
    let closed = next_event(&mut events).await;
    assert_eq!(transport.state(), ConnectionState::Open);
    let err = transport.send("too late".into()).await.unwrap_err();
    assert!(matches!(err, TransportError::Send(_)));
    assert_eq!(transport.state(), ConnectionState::Closed);
    let scheduled = transport.reconnect_deadline();
    assert!(scheduled.is_some());

    // The close that follows belongs to a connection already given up on.
    assert!(transport.handle_event(closed).await.is_none());
    assert_eq!(transport.reconnect_deadline(), scheduled);
}
