//! Reconnecting WebSocket transport.
//!
//! The transport owns every piece of connection state: the current state, the
//! write half of the live socket, the dial and reader tasks, the single
//! reconnection deadline and a payload waiting for the next open. Socket
//! activity is reported back as [`TransportEvent`]s on one channel so the owner
//! can apply them in order from a single task.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Delay between a lost connection and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connecting,
    Open,
    #[default]
    Closed,
}

/// Transport failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("not connected")]
    NotConnected,
    #[error("transport is shut down")]
    ShutDown,
}

/// Socket activity, tagged with the connection attempt it belongs to.
pub enum TransportEvent {
    Opened { generation: u64, stream: Box<WsStream> },
    Failed { generation: u64, error: String },
    Frame { generation: u64, text: String },
    Closed { generation: u64 },
}

/// What [`Transport::handle_event`] hands back to its owner.
#[derive(Debug)]
pub enum Inbound {
    /// A text frame from the standing connection.
    Frame(String),
    /// A payload accepted by [`Transport::send`] that was never written.
    Undelivered(TransportError),
    /// The standing connection closed; anything in flight on it is gone.
    Lost,
}

/// Outcome of [`Transport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the open connection.
    Sent,
    /// Queued until the connection being dialed opens.
    Deferred,
}

pub struct Transport {
    endpoint: String,
    reconnect_delay: Duration,
    state: ConnectionState,
    generation: u64,
    sink: Option<WsSink>,
    dialing: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    reconnect_at: Option<Instant>,
    queued: Option<String>,
    shut_down: bool,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    /// Create a transport for `endpoint`. Nothing is dialed until [`connect`](Self::connect).
    pub fn new(
        endpoint: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            endpoint: endpoint.into(),
            reconnect_delay,
            state: ConnectionState::Closed,
            generation: 0,
            sink: None,
            dialing: None,
            reader: None,
            reconnect_at: None,
            queued: None,
            shut_down: false,
            events,
        };
        (transport, rx)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identifier of the current connection attempt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the scheduled reconnection fires, if one is scheduled.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Start a new connection attempt, superseding any attempt in progress.
    ///
    /// Fails only when the endpoint cannot be turned into a request; in that
    /// case a reconnection is scheduled before returning.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }
        self.reconnect_at = None;
        self.generation += 1;
        self.drop_connection();

        let request = match self.endpoint.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "cannot build connection request");
                self.state = ConnectionState::Closed;
                self.schedule_reconnect();
                return Err(TransportError::InvalidEndpoint(e));
            }
        };

        debug!(endpoint = %self.endpoint, generation = self.generation, "connecting");
        self.state = ConnectionState::Connecting;
        let generation = self.generation;
        let events = self.events.clone();
        self.dialing = Some(tokio::spawn(async move {
            let event = match tokio_tungstenite::connect_async(request).await {
                Ok((stream, _)) => TransportEvent::Opened {
                    generation,
                    stream: Box::new(stream),
                },
                Err(e) => TransportEvent::Failed {
                    generation,
                    error: e.to_string(),
                },
            };
            let _ = events.send(event);
        }));
        Ok(())
    }

    /// Send `payload`, dialing first when no connection is open.
    pub async fn send(&mut self, payload: String) -> Result<Delivery, TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }
        if self.state == ConnectionState::Open {
            self.write(payload).await?;
            return Ok(Delivery::Sent);
        }
        info!(endpoint = %self.endpoint, "not connected, reconnecting before send");
        self.connect()?;
        self.queued = Some(payload);
        Ok(Delivery::Deferred)
    }

    /// Fire the scheduled reconnection.
    pub fn reconnect_now(&mut self) {
        if self.reconnect_at.take().is_none() {
            return;
        }
        info!(endpoint = %self.endpoint, "attempting to reconnect");
        // A synchronous failure has already rescheduled itself.
        let _ = self.connect();
    }

    /// Apply one event. Events from superseded attempts are dropped.
    pub async fn handle_event(&mut self, event: TransportEvent) -> Option<Inbound> {
        if self.shut_down {
            return None;
        }
        match event {
            TransportEvent::Opened { generation, stream } => {
                if generation != self.generation {
                    debug!(generation, "dropping stale connection");
                    return None;
                }
                self.dialing = None;
                let (sink, stream) = (*stream).split();
                self.sink = Some(sink);
                self.reader = Some(tokio::spawn(pump(generation, stream, self.events.clone())));
                self.state = ConnectionState::Open;
                info!(endpoint = %self.endpoint, "connected");

                let payload = self.queued.take()?;
                match self.write(payload).await {
                    Ok(()) => None,
                    Err(e) => Some(Inbound::Undelivered(e)),
                }
            }
            TransportEvent::Failed { generation, error } => {
                if generation != self.generation {
                    return None;
                }
                self.dialing = None;
                warn!(endpoint = %self.endpoint, %error, "connection failed");
                let undelivered = self
                    .queued
                    .take()
                    .map(|_| Inbound::Undelivered(TransportError::Connect(error)));
                self.lost();
                undelivered
            }
            TransportEvent::Frame { generation, text } => {
                (generation == self.generation && self.state == ConnectionState::Open)
                    .then_some(Inbound::Frame(text))
            }
            TransportEvent::Closed { generation } => {
                if generation != self.generation || self.state == ConnectionState::Closed {
                    return None;
                }
                self.lost();
                Some(Inbound::Lost)
            }
        }
    }

    /// Cancel the pending reconnection and close the live connection for good.
    pub async fn shutdown(&mut self) {
        self.shut_down = true;
        self.reconnect_at = None;
        self.queued = None;
        if let Some(dialing) = self.dialing.take() {
            dialing.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                debug!("close handshake timed out");
            }
        }
        self.state = ConnectionState::Closed;
        info!(endpoint = %self.endpoint, "transport shut down");
    }

    async fn write(&mut self, payload: String) -> Result<(), TransportError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let result = sink.send(Message::Text(payload)).await;
        if let Err(e) = result {
            warn!(error = %e, "write failed, dropping connection");
            self.lost();
            return Err(TransportError::Send(e));
        }
        Ok(())
    }

    /// The standing connection is gone: mark closed and schedule a retry.
    fn lost(&mut self) {
        self.drop_connection();
        self.state = ConnectionState::Closed;
        info!(endpoint = %self.endpoint, "disconnected");
        self.schedule_reconnect();
    }

    fn drop_connection(&mut self) {
        if let Some(dialing) = self.dialing.take() {
            dialing.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.sink = None;
    }

    fn schedule_reconnect(&mut self) {
        if self.shut_down {
            return;
        }
        let deadline = Instant::now() + self.reconnect_delay;
        if self.reconnect_at.replace(deadline).is_some() {
            debug!("replaced pending reconnection");
        } else {
            debug!(delay = ?self.reconnect_delay, "reconnection scheduled");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

/// Forward frames from one connection until it closes or errors.
async fn pump(
    generation: u64,
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => {
                if events.send(TransportEvent::Frame { generation, text }).is_err() {
                    return;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "connection error");
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed { generation });
}
