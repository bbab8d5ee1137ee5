//! Chat session: one task owns the transport, the conversation and the stream
//! assembler, and applies submissions, socket events and the reconnection timer
//! in arrival order. Renderers observe it through [`ChatSnapshot`]s.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::assembler::{Fold, StreamAssembler};
use crate::config::ClientSettings;
use crate::conversation::{Conversation, Exchange};
use crate::messages::{decode_frame, encode_request};
use crate::transport::{ConnectionState, Inbound, Transport, TransportEvent};

/// Read-only view of the session, republished whenever it changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub exchanges: Vec<Exchange>,
    /// In-progress assistant reply; empty when nothing is streaming.
    pub partial: String,
    pub connection: ConnectionState,
    /// A request has been sent and its terminal frame has not arrived yet.
    pub pending: bool,
}

/// Chat session error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("chat session has ended")]
    SessionClosed,
}

enum Command {
    Submit(String),
    Shutdown,
}

/// Handle to a running chat session.
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ChatSnapshot>,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Spawn a session for `settings` and start connecting. Requires a tokio runtime.
    pub fn connect(settings: &ClientSettings) -> Self {
        let (mut transport, events) =
            Transport::new(settings.server_url.clone(), settings.reconnect_delay);
        if let Err(e) = transport.connect() {
            warn!(error = %e, "initial connection attempt failed");
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let session = Session {
            transport,
            events,
            commands: commands_rx,
            conversation: Conversation::new(),
            assembler: StreamAssembler::new(),
        };
        let (snapshot_tx, snapshot) = watch::channel(session.snapshot());
        let task = tokio::spawn(session.run(snapshot_tx));

        Self {
            commands,
            snapshot,
            task,
        }
    }

    /// Submit a question. Blank text, or text sent while a request is
    /// outstanding, is ignored by the session.
    pub fn submit(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.commands
            .send(Command::Submit(text.into()))
            .map_err(|_| ClientError::SessionClosed)
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ChatSnapshot) -> bool,
    ) -> Result<ChatSnapshot, ClientError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| ClientError::SessionClosed)?;
        Ok(snapshot.clone())
    }

    /// Stop the session: cancels any scheduled reconnection and closes the socket.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        // The session may already be gone; the join below reports that.
        self.commands.send(Command::Shutdown).ok();
        self.task.await.map_err(|_| ClientError::SessionClosed)
    }
}

struct Session {
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    conversation: Conversation,
    assembler: StreamAssembler,
}

impl Session {
    async fn run(mut self, snapshot: watch::Sender<ChatSnapshot>) {
        loop {
            let deadline = self.transport.reconnect_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit(text)) => self.submit(text).await,
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = self.events.recv() => self.on_transport_event(event).await,
                () = reconnect_timer(deadline) => self.transport.reconnect_now(),
            }
            self.publish(&snapshot);
        }
        self.transport.shutdown().await;
        self.publish(&snapshot);
        debug!("chat session stopped");
    }

    async fn submit(&mut self, text: String) {
        if text.trim().is_empty() {
            debug!("ignoring blank submission");
            return;
        }
        if self.assembler.is_pending() {
            debug!("request already outstanding, ignoring submission");
            return;
        }

        // History is the conversation as it stood before this question.
        let frame = encode_request(&text, self.conversation.exchanges());
        self.conversation.push(Exchange::user(text));
        self.assembler.begin();

        let delivery = match frame {
            Ok(frame) => self.transport.send(frame).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match delivery {
            Ok(delivery) => debug!(?delivery, "request handed to transport"),
            Err(error) => {
                warn!(%error, "request could not be delivered");
                self.assembler.fail_delivery(&mut self.conversation);
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match self.transport.handle_event(event).await {
            Some(Inbound::Frame(raw)) => self.on_frame(&raw),
            Some(Inbound::Undelivered(e)) => {
                warn!(error = %e, "queued request was never delivered");
                self.assembler.fail_delivery(&mut self.conversation);
            }
            Some(Inbound::Lost) => {
                if self.assembler.fail_connection(&mut self.conversation) == Fold::Finished {
                    warn!("connection lost with a request outstanding");
                }
            }
            None => {}
        }
    }

    fn on_frame(&mut self, raw: &str) {
        match decode_frame(raw) {
            Ok(message) => {
                let fold = self.assembler.fold(message, &mut self.conversation);
                debug!(?fold, phase = ?self.assembler.phase(), "folded frame");
            }
            Err(e) => {
                warn!(error = %e, frame = %raw, "cannot decode frame");
                self.assembler.fail_decode(&e, &mut self.conversation);
            }
        }
    }

    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            exchanges: self.conversation.exchanges().to_vec(),
            partial: self.assembler.partial().to_string(),
            connection: self.transport.state(),
            pending: self.assembler.is_pending(),
        }
    }

    fn publish(&self, tx: &watch::Sender<ChatSnapshot>) {
        let next = self.snapshot();
        tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
