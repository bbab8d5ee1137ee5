//! Folds decoded server frames into the conversation.
//!
//! The service may open a reply with a `"Thinking..."` chunk before any real
//! content exists. That placeholder is shown as the partial answer until real
//! content arrives, then replaced, and it is never appended after real content.

use tracing::{debug, warn};

use crate::conversation::{Conversation, Exchange, Source};
use crate::messages::{DecodeError, ServerMessage};

/// Chunk content the service sends while it is still working.
pub const PLACEHOLDER: &str = "Thinking...";

/// Substituted for a `complete` frame with blank content.
pub const EMPTY_ANSWER_FALLBACK: &str =
    "I'm sorry, I couldn't generate a response. Please try again.";

/// Shown when a request could not be handed to the transport.
pub const UNDELIVERED_MESSAGE: &str = "Error: Could not connect to server. Please try again later.";

/// Shown when the connection drops while an answer is outstanding.
pub const CONNECTION_LOST_MESSAGE: &str =
    "Error: Connection lost before the answer arrived. Please try again.";

/// Progress of the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Awaiting,
    Streaming,
    Done,
}

/// What a fold did to the state, for logging and rendering decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    /// Partial answer changed.
    Partial,
    /// A terminal frame appended an exchange.
    Finished,
    /// Nothing changed.
    Ignored,
}

/// Owns the in-flight partial answer and the pending-request state.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    phase: Phase,
    partial: String,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// True between [`begin`](Self::begin) and the request's terminal frame.
    pub fn is_pending(&self) -> bool {
        matches!(self.phase, Phase::Awaiting | Phase::Streaming)
    }

    /// Start tracking a new request.
    pub fn begin(&mut self) {
        self.partial.clear();
        self.phase = Phase::Awaiting;
    }

    pub fn fold(&mut self, message: ServerMessage, conversation: &mut Conversation) -> Fold {
        match message {
            ServerMessage::Unknown(raw) => {
                warn!(frame = %raw, "ignoring frame with unknown type");
                Fold::Ignored
            }
            message if !self.is_pending() => {
                warn!(?message, "ignoring frame with no request outstanding");
                Fold::Ignored
            }
            ServerMessage::Chunk(content) => self.push_chunk(content),
            ServerMessage::Complete { content, sources } => {
                self.complete(content, sources, conversation);
                Fold::Finished
            }
            ServerMessage::Error(content) => {
                warn!(%content, "service reported an error");
                self.finish(Exchange::error(format!("Error: {content}")), conversation);
                Fold::Finished
            }
        }
    }

    /// Terminate the request because the connection carrying it went away.
    pub fn fail_connection(&mut self, conversation: &mut Conversation) -> Fold {
        if !self.is_pending() {
            return Fold::Ignored;
        }
        self.finish(Exchange::error(CONNECTION_LOST_MESSAGE), conversation);
        Fold::Finished
    }

    /// Terminate the request after a frame that could not be decoded.
    pub fn fail_decode(&mut self, err: &DecodeError, conversation: &mut Conversation) -> Fold {
        if !self.is_pending() {
            warn!(error = %err, "undecodable frame with no request outstanding");
            return Fold::Ignored;
        }
        self.finish(
            Exchange::error(format!("Error processing response: {err}")),
            conversation,
        );
        Fold::Finished
    }

    /// Terminate the request because it never reached the service.
    pub fn fail_delivery(&mut self, conversation: &mut Conversation) -> Fold {
        if !self.is_pending() {
            return Fold::Ignored;
        }
        self.finish(Exchange::error(UNDELIVERED_MESSAGE), conversation);
        Fold::Finished
    }

    fn push_chunk(&mut self, content: String) -> Fold {
        if content == PLACEHOLDER && !self.partial.is_empty() {
            debug!("dropping late placeholder chunk");
            return Fold::Ignored;
        }
        if self.partial == PLACEHOLDER {
            self.partial = content;
        } else {
            self.partial.push_str(&content);
        }
        self.phase = Phase::Streaming;
        Fold::Partial
    }

    fn complete(&mut self, content: String, sources: Vec<Source>, conversation: &mut Conversation) {
        let content = if content.trim().is_empty() {
            warn!("service completed with an empty answer");
            EMPTY_ANSWER_FALLBACK.to_string()
        } else {
            content
        };
        self.finish(Exchange::assistant(content, sources), conversation);
    }

    fn finish(&mut self, exchange: Exchange, conversation: &mut Conversation) {
        conversation.push(exchange);
        self.partial.clear();
        self.phase = Phase::Done;
    }
}
